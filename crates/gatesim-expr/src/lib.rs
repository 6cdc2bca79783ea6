//! # GateSim Expr
//!
//! Math expression parser/evaluator for model and protocol parameters.
//!
//! Most numeric fields in a GateSim model (rates, charges, probabilities,
//! stimulus shapes, waveforms, summaries) are user-authored strings like
//! `"3.14 * z"` or `"exp(-t / tau)"`. This crate parses and evaluates them
//! against an open symbol table binding names to either a scalar or a
//! length-N sample vector.
//!
//! ## Semantics
//!
//! 1. Operators `+ - * / ^` with the usual precedence, `^` right-associative
//! 2. Unary minus, parenthesized grouping, function calls
//! 3. Operators broadcast element-wise across scalars and equal-length vectors
//! 4. The result is a scalar or a vector; empty input evaluates to scalar 0
//!
//! The evaluator is stateless between calls apart from the per-call symbol
//! table, so a fresh table can be built for every evaluation context (model
//! parameters, per-cell time courses, summary windows).

use std::collections::HashMap;

use gatesim_core::{GateSimError, Result};
use ndarray::Array1;
use once_cell::sync::Lazy;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

// =============================================================================
// GRAMMAR
// =============================================================================

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }

number = @{
    (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
ident = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

add = { "+" }
sub = { "-" }
mul = { "*" }
div = { "/" }
pow = { "^" }
bin_op = _{ add | sub | mul | div | pow }

func_call = { ident ~ "(" ~ expr ~ ("," ~ expr)* ~ ")" }
primary = _{ number | func_call | ident | "(" ~ expr ~ ")" }
unary = { sub* ~ primary }
expr = { unary ~ (bin_op ~ unary)* }

input = _{ SOI ~ expr ~ EOI }
"#]
struct ExprParser;

static PRATT: Lazy<PrattParser<Rule>> = Lazy::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
        .op(Op::infix(Rule::pow, Assoc::Right))
});

// =============================================================================
// VALUES AND BINDINGS
// =============================================================================

/// Evaluation result: a scalar or a sample vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Array1<f64>),
}

impl Value {
    /// Number of samples (1 for a scalar).
    pub fn len(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coerce to a scalar, failing for vectors of length != 1.
    pub fn into_scalar(self, expr: &str) -> Result<f64> {
        match self {
            Value::Scalar(x) => Ok(x),
            Value::Vector(v) if v.len() == 1 => Ok(v[0]),
            Value::Vector(_) => Err(GateSimError::ExprNotScalar(expr.to_string())),
        }
    }

    /// Coerce to a vector of the given length, broadcasting scalars.
    pub fn into_vector(self, len: usize) -> Array1<f64> {
        match self {
            Value::Scalar(x) => Array1::from_elem(len, x),
            Value::Vector(v) => v,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(x) => Value::Scalar(f(x)),
            Value::Vector(v) => Value::Vector(v.mapv(f)),
        }
    }
}

/// Named bindings visible to one evaluation.
///
/// Vectors are borrowed so time axes, stimulus waveforms and probability
/// columns can be bound without copying.
#[derive(Debug, Default)]
pub struct SymbolTable<'a> {
    vars: HashMap<String, Binding<'a>>,
}

#[derive(Debug, Clone, Copy)]
enum Binding<'a> {
    Scalar(f64),
    Vector(&'a [f64]),
}

impl<'a> SymbolTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) {
        self.vars.insert(name.trim().to_string(), Binding::Scalar(value));
    }

    pub fn set_vector(&mut self, name: &str, samples: &'a [f64]) {
        self.vars.insert(name.trim().to_string(), Binding::Vector(samples));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name).map(|binding| match binding {
            Binding::Scalar(x) => Value::Scalar(*x),
            Binding::Vector(v) => Value::Vector(Array1::from_iter(v.iter().copied())),
        })
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Evaluate an expression against a symbol table.
///
/// Empty (or all-whitespace) input evaluates to scalar 0, matching the
/// convention that unset model fields contribute nothing.
pub fn eval(expr: &str, symbols: &SymbolTable) -> Result<Value> {
    if expr.trim().is_empty() {
        return Ok(Value::Scalar(0.0));
    }
    let mut pairs = ExprParser::parse(Rule::input, expr)
        .map_err(|_| GateSimError::ExprParse(expr.to_string()))?;
    let root = pairs.next().ok_or_else(|| GateSimError::ExprParse(expr.to_string()))?;
    eval_expr(root.into_inner(), expr, symbols)
}

/// Evaluate an expression that must reduce to a single number.
pub fn eval_scalar(expr: &str, symbols: &SymbolTable) -> Result<f64> {
    eval(expr, symbols)?.into_scalar(expr)
}

fn eval_expr(pairs: Pairs<Rule>, expr: &str, symbols: &SymbolTable) -> Result<Value> {
    PRATT
        .map_primary(|primary| eval_unary(primary, expr, symbols))
        .map_infix(|lhs, op, rhs| {
            let lhs = lhs?;
            let rhs = rhs?;
            match op.as_rule() {
                Rule::add => broadcast(lhs, rhs, expr, |a, b| a + b),
                Rule::sub => broadcast(lhs, rhs, expr, |a, b| a - b),
                Rule::mul => broadcast(lhs, rhs, expr, |a, b| a * b),
                Rule::div => broadcast(lhs, rhs, expr, |a, b| a / b),
                Rule::pow => broadcast(lhs, rhs, expr, f64::powf),
                _ => Err(GateSimError::ExprParse(expr.to_string())),
            }
        })
        .parse(pairs)
}

fn eval_unary(pair: Pair<Rule>, expr: &str, symbols: &SymbolTable) -> Result<Value> {
    debug_assert_eq!(pair.as_rule(), Rule::unary);
    let mut negate = false;
    let mut value = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::sub => negate = !negate,
            _ => value = Some(eval_primary(inner, expr, symbols)?),
        }
    }
    let value = value.ok_or_else(|| GateSimError::ExprParse(expr.to_string()))?;
    Ok(if negate { value.map(|x| -x) } else { value })
}

fn eval_primary(pair: Pair<Rule>, expr: &str, symbols: &SymbolTable) -> Result<Value> {
    match pair.as_rule() {
        Rule::number => {
            let x: f64 = pair
                .as_str()
                .parse()
                .map_err(|_| GateSimError::ExprParse(expr.to_string()))?;
            Ok(Value::Scalar(x))
        }
        Rule::ident => symbols
            .get(pair.as_str())
            .ok_or_else(|| GateSimError::ExprParse(expr.to_string())),
        Rule::func_call => {
            let mut inner = pair.into_inner();
            let name = inner
                .next()
                .ok_or_else(|| GateSimError::ExprParse(expr.to_string()))?;
            let args: Vec<Value> = inner
                .map(|arg| eval_expr(arg.into_inner(), expr, symbols))
                .collect::<Result<_>>()?;
            apply_function(name.as_str(), args, expr)
        }
        Rule::expr => eval_expr(pair.into_inner(), expr, symbols),
        _ => Err(GateSimError::ExprParse(expr.to_string())),
    }
}

fn apply_function(name: &str, mut args: Vec<Value>, expr: &str) -> Result<Value> {
    // Reductions collapse a sample vector to a scalar; on a scalar they are
    // the identity. `min`/`max` double as two-argument element-wise forms.
    if args.len() == 1 {
        let reduce: Option<fn(&Array1<f64>) -> f64> = match name {
            "sum" => Some(|v| v.sum()),
            "mean" => Some(|v| v.sum() / v.len() as f64),
            "min" => Some(|v| v.iter().copied().fold(f64::INFINITY, f64::min)),
            "max" => Some(|v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            _ => None,
        };
        if let Some(f) = reduce {
            return Ok(match args.remove(0) {
                Value::Scalar(x) => Value::Scalar(x),
                Value::Vector(v) => Value::Scalar(f(&v)),
            });
        }
    }
    let unary: Option<fn(f64) -> f64> = match name {
        "sqrt" => Some(f64::sqrt),
        "exp" => Some(f64::exp),
        "log" | "ln" => Some(f64::ln),
        "log10" => Some(f64::log10),
        "log2" => Some(f64::log2),
        "abs" => Some(f64::abs),
        "sin" => Some(f64::sin),
        "cos" => Some(f64::cos),
        "tan" => Some(f64::tan),
        "asin" => Some(f64::asin),
        "acos" => Some(f64::acos),
        "atan" => Some(f64::atan),
        "sinh" => Some(f64::sinh),
        "cosh" => Some(f64::cosh),
        "tanh" => Some(f64::tanh),
        "floor" => Some(f64::floor),
        "ceil" => Some(f64::ceil),
        "round" => Some(f64::round),
        _ => None,
    };
    if let Some(f) = unary {
        if args.len() != 1 {
            return Err(GateSimError::ExprParse(expr.to_string()));
        }
        return Ok(args.remove(0).map(f));
    }
    let binary: Option<fn(f64, f64) -> f64> = match name {
        "min" => Some(f64::min),
        "max" => Some(f64::max),
        "atan2" => Some(f64::atan2),
        "pow" => Some(f64::powf),
        _ => None,
    };
    if let Some(f) = binary {
        if args.len() != 2 {
            return Err(GateSimError::ExprParse(expr.to_string()));
        }
        let b = args.remove(1);
        let a = args.remove(0);
        return broadcast(a, b, expr, f);
    }
    Err(GateSimError::ExprParse(expr.to_string()))
}

fn broadcast(lhs: Value, rhs: Value, expr: &str, f: fn(f64, f64) -> f64) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
        (Value::Vector(a), Value::Scalar(b)) => Ok(Value::Vector(a.mapv(|x| f(x, b)))),
        (Value::Scalar(a), Value::Vector(b)) => Ok(Value::Vector(b.mapv(|x| f(a, x)))),
        (Value::Vector(a), Value::Vector(b)) => {
            if a.len() != b.len() {
                return Err(GateSimError::ExprShape {
                    expr: expr.to_string(),
                    detail: format!("{} vs {} samples", a.len(), b.len()),
                });
            }
            Ok(Value::Vector(
                a.iter().zip(b.iter()).map(|(x, y)| f(*x, *y)).collect(),
            ))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scalar(expr: &str) -> f64 {
        eval_scalar(expr, &SymbolTable::new()).unwrap()
    }

    #[test]
    fn test_literals_and_precedence() {
        assert_relative_eq!(scalar("2 + 3 * 4"), 14.0);
        assert_relative_eq!(scalar("(2 + 3) * 4"), 20.0);
        assert_relative_eq!(scalar("2 ^ 3 ^ 2"), 512.0); // right-assoc
        assert_relative_eq!(scalar("-2 ^ 2"), 4.0); // unary binds the base
        assert_relative_eq!(scalar("10 - 4 - 3"), 3.0);
        assert_relative_eq!(scalar("1.5e2"), 150.0);
        assert_relative_eq!(scalar(".5"), 0.5);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_relative_eq!(scalar(""), 0.0);
        assert_relative_eq!(scalar("   "), 0.0);
    }

    #[test]
    fn test_functions() {
        assert_relative_eq!(scalar("sqrt(((2 + 0) * -3.14)^2)"), 6.28);
        assert_relative_eq!(scalar("15 * 1 + (0 * 7)^3"), 15.0);
        assert_relative_eq!(scalar("-100.1 - 0 / sqrt(9.45)"), -100.1);
        assert_relative_eq!(scalar("exp(0)"), 1.0);
        assert_relative_eq!(scalar("max(2, 3)"), 3.0);
        assert_relative_eq!(scalar("4.135667662*10^-15"), 4.135667662e-15);
    }

    #[test]
    fn test_variables() {
        let mut symbols = SymbolTable::new();
        symbols.set_scalar("z", 3.0);
        assert_relative_eq!(eval_scalar("3.14 * z", &symbols).unwrap(), 9.42);
        symbols.set_scalar("x", 9.42);
        assert_relative_eq!(eval_scalar("x / 2 * z", &symbols).unwrap(), 14.13);
    }

    #[test]
    fn test_vector_broadcast() {
        let t = [0.0, 1.0, 2.0, 3.0];
        let mut symbols = SymbolTable::new();
        symbols.set_vector("t", &t);
        symbols.set_scalar("a", 2.0);
        let v = eval("a * t + 1", &symbols).unwrap();
        match v {
            Value::Vector(v) => {
                assert_eq!(v.len(), 4);
                assert_relative_eq!(v[3], 7.0);
            }
            Value::Scalar(_) => panic!("expected vector"),
        }
    }

    #[test]
    fn test_vector_vector() {
        let t = [1.0, 2.0];
        let u = [3.0, 5.0];
        let mut symbols = SymbolTable::new();
        symbols.set_vector("t", &t);
        symbols.set_vector("u", &u);
        let v = eval("t * u", &symbols).unwrap();
        assert_eq!(v, Value::Vector(Array1::from(vec![3.0, 10.0])));
    }

    #[test]
    fn test_reductions() {
        let t = [1.0, 2.0, 3.0, 4.0];
        let mut symbols = SymbolTable::new();
        symbols.set_vector("t", &t);
        assert_relative_eq!(eval_scalar("sum(t)", &symbols).unwrap(), 10.0);
        assert_relative_eq!(eval_scalar("mean(t)", &symbols).unwrap(), 2.5);
        assert_relative_eq!(eval_scalar("max(t)", &symbols).unwrap(), 4.0);
        assert_relative_eq!(eval_scalar("min(t)", &symbols).unwrap(), 1.0);
        assert_relative_eq!(eval_scalar("max(t * -1)", &symbols).unwrap(), -1.0);
        // Two-argument min/max stay element-wise.
        assert_relative_eq!(eval_scalar("min(7, 3)", &symbols).unwrap(), 3.0);
        assert_relative_eq!(eval_scalar("sum(5)", &symbols).unwrap(), 5.0);
    }

    #[test]
    fn test_shape_mismatch() {
        let t = [1.0, 2.0];
        let u = [3.0, 5.0, 7.0];
        let mut symbols = SymbolTable::new();
        symbols.set_vector("t", &t);
        symbols.set_vector("u", &u);
        assert!(matches!(
            eval("t + u", &symbols),
            Err(GateSimError::ExprShape { .. })
        ));
    }

    #[test]
    fn test_not_scalar() {
        let t = [1.0, 2.0];
        let mut symbols = SymbolTable::new();
        symbols.set_vector("t", &t);
        assert!(matches!(
            eval_scalar("t + 1", &symbols),
            Err(GateSimError::ExprNotScalar(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(scalar_err("2 +"), GateSimError::ExprParse(_)));
        assert!(matches!(scalar_err("nosuchvar"), GateSimError::ExprParse(_)));
        assert!(matches!(scalar_err("nosuchfn(1)"), GateSimError::ExprParse(_)));
        assert!(matches!(scalar_err("2 ** 3"), GateSimError::ExprParse(_)));
    }

    fn scalar_err(expr: &str) -> GateSimError {
        eval_scalar(expr, &SymbolTable::new()).unwrap_err()
    }
}
