//! # GateSim Model
//!
//! Kinetic model representation and numeric assembly.
//!
//! A model is a collection of states/transitions (or binary elements and
//! their interactions), state groups and named variables. Most entity
//! parameters are string expressions that may refer to variables or external
//! stimuli by name; the model evaluates them to numbers on demand.
//!
//! Variables are evaluated in declaration order, so a variable may depend on
//! any variable declared before it. Several variables sharing one name form
//! a *variable set*: repeat `i` supplies the value for set index `i`, and the
//! last repeat persists for all higher set indexes.
//!
//! For optimization, variables whose value expression is a plain number (and
//! which are not held constant) may vary within their `[min, max]` bounds.
//!
//! ## Outputs
//!
//! 1. Starting probability row vector
//! 2. Per-attribute state value row vectors
//! 3. Transition rate generator Q (probability-conserving diagonal)
//! 4. Transition charge matrix

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use gatesim_core::{GateSimError, Result};
use gatesim_expr::{eval_scalar, SymbolTable};
use ndarray::Array1;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod sparse;
pub use sparse::SparseMatrix;

/// Scalar parameters by name, as produced by [`Model::eval_variables`].
pub type ParameterMap = BTreeMap<String, f64>;

/// A `(from, to)` pair of state indexes.
pub type IndexPair = (usize, usize);

/// Minimum total starting probability accepted in states-only mode.
const MIN_TOTAL_START_PROBABILITY: f64 = 1e-5;

// =============================================================================
// STRING HELPERS
// =============================================================================

/// Parse a comma-separated list of names, dropping empty fields.
pub fn parse_name_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a dict-like string of named expressions, e.g. `"g: 15, F: -100.1"`.
///
/// Fields without exactly one name and one expression are dropped.
pub fn parse_attr_map(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter_map(|field| {
            let parts: Vec<&str> = field
                .split(':')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect();
            match parts.as_slice() {
                [name, expr] => Some((name.to_string(), expr.to_string())),
                _ => None,
            }
        })
        .collect()
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Named value expression optionally allowed to vary within bounds.
///
/// When the value denotes a single number, `is_const` decides whether it is
/// held constant or free within `[min, max]`. A value that is a more complex
/// expression is never a free variable regardless of those fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Variable {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Const")]
    pub is_const: bool,
    #[serde(rename = "Min")]
    pub min: f64,
    #[serde(rename = "Max")]
    pub max: f64,
    /// Which variable set this repeat belongs to. Valid after `init`.
    #[serde(skip)]
    set_index: usize,
    /// How many variables share this name. Valid after `init`.
    #[serde(skip)]
    set_count: usize,
}

impl Default for Variable {
    fn default() -> Self {
        Self {
            name: String::new(),
            value: String::new(),
            description: String::new(),
            is_const: true,
            min: 0.0,
            max: 0.0,
            set_index: 0,
            set_count: 1,
        }
    }
}

impl Variable {
    pub fn new(name: &str, value: &str, description: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            value: value.to_string(),
            description: description.to_string(),
            ..Self::default()
        }
    }

    /// The value as a plain number, if it is one.
    pub fn number(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    pub fn set_index(&self) -> usize {
        self.set_index
    }

    pub fn set_count(&self) -> usize {
        self.set_count
    }
}

/// State of the system (states-only mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Probability")]
    pub probability: String,
    /// Dict-like string of named attribute expressions, e.g. `"g: 15, F: -100"`.
    #[serde(rename = "Attributes")]
    pub attributes: String,
    #[serde(rename = "X")]
    pub x: f32,
    #[serde(rename = "Y")]
    pub y: f32,
    #[serde(rename = "Z")]
    pub z: f32,
    /// Index into the model's state list. Valid after `init`.
    #[serde(skip)]
    index: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            name: String::new(),
            probability: "0".to_string(),
            attributes: String::new(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
            index: 0,
        }
    }
}

impl State {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Directed transition between two states, referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Transition {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Rate")]
    pub rate: String,
    #[serde(rename = "Charge")]
    pub charge: String,
    #[serde(skip)]
    from_index: Option<usize>,
    #[serde(skip)]
    to_index: Option<usize>,
}

impl Default for Transition {
    fn default() -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            rate: "10".to_string(),
            charge: "0".to_string(),
            from_index: None,
            to_index: None,
        }
    }
}

impl Transition {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.trim().to_string(),
            to: to.trim().to_string(),
            ..Self::default()
        }
    }
}

/// System element that can adopt one of two configurations (0 or 1).
///
/// `k` elements induce a `2^k` product state space; state index bit `j` is
/// element `j`'s configuration. `rate01`/`charge01` describe the 0 -> 1
/// transition, `rate10`/`charge10` the reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryElement {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Probability0")]
    pub probability0: String,
    #[serde(rename = "Rate01")]
    pub rate01: String,
    #[serde(rename = "Rate10")]
    pub rate10: String,
    #[serde(rename = "Charge01")]
    pub charge01: String,
    #[serde(rename = "Charge10")]
    pub charge10: String,
    #[serde(rename = "X")]
    pub x: f32,
    #[serde(rename = "Y")]
    pub y: f32,
    #[serde(rename = "Z")]
    pub z: f32,
    #[serde(skip)]
    index: usize,
    /// `(from, to)` state pairs where this element flips 0 -> 1. Valid after `init`.
    #[serde(skip)]
    pairs01: Vec<IndexPair>,
    /// `(from, to)` state pairs where this element flips 1 -> 0. Valid after `init`.
    #[serde(skip)]
    pairs10: Vec<IndexPair>,
}

impl Default for BinaryElement {
    fn default() -> Self {
        Self {
            name: String::new(),
            probability0: "1".to_string(),
            rate01: "10".to_string(),
            rate10: "10".to_string(),
            charge01: "0".to_string(),
            charge10: "0".to_string(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
            index: 0,
            pairs01: Vec::new(),
            pairs10: Vec::new(),
        }
    }
}

impl BinaryElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pairs01(&self) -> &[IndexPair] {
        &self.pairs01
    }

    pub fn pairs10(&self) -> &[IndexPair] {
        &self.pairs10
    }
}

/// Configuration-dependent interaction between two binary elements.
///
/// Rates for transitions in which one element changes while the other is in
/// configuration 1 are multiplied by the corresponding factor. Pair-set
/// names read as the `AB` configuration before and after the transition,
/// with element A's bit first: e.g. `pairs0111` are transitions 01 -> 11.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Interaction {
    #[serde(rename = "A")]
    pub a: String,
    #[serde(rename = "B")]
    pub b: String,
    #[serde(rename = "Factor11")]
    pub factor11: String,
    #[serde(rename = "FactorA1")]
    pub factor_a1: String,
    #[serde(rename = "Factor1B")]
    pub factor_1b: String,
    #[serde(skip)]
    a_index: Option<usize>,
    #[serde(skip)]
    b_index: Option<usize>,
    #[serde(skip)]
    pairs1101: Vec<IndexPair>, // *= factor_a1 / factor11
    #[serde(skip)]
    pairs1110: Vec<IndexPair>, // *= factor_1b / factor11
    #[serde(skip)]
    pairs0111: Vec<IndexPair>, // *= factor_a1
    #[serde(skip)]
    pairs1011: Vec<IndexPair>, // *= factor_1b
}

impl Default for Interaction {
    fn default() -> Self {
        Self {
            a: String::new(),
            b: String::new(),
            factor11: "1".to_string(),
            factor_a1: "1".to_string(),
            factor_1b: "1".to_string(),
            a_index: None,
            b_index: None,
            pairs1101: Vec::new(),
            pairs1110: Vec::new(),
            pairs0111: Vec::new(),
            pairs1011: Vec::new(),
        }
    }
}

impl Interaction {
    pub fn new(a: &str, b: &str) -> Self {
        Self {
            a: a.trim().to_string(),
            b: b.trim().to_string(),
            ..Self::default()
        }
    }

    /// Does this interaction connect the two named elements (in either order)?
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.a == a && self.b == b) || (self.a == b && self.b == a)
    }
}

/// Named collection of system states carrying attribute expressions.
///
/// `states` is a comma-separated list of state names (states-only mode) or
/// of binary element configuration strings over `{0, 1, *}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateGroup {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "States")]
    pub states: String,
    #[serde(rename = "Attributes")]
    pub attributes: String,
    /// Sorted, deduplicated member state indexes. Valid after `init`.
    #[serde(skip)]
    pub state_indexes: Vec<usize>,
}

impl Default for StateGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: true,
            states: String::new(),
            attributes: String::new(),
            state_indexes: Vec::new(),
        }
    }
}

impl StateGroup {
    pub fn new(name: &str, states: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            states: states.to_string(),
            ..Self::default()
        }
    }
}

// =============================================================================
// BINARY STATE SPACE COMBINATORICS
// =============================================================================

/// State names for `k` binary elements: character `j` of state `i`'s name is
/// bit `j` of `i` as '0'/'1'. E.g. `k = 2` gives `["00", "10", "01", "11"]`.
pub fn binary_state_names(num_elements: usize) -> Vec<String> {
    let num_states = 1usize << num_elements;
    (0..num_states)
        .map(|i| {
            (0..num_elements)
                .map(|j| if i & (1 << j) != 0 { '1' } else { '0' })
                .collect()
        })
        .collect()
}

/// Expand one configuration string over `{0, 1, *}` into state indexes,
/// where `*` matches either configuration. Characters map left-to-right to
/// element bits 0..k-1; e.g. `"0*1"` expands to indexes {4, 6}.
pub fn configuration_state_indexes(config: &str) -> Result<Vec<usize>> {
    let mut indexes = vec![0usize];
    for (i, c) in config.chars().enumerate() {
        match c {
            '0' => {}
            '1' => {
                for index in &mut indexes {
                    *index ^= 1 << i;
                }
            }
            '*' => {
                for j in 0..indexes.len() {
                    let flipped = indexes[j] ^ (1 << i);
                    indexes.push(flipped);
                }
            }
            _ => return Err(GateSimError::GroupSpec(config.to_string())),
        }
    }
    Ok(indexes)
}

/// All `(from, to)` state pairs in which element `element_index` changes
/// configuration: first the 0 -> 1 pairs, then the 1 -> 0 pairs.
pub fn element_state_pairs(
    element_index: usize,
    num_states: usize,
) -> (Vec<IndexPair>, Vec<IndexPair>) {
    let mask = 1usize << element_index;
    let mut pairs01 = Vec::with_capacity(num_states / 2);
    let mut pairs10 = Vec::with_capacity(num_states / 2);
    for from in 0..num_states {
        for to in 0..num_states {
            if from ^ to == mask {
                if to & mask != 0 {
                    pairs01.push((from, to));
                } else {
                    pairs10.push((from, to));
                }
            }
        }
    }
    (pairs01, pairs10)
}

/// All `(from, to)` state pairs affected by an interaction between elements
/// `a` and `b`, in the order `[1101, 1110, 0111, 1011]`.
pub fn interaction_state_pairs(a: usize, b: usize, num_states: usize) -> [Vec<IndexPair>; 4] {
    let mask_a = 1usize << a;
    let mask_b = 1usize << b;
    let mut pairs1101 = Vec::new();
    let mut pairs1110 = Vec::new();
    let mut pairs0111 = Vec::new();
    let mut pairs1011 = Vec::new();
    for from in 0..num_states {
        let config_a = from & mask_a != 0;
        let config_b = from & mask_b != 0;
        if config_a && config_b {
            for to in 0..num_states {
                if from ^ to == mask_a {
                    pairs1101.push((from, to));
                } else if from ^ to == mask_b {
                    pairs1110.push((from, to));
                }
            }
        } else if config_a {
            for to in 0..num_states {
                if from ^ to == mask_b {
                    pairs1011.push((from, to));
                }
            }
        } else if config_b {
            for to in 0..num_states {
                if from ^ to == mask_a {
                    pairs0111.push((from, to));
                }
            }
        }
    }
    [pairs1101, pairs1110, pairs0111, pairs1011]
}

fn group_indexes_by_name(states: &str, state_names: &[String]) -> Result<Vec<usize>> {
    let mut indexes = Vec::new();
    for field in parse_name_list(states) {
        let index = state_names
            .iter()
            .position(|name| *name == field)
            .ok_or_else(|| GateSimError::GroupSpec(field.clone()))?;
        indexes.push(index);
    }
    indexes.sort_unstable();
    indexes.dedup();
    Ok(indexes)
}

fn group_indexes_by_config(configs: &str, num_elements: usize) -> Result<Vec<usize>> {
    let mut indexes = Vec::new();
    for field in parse_name_list(configs) {
        if field.chars().count() != num_elements {
            return Err(GateSimError::GroupSpec(field.clone()));
        }
        indexes.extend(configuration_state_indexes(&field)?);
    }
    indexes.sort_unstable();
    indexes.dedup();
    Ok(indexes)
}

// =============================================================================
// MODEL
// =============================================================================

/// A free (optimizable) variable value with its bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeVariable {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Markov model as a collection of states and transitions, or binary
/// elements and interactions.
///
/// The two representations are mutually exclusive for numeric assembly: if
/// any binary element exists, states and transitions are ignored.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub notes: String,
    pub variables: Vec<Variable>,
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
    pub elements: Vec<BinaryElement>,
    pub interactions: Vec<Interaction>,
    pub groups: Vec<StateGroup>,
    /// Name -> value map. Valid after `eval_variables`.
    pub parameters: ParameterMap,
    state_names: Vec<String>,
}

impl Default for Model {
    /// A minimal two-state model with the usual physical constants.
    fn default() -> Self {
        let mut model = Model::empty("");
        model.variables = vec![
            Variable::new("k", "0.000086173324", "Boltzmann constant (eV/K)"),
            Variable::new("R", "0.0019872036", "Gas constant (kcal/mol/K)"),
            Variable::new("h", "4.135667662*10^-15", "Planck constant (eV*s)"),
        ];
        let mut a = State::new("A");
        a.probability = "1".to_string();
        a.x = -2.0;
        let mut b = State::new("B");
        b.x = 2.0;
        model.states = vec![a, b];
        model.transitions = vec![Transition::new("A", "B"), Transition::new("B", "A")];
        model
    }
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            ..Self::default()
        }
    }

    /// A model with no children at all.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            notes: String::new(),
            variables: Vec::new(),
            states: Vec::new(),
            transitions: Vec::new(),
            elements: Vec::new(),
            interactions: Vec::new(),
            groups: Vec::new(),
            parameters: ParameterMap::new(),
            state_names: Vec::new(),
        }
    }

    /// Number of states in the current representation.
    pub fn num_states(&self) -> usize {
        if self.elements.is_empty() {
            self.states.len()
        } else {
            1 << self.elements.len()
        }
    }

    /// State names enumerated by the last `init`.
    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn find_transition(&self, from: &str, to: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    pub fn find_interaction(&self, a: &str, b: &str) -> Option<&Interaction> {
        self.interactions.iter().find(|i| i.connects(a, b))
    }

    /// Remove a state and every transition incident on it.
    pub fn remove_state(&mut self, name: &str) {
        self.states.retain(|s| s.name != name);
        self.transitions.retain(|t| t.from != name && t.to != name);
    }

    /// Remove a binary element and every interaction incident on it.
    pub fn remove_element(&mut self, name: &str) {
        self.elements.retain(|e| e.name != name);
        self.interactions.retain(|i| i.a != name && i.b != name);
    }

    /// Rebuild all derived indexes.
    ///
    /// Must be called after any structural edit and before numeric assembly.
    /// Assigns variable set indexes/counts, state or element indexes,
    /// precomputes the `(from, to)` pair sets affected by each element and
    /// interaction, enumerates state names and expands active state groups.
    /// Idempotent.
    pub fn init(&mut self) -> Result<Vec<String>> {
        let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();
        for variable in &mut self.variables {
            let count = occurrences.entry(variable.name.clone()).or_insert(0);
            variable.set_index = *count;
            *count += 1;
        }
        for variable in &mut self.variables {
            variable.set_count = occurrences[&variable.name];
        }

        if self.elements.is_empty() {
            for (i, state) in self.states.iter_mut().enumerate() {
                state.index = i;
            }
            self.state_names = self.states.iter().map(|s| s.name.clone()).collect();
            let states = &self.states;
            for transition in &mut self.transitions {
                transition.from_index = states.iter().position(|s| s.name == transition.from);
                transition.to_index = states.iter().position(|s| s.name == transition.to);
            }
        } else {
            let num_elements = self.elements.len();
            let num_states = 1usize << num_elements;
            for (j, element) in self.elements.iter_mut().enumerate() {
                element.index = j;
                let (pairs01, pairs10) = element_state_pairs(j, num_states);
                element.pairs01 = pairs01;
                element.pairs10 = pairs10;
            }
            let elements = &self.elements;
            for interaction in &mut self.interactions {
                interaction.a_index = elements.iter().position(|e| e.name == interaction.a);
                interaction.b_index = elements.iter().position(|e| e.name == interaction.b);
                if let (Some(a), Some(b)) = (interaction.a_index, interaction.b_index) {
                    let [p1101, p1110, p0111, p1011] = interaction_state_pairs(a, b, num_states);
                    interaction.pairs1101 = p1101;
                    interaction.pairs1110 = p1110;
                    interaction.pairs0111 = p0111;
                    interaction.pairs1011 = p1011;
                }
            }
            self.state_names = binary_state_names(num_elements);
        }

        let num_elements = self.elements.len();
        let state_names = &self.state_names;
        for group in &mut self.groups {
            if group.active {
                group.state_indexes = if num_elements > 0 {
                    group_indexes_by_config(&group.states, num_elements)?
                } else {
                    group_indexes_by_name(&group.states, state_names)?
                };
            }
        }
        Ok(self.state_names.clone())
    }

    /// Evaluate each variable's value expression into the parameter map.
    ///
    /// `stimuli` seeds the map with the external stimulus values the model
    /// parameters may depend on. `set_index` selects which variable set to
    /// use where several variables share a name; variables with fewer
    /// repeats than the requested set fall back to their last repeat.
    pub fn eval_variables(&mut self, stimuli: &ParameterMap, set_index: usize) -> Result<()> {
        self.parameters = stimuli.clone();
        let mut symbols = SymbolTable::new();
        for (name, value) in stimuli {
            symbols.set_scalar(name, *value);
        }
        for variable in &self.variables {
            let selected = variable.set_index == set_index
                || (variable.set_index < set_index && variable.set_count <= set_index);
            if selected {
                let value = eval_scalar(&variable.value, &symbols)?;
                self.parameters.insert(variable.name.clone(), value);
                symbols.set_scalar(&variable.name, value);
            }
        }
        Ok(())
    }

    /// Number of independent variable sets (maximum name repeat count).
    pub fn num_variable_sets(&self) -> usize {
        self.variables
            .iter()
            .map(|v| v.set_count)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Symbol table over the current parameter map.
    pub fn param_symbols(&self) -> SymbolTable<'static> {
        let mut symbols = SymbolTable::new();
        for (name, value) in &self.parameters {
            symbols.set_scalar(name, *value);
        }
        symbols
    }

    /// Evaluate an expression against the current parameter map.
    pub fn eval_expr(&self, expr: &str) -> Result<f64> {
        eval_scalar(expr, &self.param_symbols())
    }

    /// Starting state probabilities as a row vector summing to one.
    ///
    /// Only valid after `init` and `eval_variables`.
    pub fn starting_probability(&self) -> Result<Array1<f64>> {
        let symbols = self.param_symbols();
        if self.elements.is_empty() {
            let mut probabilities = Array1::zeros(self.states.len());
            for state in &self.states {
                let p = eval_scalar(&state.probability, &symbols)?;
                probabilities[state.index] = p.clamp(0.0, 1.0);
            }
            let total = probabilities.sum();
            if total < MIN_TOTAL_START_PROBABILITY {
                return Err(GateSimError::StartProb(total));
            }
            Ok(probabilities / total)
        } else {
            let num_elements = self.elements.len();
            let num_states = 1usize << num_elements;
            let mut p0 = vec![1.0; num_elements];
            for (j, element) in self.elements.iter().enumerate() {
                p0[j] = eval_scalar(&element.probability0, &symbols)?.clamp(0.0, 1.0);
            }
            let mut probabilities = Array1::ones(num_states);
            for i in 0..num_states {
                for (j, p) in p0.iter().enumerate() {
                    probabilities[i] *= if i & (1 << j) != 0 { 1.0 - p } else { *p };
                }
            }
            Ok(probabilities)
        }
    }

    /// Per-attribute state value row vectors.
    ///
    /// Attributes come from active state groups; in states-only mode a
    /// per-state attribute overrides any group attribute at that state.
    /// Missing attributes default to zero.
    pub fn state_attributes(&self) -> Result<BTreeMap<String, Array1<f64>>> {
        let num_states = self.num_states();
        let symbols = self.param_symbols();
        let mut attributes: BTreeMap<String, Array1<f64>> = BTreeMap::new();
        for group in self.groups.iter().filter(|g| g.active) {
            for (attr_name, attr_expr) in parse_attr_map(&group.attributes) {
                let value = eval_scalar(&attr_expr, &symbols)?;
                let values = attributes
                    .entry(attr_name)
                    .or_insert_with(|| Array1::zeros(num_states));
                if value != 0.0 {
                    for &index in &group.state_indexes {
                        values[index] = value;
                    }
                }
            }
        }
        if self.elements.is_empty() {
            for state in &self.states {
                for (attr_name, attr_expr) in parse_attr_map(&state.attributes) {
                    let value = eval_scalar(&attr_expr, &symbols)?;
                    let values = attributes
                        .entry(attr_name)
                        .or_insert_with(|| Array1::zeros(num_states));
                    if value != 0.0 {
                        values[state.index] = value;
                    }
                }
            }
        }
        Ok(attributes)
    }

    /// Transition rate generator Q with probability-conserving diagonal.
    ///
    /// Off-diagonal `Q[i, j]` is the rate of the `i -> j` transition;
    /// `Q[i, i]` is the negated sum of the rates leaving state `i`. Any
    /// negative rate or interaction factor is an error.
    pub fn transition_rates(&self) -> Result<SparseMatrix> {
        let symbols = self.param_symbols();
        let mut rates = SparseMatrix::new(self.num_states());
        if self.elements.is_empty() {
            for transition in &self.transitions {
                if let (Some(from), Some(to)) = (transition.from_index, transition.to_index) {
                    let rate = eval_scalar(&transition.rate, &symbols)?;
                    if rate < 0.0 {
                        return Err(GateSimError::NegativeRate(transition.rate.clone()));
                    }
                    if rate > 0.0 {
                        rates.insert(from, to, rate);
                    }
                }
            }
        } else {
            for element in &self.elements {
                let rate01 = eval_scalar(&element.rate01, &symbols)?;
                if rate01 < 0.0 {
                    return Err(GateSimError::NegativeRate(element.rate01.clone()));
                }
                let rate10 = eval_scalar(&element.rate10, &symbols)?;
                if rate10 < 0.0 {
                    return Err(GateSimError::NegativeRate(element.rate10.clone()));
                }
                if rate01 > 0.0 {
                    for &(from, to) in &element.pairs01 {
                        rates.insert(from, to, rate01);
                    }
                }
                if rate10 > 0.0 {
                    for &(from, to) in &element.pairs10 {
                        rates.insert(from, to, rate10);
                    }
                }
            }
            // Interaction factors multiply every transition in which an
            // involved element changed configuration.
            for interaction in &self.interactions {
                if interaction.a_index.is_none() || interaction.b_index.is_none() {
                    continue;
                }
                let factor11 = eval_scalar(&interaction.factor11, &symbols)?;
                if factor11 < 0.0 {
                    return Err(GateSimError::NegativeRate(interaction.factor11.clone()));
                }
                let factor_a1 = eval_scalar(&interaction.factor_a1, &symbols)?;
                if factor_a1 < 0.0 {
                    return Err(GateSimError::NegativeRate(interaction.factor_a1.clone()));
                }
                let factor_1b = eval_scalar(&interaction.factor_1b, &symbols)?;
                if factor_1b < 0.0 {
                    return Err(GateSimError::NegativeRate(interaction.factor_1b.clone()));
                }
                if factor_a1 != 1.0 {
                    for &(from, to) in &interaction.pairs0111 {
                        rates.scale_entry(from, to, factor_a1);
                    }
                }
                if factor_1b != 1.0 {
                    for &(from, to) in &interaction.pairs1011 {
                        rates.scale_entry(from, to, factor_1b);
                    }
                }
                if factor_a1 / factor11 != 1.0 {
                    for &(from, to) in &interaction.pairs1101 {
                        rates.scale_entry(from, to, factor_a1 / factor11);
                    }
                }
                if factor_1b / factor11 != 1.0 {
                    for &(from, to) in &interaction.pairs1110 {
                        rates.scale_entry(from, to, factor_1b / factor11);
                    }
                }
            }
        }
        rates.set_conserving_diagonal();
        Ok(rates)
    }

    /// Transition charge matrix: `C[i, j]` is the (signed) charge moved
    /// during the `i -> j` transition.
    pub fn transition_charges(&self) -> Result<SparseMatrix> {
        let symbols = self.param_symbols();
        let mut charges = SparseMatrix::new(self.num_states());
        if self.elements.is_empty() {
            for transition in &self.transitions {
                if let (Some(from), Some(to)) = (transition.from_index, transition.to_index) {
                    let charge = eval_scalar(&transition.charge, &symbols)?;
                    if charge != 0.0 {
                        charges.insert(from, to, charge);
                    }
                }
            }
        } else {
            for element in &self.elements {
                let charge01 = eval_scalar(&element.charge01, &symbols)?;
                let charge10 = eval_scalar(&element.charge10, &symbols)?;
                if charge01 != 0.0 {
                    for &(from, to) in &element.pairs01 {
                        charges.insert(from, to, charge01);
                    }
                }
                if charge10 != 0.0 {
                    for &(from, to) in &element.pairs10 {
                        charges.insert(from, to, charge10);
                    }
                }
            }
        }
        Ok(charges)
    }

    /// Values and bounds of all non-constant plain-number variables, in
    /// declaration order. For parameter optimization.
    pub fn free_variables(&self) -> Vec<FreeVariable> {
        self.variables
            .iter()
            .filter(|v| !v.is_const)
            .filter_map(|v| {
                v.number().map(|value| FreeVariable {
                    value,
                    min: v.min,
                    max: v.max,
                })
            })
            .collect()
    }

    /// Write back optimized free-variable values, in the same order as
    /// [`Model::free_variables`].
    pub fn set_free_variables(&mut self, values: &[f64]) -> Result<()> {
        let mut iter = values.iter();
        for variable in &mut self.variables {
            if !variable.is_const && variable.number().is_some() {
                let value = iter.next().ok_or_else(|| {
                    GateSimError::RefShape("too few free variable values supplied".to_string())
                })?;
                variable.value = format!("{value}");
            }
        }
        Ok(())
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Collect the children of `kind` from a serialized tree, accepting both a
/// single object and an array of objects. Absent keys give an empty list, so
/// unknown child types in the tree are simply skipped on load.
pub fn children_of<T: DeserializeOwned>(tree: &Json, kind: &str) -> Result<Vec<T>> {
    match tree.get(kind) {
        None => Ok(Vec::new()),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(Into::into))
            .collect(),
        Some(value) => Ok(vec![serde_json::from_value(value.clone())?]),
    }
}

/// Insert serialized children under their type name: one child is stored as
/// an object, several as an array, none not at all.
pub fn insert_children<T: Serialize>(
    map: &mut serde_json::Map<String, Json>,
    kind: &str,
    items: &[T],
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        values.push(serde_json::to_value(item)?);
    }
    let value = if values.len() == 1 {
        values.remove(0)
    } else {
        Json::Array(values)
    };
    map.insert(kind.to_string(), value);
    Ok(())
}

fn string_of(tree: &Json, key: &str) -> String {
    tree.get(key)
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

impl Model {
    /// Serialize to the project tree format: a map of property name to value
    /// with children grouped under their type names.
    pub fn to_json(&self) -> Result<Json> {
        let mut map = serde_json::Map::new();
        map.insert("Name".to_string(), Json::String(self.name.clone()));
        map.insert("Notes".to_string(), Json::String(self.notes.clone()));
        insert_children(&mut map, "Variable", &self.variables)?;
        insert_children(&mut map, "State", &self.states)?;
        insert_children(&mut map, "Transition", &self.transitions)?;
        insert_children(&mut map, "BinaryElement", &self.elements)?;
        insert_children(&mut map, "Interaction", &self.interactions)?;
        insert_children(&mut map, "StateGroup", &self.groups)?;
        Ok(Json::Object(map))
    }

    pub fn from_json(tree: &Json) -> Result<Model> {
        let mut model = Model::empty(&string_of(tree, "Name"));
        model.notes = string_of(tree, "Notes");
        model.variables = children_of(tree, "Variable")?;
        model.states = children_of(tree, "State")?;
        model.transitions = children_of(tree, "Transition")?;
        model.elements = children_of(tree, "BinaryElement")?;
        model.interactions = children_of(tree, "Interaction")?;
        model.groups = children_of(tree, "StateGroup")?;
        Ok(model)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut root = serde_json::Map::new();
        root.insert("Model".to_string(), self.to_json()?);
        fs::write(path, serde_json::to_string_pretty(&Json::Object(root))?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Model> {
        let buffer = fs::read_to_string(path)?;
        let root: Json = serde_json::from_str(&buffer)?;
        Model::from_json(root.get("Model").unwrap_or(&root))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// The two-state model exercised throughout: A <-> B with expression
    /// rates depending on stimulus z.
    fn states_model() -> Model {
        let mut model = Model::empty("test");
        model.variables.push(Variable::new("x", "3.14 * z", ""));
        model
            .variables
            .push(Variable::new("y", "sqrt(((2 + 0) * -3.14)^2)", "")); // 6.28
        let mut a = State::new("A");
        a.probability = "1".to_string();
        let mut b = State::new("B");
        b.attributes = "g: 15 * 1 + (0 * 7)^3, F: -100.1 - 0 / sqrt(9.45)".to_string();
        model.states.push(a);
        model.states.push(b);
        let mut ab = Transition::new("A", "B");
        ab.rate = "x".to_string();
        ab.charge = "x*0".to_string();
        let mut ba = Transition::new("B", "A");
        ba.rate = "y/2".to_string();
        ba.charge = "y - y".to_string();
        model.transitions.push(ab);
        model.transitions.push(ba);
        model
    }

    fn binary_model() -> Model {
        let mut model = states_model();
        let mut c = BinaryElement::new("C");
        c.rate01 = "x".to_string(); // 3.14 z
        c.rate10 = "y/2".to_string(); // 3.14
        c.charge01 = "x".to_string();
        c.charge10 = "-x".to_string();
        let mut d = BinaryElement::new("D");
        d.rate01 = "x/2*z".to_string(); // 1.57 z^2
        d.rate10 = "y".to_string(); // 6.28
        d.charge01 = String::new();
        d.charge10 = String::new();
        model.elements.push(c);
        model.elements.push(d);
        let mut cd = Interaction::new("C", "D");
        cd.factor11 = "2".to_string();
        cd.factor_a1 = "10*y".to_string(); // 62.8
        cd.factor_1b = "y / 10".to_string(); // 0.628
        model.interactions.push(cd);
        let mut group = StateGroup::new("G", "*1");
        group.attributes = "g: 15.0, F: 100".to_string();
        model.groups.push(group);
        model
    }

    fn eval_at_z3(model: &mut Model) {
        let mut stimuli = ParameterMap::new();
        stimuli.insert("z".to_string(), 3.0);
        model.eval_variables(&stimuli, 0).unwrap();
    }

    #[test]
    fn test_states_model_init_and_variables() {
        let mut model = states_model();
        let state_names = model.init().unwrap();
        assert_eq!(state_names, vec!["A", "B"]);

        let mut stimuli = ParameterMap::new();
        stimuli.insert("z".to_string(), 1.0);
        model.eval_variables(&stimuli, 0).unwrap();
        assert_relative_eq!(model.parameters["z"], 1.0);
        assert_relative_eq!(model.parameters["x"], 3.14);
        assert_relative_eq!(model.parameters["y"], 6.28);

        stimuli.insert("z".to_string(), 3.0);
        model.eval_variables(&stimuli, 0).unwrap();
        assert_relative_eq!(model.parameters["x"], 3.14 * 3.0);
    }

    #[test]
    fn test_states_model_matrices() {
        let mut model = states_model();
        model.init().unwrap();
        eval_at_z3(&mut model);

        let p0 = model.starting_probability().unwrap();
        assert_relative_eq!(p0[0], 1.0);
        assert_relative_eq!(p0[1], 0.0);

        let attrs = model.state_attributes().unwrap();
        assert_eq!(attrs.len(), 2);
        assert_relative_eq!(attrs["g"][0], 0.0);
        assert_relative_eq!(attrs["g"][1], 15.0);
        assert_relative_eq!(attrs["F"][1], -100.1);

        let q = model.transition_rates().unwrap();
        let k_ab = 3.14 * 3.0;
        let k_ba = 6.28 / 2.0;
        assert_relative_eq!(q.entry(0, 1), k_ab);
        assert_relative_eq!(q.entry(0, 0), -k_ab);
        assert_relative_eq!(q.entry(1, 0), k_ba);
        assert_relative_eq!(q.entry(1, 1), -k_ba);

        let charges = model.transition_charges().unwrap();
        assert_eq!(charges.nonzeros(), 0);
    }

    #[test]
    fn test_binary_model_matrices() {
        let mut model = binary_model();
        let state_names = model.init().unwrap();
        assert_eq!(state_names, vec!["00", "10", "01", "11"]);
        eval_at_z3(&mut model);

        let p0 = model.starting_probability().unwrap();
        assert_eq!(p0.len(), 4);
        assert_relative_eq!(p0[0], 1.0);
        assert_relative_eq!(p0.sum(), 1.0);

        let attrs = model.state_attributes().unwrap();
        assert_eq!(attrs["g"].to_vec(), vec![0.0, 0.0, 15.0, 15.0]);
        assert_eq!(attrs["F"].to_vec(), vec![0.0, 0.0, 100.0, 100.0]);

        // Expected generator, with z = 3:
        //   C01 = 9.42, C10 = 3.14, D01 = 14.13, D10 = 6.28
        //   f11 = 2, fA1 = 62.8, f1B = 0.628
        let c01 = 3.14 * 3.0;
        let c10 = 3.14;
        let d01 = 3.14 * 3.0 / 2.0 * 3.0;
        let d10 = 6.28;
        let f11 = 2.0;
        let fa1 = 62.8;
        let f1b = 0.628;
        let q = model.transition_rates().unwrap();
        assert_relative_eq!(q.entry(0, 1), c01);
        assert_relative_eq!(q.entry(0, 2), d01);
        assert_relative_eq!(q.entry(0, 3), 0.0);
        assert_relative_eq!(q.entry(1, 0), c10);
        assert_relative_eq!(q.entry(1, 3), d01 * f1b);
        assert_relative_eq!(q.entry(2, 0), d10);
        assert_relative_eq!(q.entry(2, 3), c01 * fa1);
        assert_relative_eq!(q.entry(3, 1), d10 * f1b / f11);
        assert_relative_eq!(q.entry(3, 2), c10 * fa1 / f11);
        for i in 0..4 {
            let row_sum: f64 = (0..4).map(|j| q.entry(i, j)).sum();
            assert_relative_eq!(row_sum, 0.0, epsilon = 1e-12);
        }

        let charges = model.transition_charges().unwrap();
        assert_relative_eq!(charges.entry(0, 1), 9.42);
        assert_relative_eq!(charges.entry(1, 0), -9.42);
        assert_relative_eq!(charges.entry(2, 3), 9.42);
        assert_relative_eq!(charges.entry(3, 2), -9.42);
        assert_relative_eq!(charges.entry(0, 2), 0.0);
    }

    #[test]
    fn test_element_pair_enumeration() {
        // For k elements, pairs01(j) has exactly 2^(k-1) ordered pairs with
        // to = from | (1 << j).
        let num_states = 8;
        for j in 0..3 {
            let (pairs01, pairs10) = element_state_pairs(j, num_states);
            assert_eq!(pairs01.len(), 4);
            assert_eq!(pairs10.len(), 4);
            for &(from, to) in &pairs01 {
                assert_eq!(to, from | (1 << j));
                assert_eq!(from, to & !(1usize << j));
            }
        }
    }

    #[test]
    fn test_configuration_expansion() {
        let mut indexes = configuration_state_indexes("*1").unwrap();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![2, 3]);

        let mut indexes = configuration_state_indexes("0*1").unwrap();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![4, 6]);

        let mut indexes = configuration_state_indexes("*10").unwrap();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![2, 3]);

        assert!(matches!(
            configuration_state_indexes("0x1"),
            Err(GateSimError::GroupSpec(_))
        ));
    }

    #[test]
    fn test_group_resolution() {
        let mut model = states_model();
        let mut group = StateGroup::new("open", "B, A, B");
        group.attributes = String::new();
        model.groups.push(group);
        model.init().unwrap();
        assert_eq!(model.groups[0].state_indexes, vec![0, 1]);

        let mut model = states_model();
        model.groups.push(StateGroup::new("bad", "A, C"));
        assert!(matches!(model.init(), Err(GateSimError::GroupSpec(_))));

        let mut model = binary_model();
        model.groups.push(StateGroup::new("short", "1"));
        assert!(matches!(model.init(), Err(GateSimError::GroupSpec(_))));
    }

    #[test]
    fn test_group_attrs_only_at_member_indexes() {
        let mut model = binary_model();
        model.groups.clear();
        let mut c = BinaryElement::new("E");
        c.charge01 = String::new();
        c.charge10 = String::new();
        model.elements.push(c); // k = 3
        let mut group = StateGroup::new("G", "*10");
        group.attributes = "g: 7".to_string();
        model.groups.push(group);
        model.interactions.clear();
        model.init().unwrap();
        assert_eq!(model.groups[0].state_indexes, vec![2, 3]);
        eval_at_z3(&mut model);
        let attrs = model.state_attributes().unwrap();
        for i in 0..8 {
            let expected = if i == 2 || i == 3 { 7.0 } else { 0.0 };
            assert_relative_eq!(attrs["g"][i], expected);
        }
    }

    #[test]
    fn test_variable_sets() {
        let mut model = Model::empty("sets");
        model.variables.push(Variable::new("a", "1", ""));
        model.variables.push(Variable::new("a", "2", ""));
        model.variables.push(Variable::new("a", "3", ""));
        model.variables.push(Variable::new("b", "10 * a", ""));
        model.init().unwrap();
        assert_eq!(model.num_variable_sets(), 3);

        let stimuli = ParameterMap::new();
        model.eval_variables(&stimuli, 0).unwrap();
        assert_relative_eq!(model.parameters["a"], 1.0);
        assert_relative_eq!(model.parameters["b"], 10.0);

        model.eval_variables(&stimuli, 1).unwrap();
        assert_relative_eq!(model.parameters["a"], 2.0);
        assert_relative_eq!(model.parameters["b"], 20.0);

        // b has a single repeat, so it persists into set 2.
        model.eval_variables(&stimuli, 2).unwrap();
        assert_relative_eq!(model.parameters["a"], 3.0);
        assert_relative_eq!(model.parameters["b"], 30.0);
    }

    #[test]
    fn test_start_prob_threshold() {
        let mut model = states_model();
        model.states[0].probability = "0".to_string();
        model.init().unwrap();
        eval_at_z3(&mut model);
        assert!(matches!(
            model.starting_probability(),
            Err(GateSimError::StartProb(_))
        ));
    }

    #[test]
    fn test_negative_rate() {
        let mut model = states_model();
        model.transitions[0].rate = "-1".to_string();
        model.init().unwrap();
        eval_at_z3(&mut model);
        assert!(matches!(
            model.transition_rates(),
            Err(GateSimError::NegativeRate(_))
        ));
    }

    #[test]
    fn test_free_variables_roundtrip() {
        let mut model = Model::empty("free");
        let mut a = Variable::new("a", "1.5", "");
        a.is_const = false;
        a.min = 0.0;
        a.max = 10.0;
        model.variables.push(a);
        let mut b = Variable::new("b", "2 * a", "");
        b.is_const = false; // expression, so never free
        model.variables.push(b);
        model.variables.push(Variable::new("c", "7", "")); // const

        let free = model.free_variables();
        assert_eq!(free.len(), 1);
        assert_relative_eq!(free[0].value, 1.5);
        assert_relative_eq!(free[0].max, 10.0);

        model.set_free_variables(&[4.25]).unwrap();
        assert_eq!(model.variables[0].value, "4.25");
        assert!(model.set_free_variables(&[]).is_err());
    }

    #[test]
    fn test_remove_state_cascades() {
        let mut model = states_model();
        model.remove_state("A");
        assert_eq!(model.states.len(), 1);
        assert!(model.transitions.is_empty());
    }

    #[test]
    fn test_default_model() {
        let mut model = Model::default();
        let state_names = model.init().unwrap();
        assert_eq!(state_names, vec!["A", "B"]);
        assert!(model.find_transition("A", "B").is_some());
        model.eval_variables(&ParameterMap::new(), 0).unwrap();
        assert_relative_eq!(model.parameters["k"], 0.000086173324);
        assert_relative_eq!(model.parameters["h"], 4.135667662e-15);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut model = binary_model();
        model.notes = "a note".to_string();
        let tree = model.to_json().unwrap();
        let mut restored = Model::from_json(&tree).unwrap();
        assert_eq!(restored.name, model.name);
        assert_eq!(restored.notes, "a note");
        assert_eq!(restored.variables.len(), model.variables.len());
        assert_eq!(restored.elements.len(), 2);
        assert_eq!(restored.interactions[0].factor_a1, "10*y");
        assert_eq!(restored.groups[0].states, "*1");

        // Derived state must be rebuildable on the restored copy.
        let state_names = restored.init().unwrap();
        assert_eq!(state_names, vec!["00", "10", "01", "11"]);
    }

    #[test]
    fn test_json_single_child_as_object() {
        let tree: Json = serde_json::from_str(
            r#"{
                "Name": "m",
                "State": { "Name": "A", "Probability": "1" },
                "Widget": { "Name": "ignored" }
            }"#,
        )
        .unwrap();
        let model = Model::from_json(&tree).unwrap();
        assert_eq!(model.states.len(), 1);
        assert_eq!(model.states[0].name, "A");
        assert_eq!(model.states[0].probability, "1");
    }
}
