//! # GateSim Core
//!
//! Shared types for the GateSim kinetic modeling engine.
//!
//! GateSim computes the time evolution of state occupancy probabilities for
//! continuous-time, discrete-state Markov models driven by piecewise-constant
//! external stimuli (e.g. ion-channel gating models under voltage or ligand
//! clamp protocols).
//!
//! ## Crates
//!
//! | Crate | Role |
//! |-------|------|
//! | `gatesim-core` | Error taxonomy, shared aliases |
//! | `gatesim-expr` | Math expression parser/evaluator |
//! | `gatesim-model` | Model entities, variable sets, matrix assembly |
//! | `gatesim-protocol` | Protocols, epochs, simulation kernels, summaries |
//!
//! ## Design Philosophy
//!
//! 1. Conservation-preserving numerics first
//! 2. Modern Rust safety and performance
//! 3. UI layers stay outside the core

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum GateSimError {
    #[error("Failed to parse '{0}'")]
    ExprParse(String),

    #[error("Dimension mismatch in '{expr}': {detail}")]
    ExprShape { expr: String, detail: String },

    #[error("Failed to reduce '{0}' to a single number")]
    ExprNotScalar(String),

    #[error("Invalid state group spec '{0}'")]
    GroupSpec(String),

    #[error("Negative rate or interaction factor: '{0}'")]
    NegativeRate(String),

    #[error("At least one state must have non-zero starting probability (total {0})")]
    StartProb(f64),

    #[error("Spectral expansion failed: {0}")]
    Spectral(String),

    #[error("Reference data shape mismatch: {0}")]
    RefShape(String),

    #[error("Persistence error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Simulation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GateSimError>;

/// Time point (seconds).
pub type Time = f64;

/// Electrical charge moved during a transition (elementary charges).
pub type Charge = f64;

/// Scale applied to rate-weighted transition charges to express state
/// charge currents in pA.
pub const CHARGE_CURRENT_PA: f64 = 6.242e-6;

/// Tolerance used when matching sample times to stimulus edges.
pub const EDGE_EPSILON: f64 = f64::EPSILON * 5.0;

/// Shared cooperative cancellation flag.
///
/// Checked at the head of every parallel task and inside long-running kernel
/// loops. Monotonic: once raised it stays raised for the invocation.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Error out of the current task if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(GateSimError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_flag() {
        let abort = AbortFlag::new();
        assert!(abort.check().is_ok());
        let clone = abort.clone();
        clone.raise();
        assert!(abort.is_raised());
        assert!(matches!(abort.check(), Err(GateSimError::Cancelled)));
        abort.reset();
        assert!(abort.check().is_ok());
    }

    #[test]
    fn test_error_display() {
        let err = GateSimError::ExprNotScalar("t + 1".into());
        assert!(err.to_string().contains("t + 1"));
        let err = GateSimError::StartProb(1e-7);
        assert!(err.to_string().contains("non-zero starting probability"));
    }
}
