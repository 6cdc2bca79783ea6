//! Deduplicated epoch records.
//!
//! Every period of constant stimuli across every simulation cell maps to one
//! [`UniqueEpoch`] keyed by its stimulus tuple. All numeric work derived from
//! a Q matrix (assembly, spectral expansion, dwell rates) happens once per
//! unique epoch and is shared by every cell epoch that references it.

use std::collections::BTreeMap;

use gatesim_core::{Result, CHARGE_CURRENT_PA};
use gatesim_model::{Model, SparseMatrix};
use ndarray::Array1;

use crate::spectral::SpectralExpansion;

/// The stimulus values defining an epoch, keyed by stimulus name.
/// Equality is order-insensitive.
pub type StimulusTuple = BTreeMap<String, f64>;

/// A period of constant stimuli within one simulation cell.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub stimuli: StimulusTuple,
    pub start: f64,
    pub duration: f64,
    pub first_pt: usize,
    pub num_pts: usize,
    /// Handle into the coordinator's [`UniqueEpochs`] registry.
    pub unique: usize,
}

/// Per-stimulus-tuple numeric data shared by all epochs with that tuple.
///
/// Valid only after [`UniqueEpoch::assemble`] for the current variable set.
#[derive(Debug, Clone)]
pub struct UniqueEpoch {
    pub stimuli: StimulusTuple,
    pub state_probabilities: Array1<f64>,
    pub state_attributes: BTreeMap<String, Array1<f64>>,
    pub transition_rates: SparseMatrix,
    pub transition_charges: SparseMatrix,
    /// Net charge current while occupying each state (pA).
    pub state_charge_currents: Array1<f64>,
    /// Spectral expansion of the rate matrix; present after the
    /// decomposition phase when the spectral kernel is selected.
    pub spectral: Option<SpectralExpansion>,
    /// Exponential dwell rate out of each state, `-Q[i, i]`; built by the
    /// decomposition phase when the Monte Carlo kernel is selected.
    pub dwell_rates: Vec<f64>,
}

impl UniqueEpoch {
    fn new(stimuli: StimulusTuple) -> Self {
        Self {
            stimuli,
            state_probabilities: Array1::zeros(0),
            state_attributes: BTreeMap::new(),
            transition_rates: SparseMatrix::new(0),
            transition_charges: SparseMatrix::new(0),
            state_charge_currents: Array1::zeros(0),
            spectral: None,
            dwell_rates: Vec::new(),
        }
    }

    /// Refresh all numeric fields from the model's current parameter map.
    ///
    /// The caller must have run `model.eval_variables(&self.stimuli, v)`
    /// immediately before; this keeps the assembly sequential while the
    /// model's evaluation state is shared.
    pub fn assemble(&mut self, model: &Model) -> Result<()> {
        self.state_probabilities = model.starting_probability()?;
        self.state_attributes = model.state_attributes()?;
        self.transition_rates = model.transition_rates()?;
        self.transition_charges = model.transition_charges()?;
        let n = self.transition_rates.n();
        self.state_charge_currents = if self.transition_charges.nonzeros() > 0 {
            Array1::from_iter((0..n).map(|i| {
                self.transition_rates
                    .row_entries(i)
                    .iter()
                    .map(|&(j, rate)| rate * self.transition_charges.entry(i, j))
                    .sum::<f64>()
                    * CHARGE_CURRENT_PA
            }))
        } else {
            Array1::zeros(n)
        };
        self.spectral = None;
        self.dwell_rates.clear();
        Ok(())
    }

    /// Build the per-state exponential dwell parameters from the assembled
    /// rate matrix. The Monte Carlo counterpart of the spectral expansion.
    pub fn build_dwell_rates(&mut self) {
        let n = self.transition_rates.n();
        self.dwell_rates = (0..n).map(|i| -self.transition_rates.diag(i)).collect();
    }
}

/// Arena of unique epochs owned by the coordinator.
///
/// Cell epochs reference entries by handle, never by pointer; the registry
/// lives as long as the coordinator and is rebuilt by every `init`.
#[derive(Debug, Clone, Default)]
pub struct UniqueEpochs {
    epochs: Vec<UniqueEpoch>,
}

impl UniqueEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.epochs.clear();
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn get(&self, handle: usize) -> &UniqueEpoch {
        &self.epochs[handle]
    }

    pub fn iter(&self) -> impl Iterator<Item = &UniqueEpoch> {
        self.epochs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UniqueEpoch> {
        self.epochs.iter_mut()
    }

    pub fn as_mut_slice(&mut self) -> &mut [UniqueEpoch] {
        &mut self.epochs
    }

    /// Find or create the unique epoch for a stimulus tuple.
    pub fn intern(&mut self, stimuli: &StimulusTuple) -> usize {
        if let Some(handle) = self.epochs.iter().position(|e| e.stimuli == *stimuli) {
            return handle;
        }
        self.epochs.push(UniqueEpoch::new(stimuli.clone()));
        self.epochs.len() - 1
    }
}
