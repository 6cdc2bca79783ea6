//! Simulation coordinator.
//!
//! One invocation runs, per variable set index: sequential variable
//! evaluation and unique-epoch assembly, a parallel decomposition phase
//! over unique epochs, a parallel propagation phase over all simulation
//! cells of all protocols, then the serial derived-output pass. Phases are
//! separated by joins; cells and unique epochs are disjoint, so neither
//! parallel phase needs locks. A shared atomic flag cancels cooperatively.

use gatesim_core::{AbortFlag, GateSimError, Result};
use gatesim_model::Model;
use rand::Rng;
use rand_mt::Mt;
use rayon::prelude::*;
use tracing::debug;

use crate::derived::fill_derived_outputs;
use crate::registry::UniqueEpochs;
use crate::spectral::spectral_expansion;
use crate::Protocol;

/// Which kernel propagates occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMethod {
    /// Eigen-expansion of each unique epoch's Q matrix.
    Spectral,
    /// Gillespie event chains per run.
    MonteCarlo,
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub method: SimulationMethod,
    /// Monte Carlo runs per cell and variable set.
    pub monte_carlo_runs: usize,
    /// Append new runs to stored chains instead of replacing them.
    pub accumulate_runs: bool,
    /// Reconstruct probability matrices from the chains after all runs.
    pub sample_runs: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            method: SimulationMethod::Spectral,
            monte_carlo_runs: 1000,
            accumulate_runs: false,
            sample_runs: true,
        }
    }
}

/// Owns the model, the protocols and the unique-epoch registry, and drives
/// simulation and optimization.
pub struct Simulator {
    pub model: Model,
    pub protocols: Vec<Protocol>,
    pub options: SimulationOptions,
    pub state_names: Vec<String>,
    pub unique_epochs: UniqueEpochs,
    pub abort: AbortFlag,
    /// Last error message, for the UI layer.
    pub message: Option<String>,
}

impl Simulator {
    pub fn new(model: Model, protocols: Vec<Protocol>) -> Self {
        Self {
            model,
            protocols,
            options: SimulationOptions::default(),
            state_names: Vec::new(),
            unique_epochs: UniqueEpochs::new(),
            abort: AbortFlag::new(),
            message: None,
        }
    }

    /// Rebuild model indexes, the simulation grids and the unique-epoch
    /// registry. Invalidates all previously derived data.
    pub fn init(&mut self) -> Result<()> {
        self.state_names = self.model.init()?;
        self.unique_epochs.clear();
        for protocol in &mut self.protocols {
            protocol.init(&mut self.unique_epochs, &self.state_names)?;
        }
        debug!(
            unique_epochs = self.unique_epochs.len(),
            states = self.state_names.len(),
            "initialized"
        );
        Ok(())
    }

    /// Run all variable sets. Assumes `init` has been called; on error the
    /// abort flag is raised and the message is recorded. Partially written
    /// outputs for earlier variable sets are left in place.
    pub fn run(&mut self) -> Result<()> {
        match self.run_inner() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.abort.raise();
                self.message = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Convenience: reset cancellation state, `init`, then `run`.
    pub fn simulate(&mut self) -> Result<()> {
        self.abort.reset();
        self.message = None;
        self.init()?;
        self.run()
    }

    fn run_inner(&mut self) -> Result<()> {
        let num_sets = self.model.num_variable_sets();
        for set_index in 0..num_sets {
            // Sequential: variable evaluation + numeric assembly per unique
            // epoch. The parameter map is shared mutable state, so this
            // phase cannot fan out.
            for epoch in self.unique_epochs.iter_mut() {
                self.abort.check()?;
                self.model.eval_variables(&epoch.stimuli, set_index)?;
                epoch.assemble(&self.model)?;
            }
            debug!(set_index, "assembly complete");

            // Parallel: per-unique-epoch decomposition — the spectral
            // expansion, or the dwell distributions the event-chain
            // sampler draws from.
            let abort = &self.abort;
            match self.options.method {
                SimulationMethod::Spectral => {
                    self.unique_epochs
                        .as_mut_slice()
                        .par_iter_mut()
                        .try_for_each(|epoch| {
                            abort.check()?;
                            epoch.spectral =
                                Some(spectral_expansion(&epoch.transition_rates, abort)?);
                            Ok::<(), GateSimError>(())
                        })?;
                }
                SimulationMethod::MonteCarlo => {
                    self.unique_epochs
                        .as_mut_slice()
                        .par_iter_mut()
                        .try_for_each(|epoch| {
                            abort.check()?;
                            epoch.build_dwell_rates();
                            Ok::<(), GateSimError>(())
                        })?;
                }
            }
            debug!(set_index, "decomposition complete");

            // Parallel: propagation per simulation cell.
            let registry = &self.unique_epochs;
            let abort = &self.abort;
            let options = self.options.clone();
            self.protocols.par_iter_mut().try_for_each(|protocol| {
                let start_equilibrated = protocol.start_equilibrated;
                protocol.simulations.par_iter_mut().try_for_each(|sim_row| {
                    sim_row.par_iter_mut().try_for_each(|sim| {
                        abort.check()?;
                        let first = match sim.epochs.first() {
                            Some(epoch) => epoch.unique,
                            None => return Ok(()),
                        };
                        let starting = registry.get(first).state_probabilities.clone();
                        match options.method {
                            SimulationMethod::Spectral => sim.spectral_simulation(
                                registry,
                                starting,
                                start_equilibrated,
                                set_index,
                                abort,
                            ),
                            SimulationMethod::MonteCarlo => sim.monte_carlo_simulation(
                                registry,
                                starting,
                                options.monte_carlo_runs,
                                options.accumulate_runs,
                                options.sample_runs,
                                start_equilibrated,
                                set_index,
                                abort,
                            ),
                        }
                    })
                })
            })?;
            debug!(set_index, "propagation complete");

            // Serial: derived waveforms and summaries.
            for protocol in &mut self.protocols {
                fill_derived_outputs(
                    protocol,
                    &self.model,
                    &self.unique_epochs,
                    self.options.method,
                    num_sets,
                    set_index,
                    &self.abort,
                )?;
            }
            debug!(set_index, "derived outputs complete");
        }
        Ok(())
    }

    /// Summed protocol cost over all variable sets.
    pub fn cost(&self) -> Result<f64> {
        let num_sets = self.model.num_variable_sets();
        let mut total = 0.0;
        for protocol in &self.protocols {
            for set_index in 0..num_sets {
                total += protocol.cost(set_index)?;
            }
        }
        Ok(total)
    }

    /// Fit the model's free variables to the reference data by iterated
    /// random perturbation within bounds, keeping improvements of the
    /// summed cost. Returns the best cost found; the model is left at the
    /// best parameter values, with outputs from a final simulation of them.
    pub fn optimize(&mut self, iterations: usize) -> Result<f64> {
        self.simulate()?;
        let mut best_cost = self.cost()?;
        let free = self.model.free_variables();
        if free.is_empty() || iterations == 0 {
            return Ok(best_cost);
        }
        let mut best_values: Vec<f64> = free.iter().map(|f| f.value).collect();
        let bounds: Vec<(f64, f64)> = free.iter().map(|f| (f.min, f.max)).collect();
        let mut rng = Mt::new(rand::thread_rng().gen());
        for iteration in 0..iterations {
            self.abort.check()?;
            // Shrink the step as the search progresses.
            let step = 0.05 + 0.5 * (1.0 - iteration as f64 / iterations as f64);
            let candidate: Vec<f64> = best_values
                .iter()
                .zip(&bounds)
                .map(|(&value, &(min, max))| {
                    let span = if max > min {
                        max - min
                    } else {
                        value.abs().max(1.0)
                    };
                    let jitter = (rng.gen::<f64>() - 0.5) * span * step;
                    let proposed = value + jitter;
                    if max > min {
                        proposed.clamp(min, max)
                    } else {
                        proposed
                    }
                })
                .collect();
            self.model.set_free_variables(&candidate)?;
            self.simulate()?;
            let cost = self.cost()?;
            if cost < best_cost {
                debug!(iteration, cost, "accepted candidate");
                best_cost = cost;
                best_values = candidate;
            }
        }
        self.model.set_free_variables(&best_values)?;
        self.simulate()?;
        Ok(best_cost)
    }

    /// Largest conservation error across every cell and variable set.
    pub fn max_probability_error(&self) -> f64 {
        self.protocols
            .iter()
            .flat_map(|protocol| protocol.simulations.iter())
            .flat_map(|sim_row| sim_row.iter())
            .map(|sim| sim.max_probability_error())
            .fold(0.0, f64::max)
    }
}
