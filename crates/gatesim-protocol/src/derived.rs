//! Derived waveforms and summaries.
//!
//! After propagation, each cell's probability matrix is reduced to named
//! time courses: attribute waveforms (occupancy-weighted state values per
//! epoch), state-group occupancy sums, and user expressions evaluated over
//! a symbol table binding `t`, the stimulus vectors, every state column,
//! and every waveform built so far. Summaries then reduce two windows of
//! that table to scalar X/Y values per grid cell.

use std::collections::BTreeMap;

use gatesim_core::{AbortFlag, GateSimError, Result};
use gatesim_expr::{eval, SymbolTable, Value};
use gatesim_model::{Model, ParameterMap};
use ndarray::{Array1, Array2};

use crate::monte_carlo::probability_from_event_chains;
use crate::registry::UniqueEpochs;
use crate::simulator::SimulationMethod;
use crate::{Normalization, Protocol};

/// Everything a cell's expressions may reference, window-sliceable.
struct CellBindings<'a> {
    parameters: &'a ParameterMap,
    time: Vec<f64>,
    stimuli: Vec<(String, Vec<f64>)>,
    state_names: &'a [String],
    state_cols: Vec<Vec<f64>>,
    waveforms: BTreeMap<String, Vec<f64>>,
}

impl CellBindings<'_> {
    /// Build a symbol table over the sample window `[first, first + count)`.
    /// Vectors shadow parameters of the same name, parameters shadow nothing.
    fn symbols(&self, first: usize, count: usize) -> SymbolTable<'_> {
        let mut symbols = SymbolTable::new();
        for (name, value) in self.parameters {
            symbols.set_scalar(name, *value);
        }
        symbols.set_vector("t", &self.time[first..first + count]);
        for (name, samples) in &self.stimuli {
            symbols.set_vector(name, &samples[first..first + count]);
        }
        for (j, name) in self.state_names.iter().enumerate() {
            if j < self.state_cols.len() {
                symbols.set_vector(name, &self.state_cols[j][first..first + count]);
            }
        }
        for (name, samples) in &self.waveforms {
            symbols.set_vector(name, &samples[first..first + count]);
        }
        symbols
    }
}

/// Fill waveforms and summaries for one protocol and one variable set.
/// Runs serially after the propagation join.
pub(crate) fn fill_derived_outputs(
    protocol: &mut Protocol,
    model: &Model,
    registry: &UniqueEpochs,
    method: SimulationMethod,
    num_sets: usize,
    set_index: usize,
    abort: &AbortFlag,
) -> Result<()> {
    let (rows, cols) = protocol.grid_shape();
    for summary in protocol.summaries.iter_mut().filter(|s| s.active) {
        while summary.data_x.len() <= set_index {
            summary.data_x.push(Array2::zeros((rows, cols)));
        }
        while summary.data_y.len() <= set_index {
            summary.data_y.push(Array2::zeros((rows, cols)));
        }
        summary.data_x[set_index] = Array2::zeros((rows, cols));
        summary.data_y[set_index] = Array2::zeros((rows, cols));
    }

    let mut simulations = std::mem::take(&mut protocol.simulations);
    let result = fill_cells(
        protocol,
        &mut simulations,
        model,
        registry,
        method,
        num_sets,
        set_index,
        abort,
    );
    protocol.simulations = simulations;
    result?;

    for summary in protocol.summaries.iter_mut().filter(|s| s.active) {
        let data_y = &mut summary.data_y[set_index];
        match summary.normalization {
            Normalization::None => {}
            Normalization::PerRow => {
                for mut data_row in data_y.rows_mut() {
                    let peak = data_row.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
                    data_row.mapv_inplace(|v| v / peak);
                }
            }
            Normalization::AllRows => {
                let peak = data_y.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
                data_y.mapv_inplace(|v| v / peak);
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fill_cells(
    protocol: &mut Protocol,
    simulations: &mut [Vec<crate::Simulation>],
    model: &Model,
    registry: &UniqueEpochs,
    method: SimulationMethod,
    num_sets: usize,
    set_index: usize,
    abort: &AbortFlag,
) -> Result<()> {
    for (row, sim_row) in simulations.iter_mut().enumerate() {
        for (col, sim) in sim_row.iter_mut().enumerate() {
            abort.check()?;
            let num_pts = sim.time.len();
            let first_epoch = match sim.epochs.first() {
                Some(epoch) => epoch,
                None => continue,
            };
            let num_states = registry.get(first_epoch.unique).transition_rates.n();

            // The probability matrix for this variable set: as propagated,
            // or resampled from event chains when the Monte Carlo kernel
            // skipped sampling.
            let probability: Option<Array2<f64>> = match sim
                .probability
                .get(set_index)
                .filter(|p| p.nrows() == num_pts && p.ncols() == num_states)
            {
                Some(p) => Some(p.clone()),
                None if method == SimulationMethod::MonteCarlo => {
                    match sim.events.get(set_index) {
                        Some(chains) => Some(probability_from_event_chains(
                            &sim.time,
                            sim.end_time,
                            num_states,
                            chains,
                            abort,
                        )?),
                        None => None,
                    }
                }
                None => None,
            };

            let mut bindings = CellBindings {
                parameters: &model.parameters,
                time: sim.time.to_vec(),
                stimuli: sim
                    .stimuli
                    .iter()
                    .map(|(name, samples)| (name.clone(), samples.to_vec()))
                    .collect(),
                state_names: &protocol.state_names,
                state_cols: match &probability {
                    Some(p) => (0..num_states).map(|j| p.column(j).to_vec()).collect(),
                    None => Vec::new(),
                },
                waveforms: BTreeMap::new(),
            };

            if let Some(p) = &probability {
                // Attribute waveforms, per epoch so each uses its own
                // unique-epoch attribute vector.
                for epoch in &sim.epochs {
                    let unique = registry.get(epoch.unique);
                    for (attr_name, attr_values) in &unique.state_attributes {
                        let samples = bindings
                            .waveforms
                            .entry(attr_name.clone())
                            .or_insert_with(|| vec![0.0; num_pts]);
                        for k in 0..epoch.num_pts {
                            let t = epoch.first_pt + k;
                            samples[t] = (0..num_states)
                                .map(|j| p[[t, j]] * attr_values[j])
                                .sum();
                        }
                    }
                }
                // State group occupancy sums.
                for group in model.groups.iter().filter(|g| g.active) {
                    let mut samples = vec![0.0; num_pts];
                    for &index in &group.state_indexes {
                        for (t, sample) in samples.iter_mut().enumerate() {
                            *sample += p[[t, index]];
                        }
                    }
                    bindings.waveforms.insert(group.name.clone(), samples);
                }
            }

            // User waveforms, in declaration order; each may reference the
            // ones before it.
            for waveform in protocol.waveforms.iter().filter(|w| w.active) {
                abort.check()?;
                let symbols = bindings.symbols(0, num_pts);
                let value = eval(&waveform.expr, &symbols)?;
                let samples = match value {
                    Value::Vector(v) if v.len() == num_pts => v.to_vec(),
                    Value::Scalar(x) if num_pts == 1 => vec![x],
                    other => {
                        return Err(GateSimError::ExprShape {
                            expr: waveform.expr.clone(),
                            detail: format!("expected {} samples, got {}", num_pts, other.len()),
                        })
                    }
                };
                bindings.waveforms.insert(waveform.name.clone(), samples);
            }

            // Summaries.
            for summary in protocol.summaries.iter_mut().filter(|s| s.active) {
                abort.check()?;
                let (first_x, count_x) = summary.window_x[row][col];
                let x = {
                    let symbols = bindings.symbols(first_x, count_x);
                    eval(&summary.expr_xs[row][col], &symbols)?
                        .into_scalar(&summary.expr_xs[row][col])?
                };
                summary.data_x[set_index][[row, col]] = x;
                let (first_y, count_y) = summary.window_y[row][col];
                let y = {
                    let symbols = bindings.symbols(first_y, count_y);
                    eval(&summary.expr_ys[row][col], &symbols)?
                        .into_scalar(&summary.expr_ys[row][col])?
                };
                summary.data_y[set_index][[row, col]] = y;
            }

            while sim.waveforms.len() < num_sets.max(set_index + 1) {
                sim.waveforms.push(BTreeMap::new());
            }
            sim.waveforms[set_index] = bindings
                .waveforms
                .into_iter()
                .map(|(name, samples)| (name, Array1::from(samples)))
                .collect();
        }
    }
    Ok(())
}
