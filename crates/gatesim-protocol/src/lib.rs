//! # GateSim Protocol
//!
//! Stimulus clamp protocols and the simulation kernels that run them.
//!
//! A protocol describes a family of recordings: a rows x cols grid of
//! conditions, each cell discretized to sample points and segmented into
//! epochs of constant stimuli. Epochs with identical stimulus tuples share
//! one deduplicated record carrying everything derived from the model's Q
//! matrix for those stimuli.
//!
//! ## Capabilities
//!
//! 1. **Conditions grids**: `;`/`,`-separated matrices with range shorthand
//! 2. **Stimulus discretization**: square pulses, onset/offset shape
//!    expressions, repetitions
//! 3. **Spectral kernel**: eigen-expansion propagation of occupancy
//! 4. **Monte Carlo kernel**: Gillespie event chains with epoch handling
//! 5. **Derived outputs**: attribute/group/user waveforms, X-Y summaries
//! 6. **Coordinator**: fork/join scheduling per variable set, cancellation
//!
//! The simulation entry point is [`Simulator`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use gatesim_core::{GateSimError, Result, EDGE_EPSILON};
use gatesim_expr::{eval, SymbolTable};
use gatesim_model::{children_of, insert_children};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_mt::Mt;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod conditions;
mod derived;
pub mod export;
mod monte_carlo;
mod registry;
mod simulator;
mod spectral;

use conditions::{grid_limits, pad_grid, parse_grid, parse_series, parse_str_grid, Grid};
pub use monte_carlo::{probability_from_event_chains, EventChain, MonteCarloEvent};
pub use registry::{Epoch, StimulusTuple, UniqueEpoch, UniqueEpochs};
pub use simulator::{SimulationMethod, SimulationOptions, Simulator};
pub use spectral::{equilibrium_probability, spectral_expansion, SpectralExpansion};

// =============================================================================
// SAMPLE INDEX HELPERS
// =============================================================================

fn closest_index(time: &Array1<f64>, target: f64) -> usize {
    let mut closest = 0;
    let mut best = f64::INFINITY;
    for (i, &t) in time.iter().enumerate() {
        let distance = (t - target).abs();
        if distance < best {
            best = distance;
            closest = i;
        }
    }
    closest
}

/// Resolve a `[start, stop]` window to a `(first, count)` sample range,
/// snapping to the nearest sample and rounding up when just below.
pub fn find_indexes_in_range(time: &Array1<f64>, start: f64, stop: f64) -> (usize, usize) {
    let num_pts = time.len();
    if num_pts == 0 {
        return (0, 0);
    }
    let mut first = closest_index(time, start);
    if time[first] < start - EDGE_EPSILON {
        first += 1;
    }
    if first >= num_pts {
        return (num_pts, 0);
    }
    let mut end = closest_index(time, stop);
    if time[end] < stop - EDGE_EPSILON {
        end += 1;
    }
    (first, end.saturating_sub(first))
}

// =============================================================================
// PROTOCOL ENTITIES
// =============================================================================

/// One external stimulus contribution, e.g. a voltage step or ligand pulse.
///
/// All parameters are conditions-matrix strings resolved per grid cell. A
/// stimulus with neither onset nor offset expression contributes a square
/// pulse of `amplitude` over `[start, start + duration)`, repeated
/// `repetitions` times with the given period. Onset/offset expressions are
/// evaluated with `t` rebased to the pulse edge and scaled by the amplitude.
///
/// The names `weight` and `mask` (case-insensitive) are special: they add to
/// the cell's sample weights or build its sample mask instead of becoming a
/// stimulus sample vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Stimulus {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "Duration")]
    pub duration: String,
    #[serde(rename = "Amplitude")]
    pub amplitude: String,
    #[serde(rename = "OnsetExpr")]
    pub onset_expr: String,
    #[serde(rename = "OffsetExpr")]
    pub offset_expr: String,
    #[serde(rename = "Repetitions")]
    pub repetitions: String,
    #[serde(rename = "Period")]
    pub period: String,
    #[serde(skip)]
    starts: Grid<f64>,
    #[serde(skip)]
    durations: Grid<f64>,
    #[serde(skip)]
    amplitudes: Grid<f64>,
    #[serde(skip)]
    onset_exprs: Grid<String>,
    #[serde(skip)]
    offset_exprs: Grid<String>,
    #[serde(skip)]
    repeats: Grid<f64>,
    #[serde(skip)]
    periods: Grid<f64>,
}

impl Default for Stimulus {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: true,
            start: String::new(),
            duration: String::new(),
            amplitude: String::new(),
            onset_expr: String::new(),
            offset_expr: String::new(),
            repetitions: "1".to_string(),
            period: "0".to_string(),
            starts: Grid::new(),
            durations: Grid::new(),
            amplitudes: Grid::new(),
            onset_exprs: Grid::new(),
            offset_exprs: Grid::new(),
            repeats: Grid::new(),
            periods: Grid::new(),
        }
    }
}

impl Stimulus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            ..Self::default()
        }
    }

    /// Sample this stimulus over a cell's time axis.
    ///
    /// Onset/offset expressions are user-authored; evaluation failures are
    /// swallowed and that edge simply contributes nothing.
    pub fn waveform(&self, time: &Array1<f64>, row: usize, col: usize) -> Array1<f64> {
        let num_pts = time.len();
        let mut waveform = Array1::zeros(num_pts);
        let duration = self.durations[row][col];
        let amplitude = self.amplitudes[row][col];
        if duration <= EDGE_EPSILON || amplitude.abs() <= EDGE_EPSILON {
            return waveform;
        }
        let repeats = self.repeats[row][col].max(0.0) as usize;
        for rep in 0..repeats {
            let onset_time = self.starts[row][col] + rep as f64 * self.periods[row][col];
            let offset_time = onset_time + duration;
            let mut first_onset = closest_index(time, onset_time);
            if time[first_onset] < onset_time - EDGE_EPSILON {
                first_onset += 1;
            }
            if first_onset >= num_pts {
                continue;
            }
            let mut first_offset = closest_index(time, offset_time);
            if time[first_offset] < offset_time - EDGE_EPSILON {
                first_offset += 1;
            }
            let num_onset = first_offset.saturating_sub(first_onset);
            let num_offset = num_pts - first_offset.min(num_pts);
            let onset_expr = &self.onset_exprs[row][col];
            let offset_expr = &self.offset_exprs[row][col];
            if !onset_expr.is_empty() || !offset_expr.is_empty() {
                if num_onset > 0 && !onset_expr.is_empty() {
                    let pulse_time: Vec<f64> = (first_onset..first_onset + num_onset)
                        .map(|i| time[i] - onset_time)
                        .collect();
                    let mut symbols = SymbolTable::new();
                    symbols.set_vector("t", &pulse_time);
                    if let Ok(value) = eval(onset_expr, &symbols) {
                        let shape = value.into_vector(num_onset);
                        if shape.len() == num_onset {
                            for (k, s) in shape.iter().enumerate() {
                                waveform[first_onset + k] += amplitude * s;
                            }
                        }
                    }
                }
                if num_offset > 0 && !offset_expr.is_empty() {
                    let pulse_time: Vec<f64> = (first_offset..num_pts)
                        .map(|i| time[i] - offset_time)
                        .collect();
                    let mut symbols = SymbolTable::new();
                    symbols.set_vector("t", &pulse_time);
                    if let Ok(value) = eval(offset_expr, &symbols) {
                        let shape = value.into_vector(num_offset);
                        if shape.len() == num_offset {
                            for (k, s) in shape.iter().enumerate() {
                                waveform[first_offset + k] += amplitude * s;
                            }
                        }
                    }
                }
            } else {
                for i in first_onset..first_onset + num_onset {
                    waveform[i] += amplitude;
                }
            }
        }
        waveform
    }
}

/// A named expression evaluated over each cell's full time course.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Waveform {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Expr")]
    pub expr: String,
}

impl Default for Waveform {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: true,
            expr: String::new(),
        }
    }
}

impl Waveform {
    pub fn new(name: &str, expr: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            expr: expr.to_string(),
            ..Self::default()
        }
    }
}

/// How a summary's Y matrix is normalized after filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Normalization {
    #[default]
    None,
    /// Divide each row by its max absolute value.
    PerRow,
    /// Divide the whole matrix by its global max absolute value.
    AllRows,
}

/// Scalar X/Y reduction of each cell over two independent time windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Summary {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "ExprX")]
    pub expr_x: String,
    #[serde(rename = "ExprY")]
    pub expr_y: String,
    #[serde(rename = "StartX")]
    pub start_x: String,
    #[serde(rename = "DurationX")]
    pub duration_x: String,
    #[serde(rename = "StartY")]
    pub start_y: String,
    #[serde(rename = "DurationY")]
    pub duration_y: String,
    #[serde(rename = "Normalization")]
    pub normalization: Normalization,
    #[serde(skip)]
    expr_xs: Grid<String>,
    #[serde(skip)]
    expr_ys: Grid<String>,
    #[serde(skip)]
    start_xs: Grid<f64>,
    #[serde(skip)]
    duration_xs: Grid<f64>,
    #[serde(skip)]
    start_ys: Grid<f64>,
    #[serde(skip)]
    duration_ys: Grid<f64>,
    /// `(first, count)` X window per grid cell. Valid after protocol init.
    #[serde(skip)]
    window_x: Grid<(usize, usize)>,
    #[serde(skip)]
    window_y: Grid<(usize, usize)>,
    /// Row-major rows x cols scalars, one matrix per variable set.
    #[serde(skip)]
    pub data_x: Vec<Array2<f64>>,
    #[serde(skip)]
    pub data_y: Vec<Array2<f64>>,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: true,
            expr_x: String::new(),
            expr_y: String::new(),
            start_x: String::new(),
            duration_x: String::new(),
            start_y: String::new(),
            duration_y: String::new(),
            normalization: Normalization::None,
            expr_xs: Grid::new(),
            expr_ys: Grid::new(),
            start_xs: Grid::new(),
            duration_xs: Grid::new(),
            start_ys: Grid::new(),
            duration_ys: Grid::new(),
            window_x: Grid::new(),
            window_y: Grid::new(),
            data_x: Vec::new(),
            data_y: Vec::new(),
        }
    }
}

impl Summary {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            ..Self::default()
        }
    }
}

/// A measured target trace for one named waveform, used by the cost
/// function. Samples align to the head of each cell's sample grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceData {
    /// Name of the waveform this trace is compared against.
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Active")]
    pub active: bool,
    /// Comma/whitespace separated samples (range shorthand allowed).
    #[serde(rename = "Data")]
    pub data: String,
    #[serde(skip)]
    samples: Vec<f64>,
}

impl Default for ReferenceData {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: true,
            data: String::new(),
            samples: Vec::new(),
        }
    }
}

// =============================================================================
// SIMULATION CELL
// =============================================================================

/// One cell of a protocol's conditions grid.
///
/// Holds the discretized time axis, stimulus sample vectors, the epoch list
/// and the per-variable-set outputs (probability matrices, waveform maps,
/// event chains). Each cell owns an independent, entropy-seeded MT19937
/// stream so Monte Carlo runs are reproducible per cell and uncorrelated
/// across cells.
#[derive(Clone)]
pub struct Simulation {
    pub time: Array1<f64>,
    pub end_time: f64,
    pub stimuli: BTreeMap<String, Array1<f64>>,
    pub epochs: Vec<Epoch>,
    pub weight: Array1<f64>,
    /// `true` = sample participates in the cost function.
    pub mask: Vec<bool>,
    /// Per variable set; columns are time-dependent occupancy per state.
    pub probability: Vec<Array2<f64>>,
    /// Per variable set; state attribute, group and user waveforms by name.
    pub waveforms: Vec<BTreeMap<String, Array1<f64>>>,
    /// Per variable set; one event chain per Monte Carlo run.
    pub events: Vec<Vec<EventChain>>,
    pub(crate) rng: Mt,
}

impl Simulation {
    pub fn new(
        time: Array1<f64>,
        end_time: f64,
        stimuli: BTreeMap<String, Array1<f64>>,
        weight: Array1<f64>,
        mask: Vec<bool>,
    ) -> Self {
        Self {
            time,
            end_time,
            stimuli,
            epochs: Vec::new(),
            weight,
            mask,
            probability: Vec::new(),
            waveforms: Vec::new(),
            events: Vec::new(),
            rng: Mt::new(rand::thread_rng().gen()),
        }
    }

    /// Segment the sample axis into epochs of constant stimuli: a new epoch
    /// opens at every sample where any stimulus value changes.
    pub fn find_epochs(&mut self) {
        self.epochs.clear();
        let num_pts = self.time.len();
        if num_pts == 0 {
            return;
        }
        let stimuli_at = |i: usize| -> StimulusTuple {
            self.stimuli
                .iter()
                .map(|(name, samples)| (name.clone(), samples[i]))
                .collect()
        };
        self.epochs.push(Epoch {
            stimuli: stimuli_at(0),
            start: self.time[0],
            duration: 0.0,
            first_pt: 0,
            num_pts: 0,
            unique: 0,
        });
        for i in 1..num_pts {
            let changed = self.stimuli.values().any(|samples| samples[i] != samples[i - 1]);
            if changed {
                let start = self.time[i];
                let stimuli = stimuli_at(i);
                if let Some(last) = self.epochs.last_mut() {
                    last.duration = start - last.start;
                    last.num_pts = i - last.first_pt;
                }
                self.epochs.push(Epoch {
                    stimuli,
                    start,
                    duration: 0.0,
                    first_pt: i,
                    num_pts: 0,
                    unique: 0,
                });
            }
        }
        if let Some(last) = self.epochs.last_mut() {
            last.duration = self.end_time - last.start;
            last.num_pts = num_pts - last.first_pt;
        }
    }
}

// =============================================================================
// PROTOCOL
// =============================================================================

/// A stimulus clamp protocol: timing, stimuli, derived outputs and the
/// rows x cols grid of simulations it expands to.
#[derive(Clone)]
pub struct Protocol {
    pub name: String,
    pub notes: String,
    /// Conditions strings; the grid size is the max over all of them.
    pub start: String,
    pub duration: String,
    pub sample_interval: String,
    pub weight: String,
    pub start_equilibrated: bool,
    pub stimuli: Vec<Stimulus>,
    pub waveforms: Vec<Waveform>,
    pub summaries: Vec<Summary>,
    pub reference_data: Vec<ReferenceData>,
    pub simulations: Vec<Vec<Simulation>>,
    pub state_names: Vec<String>,
    starts: Grid<f64>,
    durations: Grid<f64>,
    sample_intervals: Grid<f64>,
    weights: Grid<f64>,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            name: String::new(),
            notes: String::new(),
            start: "0".to_string(),
            duration: "1".to_string(),
            sample_interval: "0.001".to_string(),
            weight: "1".to_string(),
            start_equilibrated: false,
            stimuli: Vec::new(),
            waveforms: Vec::new(),
            summaries: Vec::new(),
            reference_data: Vec::new(),
            simulations: Vec::new(),
            state_names: Vec::new(),
            starts: Grid::new(),
            durations: Grid::new(),
            sample_intervals: Grid::new(),
            weights: Grid::new(),
        }
    }
}

impl Protocol {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            ..Self::default()
        }
    }

    /// Grid shape as `(rows, cols)`.
    pub fn grid_shape(&self) -> (usize, usize) {
        let rows = self.simulations.len();
        let cols = self.simulations.first().map_or(0, Vec::len);
        (rows, cols)
    }

    /// Rebuild the simulation grid prior to running.
    ///
    /// Parses and pads all conditions matrices, discretizes every cell to
    /// sample points, builds stimulus sample vectors (routing `weight` and
    /// `mask` specially), segments epochs and interns them in the shared
    /// unique-epoch registry, reseeds each cell's generator and resolves
    /// summary windows to sample ranges.
    pub fn init(&mut self, registry: &mut UniqueEpochs, state_names: &[String]) -> Result<()> {
        self.state_names = state_names.to_vec();
        self.starts = parse_grid(&self.start);
        self.durations = parse_grid(&self.duration);
        self.sample_intervals = parse_grid(&self.sample_interval);
        self.weights = parse_grid(&self.weight);
        for stimulus in self.stimuli.iter_mut().filter(|s| s.active) {
            stimulus.starts = parse_grid(&stimulus.start);
            stimulus.durations = parse_grid(&stimulus.duration);
            stimulus.amplitudes = parse_grid(&stimulus.amplitude);
            stimulus.onset_exprs = parse_str_grid(&stimulus.onset_expr);
            stimulus.offset_exprs = parse_str_grid(&stimulus.offset_expr);
            stimulus.repeats = parse_grid(&stimulus.repetitions);
            stimulus.periods = parse_grid(&stimulus.period);
        }
        for summary in self.summaries.iter_mut().filter(|s| s.active) {
            summary.expr_xs = parse_str_grid(&summary.expr_x);
            summary.expr_ys = parse_str_grid(&summary.expr_y);
            summary.start_xs = parse_grid(&summary.start_x);
            summary.duration_xs = parse_grid(&summary.duration_x);
            summary.start_ys = parse_grid(&summary.start_y);
            summary.duration_ys = parse_grid(&summary.duration_y);
        }
        for reference in self.reference_data.iter_mut().filter(|r| r.active) {
            reference.samples = parse_series(&reference.data);
        }

        let mut rows = 1;
        let mut cols = 1;
        grid_limits(&self.starts, &mut rows, &mut cols);
        grid_limits(&self.durations, &mut rows, &mut cols);
        grid_limits(&self.sample_intervals, &mut rows, &mut cols);
        grid_limits(&self.weights, &mut rows, &mut cols);
        for stimulus in self.stimuli.iter().filter(|s| s.active) {
            grid_limits(&stimulus.starts, &mut rows, &mut cols);
            grid_limits(&stimulus.durations, &mut rows, &mut cols);
            grid_limits(&stimulus.amplitudes, &mut rows, &mut cols);
            grid_limits(&stimulus.onset_exprs, &mut rows, &mut cols);
            grid_limits(&stimulus.offset_exprs, &mut rows, &mut cols);
            grid_limits(&stimulus.repeats, &mut rows, &mut cols);
            grid_limits(&stimulus.periods, &mut rows, &mut cols);
        }

        pad_grid(&mut self.starts, rows, cols, 0.0);
        pad_grid(&mut self.durations, rows, cols, 0.0);
        pad_grid(&mut self.sample_intervals, rows, cols, 0.0);
        pad_grid(&mut self.weights, rows, cols, 1.0);
        for stimulus in self.stimuli.iter_mut().filter(|s| s.active) {
            pad_grid(&mut stimulus.starts, rows, cols, 0.0);
            pad_grid(&mut stimulus.durations, rows, cols, 0.0);
            pad_grid(&mut stimulus.amplitudes, rows, cols, 0.0);
            pad_grid(&mut stimulus.onset_exprs, rows, cols, String::new());
            pad_grid(&mut stimulus.offset_exprs, rows, cols, String::new());
            pad_grid(&mut stimulus.repeats, rows, cols, 1.0);
            pad_grid(&mut stimulus.periods, rows, cols, 0.0);
        }
        for summary in self.summaries.iter_mut().filter(|s| s.active) {
            pad_grid(&mut summary.expr_xs, rows, cols, String::new());
            pad_grid(&mut summary.expr_ys, rows, cols, String::new());
            pad_grid(&mut summary.start_xs, rows, cols, 0.0);
            pad_grid(&mut summary.duration_xs, rows, cols, 0.0);
            pad_grid(&mut summary.start_ys, rows, cols, 0.0);
            pad_grid(&mut summary.duration_ys, rows, cols, 0.0);
            summary.window_x = vec![vec![(0, 0); cols]; rows];
            summary.window_y = vec![vec![(0, 0); cols]; rows];
        }

        let mut simulations = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut sim_row = Vec::with_capacity(cols);
            for col in 0..cols {
                let start = self.starts[row][col];
                let duration = self.durations[row][col];
                let dt = self.sample_intervals[row][col];
                if dt <= 0.0 {
                    return Err(GateSimError::ExprParse(self.sample_interval.clone()));
                }
                let num_steps = (duration / dt).floor() as usize;
                let time = Array1::from_iter((0..=num_steps).map(|k| start + k as f64 * dt));
                let end_time = start + duration;
                let num_pts = time.len();

                let mut weight = Array1::from_elem(num_pts, self.weights[row][col]);
                let mut mask_sum: Array1<f64> = Array1::zeros(num_pts);
                let mut stimuli: BTreeMap<String, Array1<f64>> = BTreeMap::new();
                for stimulus in self.stimuli.iter().filter(|s| s.active) {
                    let samples = stimulus.waveform(&time, row, col);
                    let lower = stimulus.name.to_lowercase();
                    if lower == "weight" {
                        weight = weight + samples;
                    } else if lower == "mask" {
                        mask_sum = mask_sum + samples;
                    } else {
                        stimuli
                            .entry(stimulus.name.clone())
                            .and_modify(|existing| *existing = &*existing + &samples)
                            .or_insert(samples);
                    }
                }
                // Zero = unmasked, non-zero = masked out.
                let mask: Vec<bool> = mask_sum.iter().map(|&v| v == 0.0).collect();

                let mut sim = Simulation::new(time, end_time, stimuli, weight, mask);
                sim.find_epochs();
                for epoch in &mut sim.epochs {
                    epoch.unique = registry.intern(&epoch.stimuli);
                }
                sim_row.push(sim);
            }
            simulations.push(sim_row);
        }
        self.simulations = simulations;

        for summary in self.summaries.iter_mut().filter(|s| s.active) {
            for row in 0..rows {
                for col in 0..cols {
                    let time = &self.simulations[row][col].time;
                    let start_x = summary.start_xs[row][col];
                    summary.window_x[row][col] =
                        find_indexes_in_range(time, start_x, start_x + summary.duration_xs[row][col]);
                    let start_y = summary.start_ys[row][col];
                    summary.window_y[row][col] =
                        find_indexes_in_range(time, start_y, start_y + summary.duration_ys[row][col]);
                }
            }
        }
        Ok(())
    }

    /// Weighted sum of squared residuals against all active reference data
    /// over unmasked samples, for one variable set.
    pub fn cost(&self, set_index: usize) -> Result<f64> {
        let mut total = 0.0;
        for reference in self.reference_data.iter().filter(|r| r.active) {
            for sim_row in &self.simulations {
                for sim in sim_row {
                    let waveforms = match sim.waveforms.get(set_index) {
                        Some(waveforms) => waveforms,
                        None => continue,
                    };
                    let curve = match waveforms.get(&reference.name) {
                        Some(curve) => curve,
                        None => continue,
                    };
                    if reference.samples.len() > curve.len() {
                        return Err(GateSimError::RefShape(format!(
                            "reference '{}' has {} samples but the simulation has {}",
                            reference.name,
                            reference.samples.len(),
                            curve.len()
                        )));
                    }
                    for (k, &target) in reference.samples.iter().enumerate() {
                        if sim.mask[k] {
                            total += sim.weight[k] * (curve[k] - target).powi(2);
                        }
                    }
                }
            }
        }
        Ok(total)
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

fn string_of(tree: &Json, key: &str, default: &str) -> String {
    tree.get(key)
        .and_then(Json::as_str)
        .unwrap_or(default)
        .to_string()
}

impl Protocol {
    /// Serialize to the project tree format: property map plus children
    /// grouped under their type names.
    pub fn to_json(&self) -> Result<Json> {
        let mut map = serde_json::Map::new();
        map.insert("Name".to_string(), Json::String(self.name.clone()));
        map.insert("Notes".to_string(), Json::String(self.notes.clone()));
        map.insert("Start".to_string(), Json::String(self.start.clone()));
        map.insert("Duration".to_string(), Json::String(self.duration.clone()));
        map.insert(
            "SampleInterval".to_string(),
            Json::String(self.sample_interval.clone()),
        );
        map.insert("Weight".to_string(), Json::String(self.weight.clone()));
        map.insert(
            "StartEquilibrated".to_string(),
            Json::Bool(self.start_equilibrated),
        );
        insert_children(&mut map, "Stimulus", &self.stimuli)?;
        insert_children(&mut map, "Waveform", &self.waveforms)?;
        insert_children(&mut map, "Summary", &self.summaries)?;
        insert_children(&mut map, "ReferenceData", &self.reference_data)?;
        Ok(Json::Object(map))
    }

    /// Deserialize from the project tree format. Unknown child types are
    /// skipped.
    pub fn from_json(tree: &Json) -> Result<Protocol> {
        let mut protocol = Protocol::new(&string_of(tree, "Name", ""));
        protocol.notes = string_of(tree, "Notes", "");
        protocol.start = string_of(tree, "Start", "0");
        protocol.duration = string_of(tree, "Duration", "1");
        protocol.sample_interval = string_of(tree, "SampleInterval", "0.001");
        protocol.weight = string_of(tree, "Weight", "1");
        protocol.start_equilibrated = tree
            .get("StartEquilibrated")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        protocol.stimuli = children_of(tree, "Stimulus")?;
        protocol.waveforms = children_of(tree, "Waveform")?;
        protocol.summaries = children_of(tree, "Summary")?;
        protocol.reference_data = children_of(tree, "ReferenceData")?;
        Ok(protocol)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut root = serde_json::Map::new();
        root.insert("Protocol".to_string(), self.to_json()?);
        fs::write(path, serde_json::to_string_pretty(&Json::Object(root))?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Protocol> {
        let buffer = fs::read_to_string(path)?;
        let root: Json = serde_json::from_str(&buffer)?;
        Protocol::from_json(root.get("Protocol").unwrap_or(&root))
    }
}

// =============================================================================
// TESTS
// =============================================================================
