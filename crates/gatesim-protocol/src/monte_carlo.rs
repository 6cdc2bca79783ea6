//! Monte Carlo kernel.
//!
//! A Gillespie-style sampler draws event chains of `(state, dwell)` pairs
//! per run: exponential dwells from the current epoch's rates, categorical
//! next-state draws from the rates leaving the current state. Dwells that
//! cross an epoch boundary are truncated there and extended with a fresh
//! draw under the next epoch's rates (the exponential is memoryless, so the
//! concatenation is exact).

use gatesim_core::{AbortFlag, Result, EDGE_EPSILON};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::registry::UniqueEpochs;
use crate::spectral::{equilibrium_probability, to_dmatrix};
use crate::Simulation;

/// One dwell of a Monte Carlo run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonteCarloEvent {
    pub state: usize,
    pub duration: f64,
}

/// Ordered events of a single run, covering `[0, end_time]`.
pub type EventChain = Vec<MonteCarloEvent>;

fn sample_exp<R: Rng>(rng: &mut R, rate: f64) -> f64 {
    match Exp::new(rate) {
        Ok(dist) => dist.sample(rng),
        Err(_) => f64::INFINITY,
    }
}

impl Simulation {
    /// Run `num_runs` independent event chains for one variable set.
    ///
    /// With `accumulate` the new chains append to any already stored for
    /// this set instead of replacing them; with `sample` the stored chains
    /// are reduced to a probability matrix afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn monte_carlo_simulation(
        &mut self,
        registry: &UniqueEpochs,
        starting: Array1<f64>,
        num_runs: usize,
        accumulate: bool,
        sample: bool,
        start_equilibrated: bool,
        set_index: usize,
        abort: &AbortFlag,
    ) -> Result<()> {
        let num_states = starting.len();
        let starting = if start_equilibrated {
            match self.epochs.first() {
                Some(first) => {
                    let q = to_dmatrix(&registry.get(first.unique).transition_rates);
                    let pi = equilibrium_probability(&q)?;
                    Array1::from_iter(pi.iter().copied())
                }
                None => starting,
            }
        } else {
            starting
        };

        while self.events.len() <= set_index {
            self.events.push(Vec::new());
        }
        if !accumulate {
            self.events[set_index].clear();
        }
        for _ in 0..num_runs {
            abort.check()?;
            let chain = self.run_event_chain(registry, &starting, abort)?;
            self.events[set_index].push(chain);
        }

        if sample {
            let p = probability_from_event_chains(
                &self.time,
                self.end_time,
                num_states,
                &self.events[set_index],
                abort,
            )?;
            while self.probability.len() <= set_index {
                self.probability.push(Array2::zeros((0, 0)));
            }
            self.probability[set_index] = p;
        }
        Ok(())
    }

    fn run_event_chain(
        &mut self,
        registry: &UniqueEpochs,
        starting: &Array1<f64>,
        abort: &AbortFlag,
    ) -> Result<EventChain> {
        let num_states = starting.len();
        let mut chain = EventChain::new();
        chain.reserve(1000);

        // Starting state by inverse CDF on the starting probability.
        let draw: f64 = self.rng.gen();
        let mut state = num_states.saturating_sub(1);
        let mut cumulative = 0.0;
        for (i, &p) in starting.iter().enumerate() {
            cumulative += p;
            if cumulative > draw {
                state = i;
                break;
            }
        }

        let mut elapsed = 0.0;
        let mut epoch_index = 0;
        let num_epochs = self.epochs.len();
        while elapsed < self.end_time && epoch_index < num_epochs {
            abort.check()?;
            let mut unique = registry.get(self.epochs[epoch_index].unique);
            let mut k_out = unique.dwell_rates[state];
            if k_out < EDGE_EPSILON {
                // Absorbing under the current stimuli.
                chain.push(MonteCarloEvent {
                    state,
                    duration: self.end_time - elapsed,
                });
                break;
            }
            let mut dwell = sample_exp(&mut self.rng, k_out);
            // Carry the dwell across epoch boundaries.
            loop {
                let epoch_end = {
                    let epoch = &self.epochs[epoch_index];
                    epoch.start + epoch.duration
                };
                if elapsed + dwell <= epoch_end {
                    break;
                }
                dwell = epoch_end - elapsed;
                epoch_index += 1;
                if epoch_index == num_epochs {
                    break;
                }
                unique = registry.get(self.epochs[epoch_index].unique);
                k_out = unique.dwell_rates[state];
                if k_out < EDGE_EPSILON {
                    epoch_index = num_epochs;
                    break;
                }
                dwell += sample_exp(&mut self.rng, k_out);
            }
            if epoch_index == num_epochs {
                // The protocol ends before the next transition.
                chain.push(MonteCarloEvent {
                    state,
                    duration: self.end_time - elapsed,
                });
                break;
            }
            chain.push(MonteCarloEvent {
                state,
                duration: dwell,
            });
            elapsed += dwell;
            if elapsed < self.end_time {
                // Categorical draw over the rates leaving the current state.
                let draw: f64 = self.rng.gen();
                let mut cumulative = 0.0;
                for &(j, rate) in unique.transition_rates.row_entries(state) {
                    cumulative += rate / k_out;
                    if cumulative >= draw {
                        state = j;
                        break;
                    }
                }
            }
        }
        Ok(chain)
    }

    /// Largest `|sum_j P[k, j] - 1|` across all stored variable sets.
    pub fn max_probability_error(&self) -> f64 {
        self.probability
            .iter()
            .map(|p| {
                p.outer_iter()
                    .map(|row| (row.sum() - 1.0).abs())
                    .fold(0.0, f64::max)
            })
            .fold(0.0, f64::max)
    }
}

/// Reconstruct a probability matrix by averaging event-chain occupancy over
/// each sample interval. Interval `k` spans `[time[k], time[k + 1])`; the
/// last interval extends to `end_time`.
pub fn probability_from_event_chains(
    time: &Array1<f64>,
    end_time: f64,
    num_states: usize,
    chains: &[EventChain],
    abort: &AbortFlag,
) -> Result<Array2<f64>> {
    let num_pts = time.len();
    let mut p = Array2::zeros((num_pts, num_states));
    if chains.is_empty() || num_pts == 0 {
        return Ok(p);
    }
    for chain in chains {
        let mut events = chain.iter();
        let mut event = match events.next() {
            Some(event) => event,
            None => continue,
        };
        let mut t = 0;
        let mut interval_start = time[0];
        let mut interval_end = if num_pts > 1 { time[1] } else { end_time };
        let mut interval = interval_end - interval_start;
        let mut event_start = 0.0;
        let mut event_end = event.duration;
        while t < num_pts {
            abort.check()?;
            if event_start <= interval_start && event_end >= interval_end {
                // Event covers the entire sample interval.
                p[[t, event.state]] += 1.0;
                t += 1;
                if t >= num_pts {
                    break;
                }
                interval_start = interval_end;
                interval_end = if t + 1 < num_pts { time[t + 1] } else { end_time };
                interval = interval_end - interval_start;
            } else if event_start <= interval_start {
                // Event stopped mid interval.
                p[[t, event.state]] += (event_end - interval_start) / interval;
                event = match events.next() {
                    Some(event) => event,
                    None => break,
                };
                event_start = event_end;
                event_end = event_start + event.duration;
            } else if event_end >= interval_end {
                // Event started mid interval.
                p[[t, event.state]] += (interval_end - event_start) / interval;
                t += 1;
                if t >= num_pts {
                    break;
                }
                interval_start = interval_end;
                interval_end = if t + 1 < num_pts { time[t + 1] } else { end_time };
                interval = interval_end - interval_start;
            } else {
                // Event started and stopped mid interval.
                p[[t, event.state]] += event.duration / interval;
                event = match events.next() {
                    Some(event) => event,
                    None => break,
                };
                event_start = event_end;
                event_end = event_start + event.duration;
            }
        }
    }
    p /= chains.len() as f64;
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_probability_from_single_chain() {
        // 4 samples at dt = 1 over [0, 4): state 0 for 1.5 s, then state 1.
        let time = Array1::from(vec![0.0, 1.0, 2.0, 3.0]);
        let chains = vec![vec![
            MonteCarloEvent {
                state: 0,
                duration: 1.5,
            },
            MonteCarloEvent {
                state: 1,
                duration: 2.5,
            },
        ]];
        let abort = AbortFlag::new();
        let p = probability_from_event_chains(&time, 4.0, 2, &chains, &abort).unwrap();
        assert_relative_eq!(p[[0, 0]], 1.0);
        assert_relative_eq!(p[[1, 0]], 0.5);
        assert_relative_eq!(p[[1, 1]], 0.5);
        assert_relative_eq!(p[[2, 1]], 1.0);
        assert_relative_eq!(p[[3, 1]], 1.0);
        for k in 0..4 {
            assert_relative_eq!(p[[k, 0]] + p[[k, 1]], 1.0);
        }
    }

    #[test]
    fn test_probability_averages_runs() {
        let time = Array1::from(vec![0.0, 1.0]);
        let chains = vec![
            vec![MonteCarloEvent {
                state: 0,
                duration: 2.0,
            }],
            vec![MonteCarloEvent {
                state: 1,
                duration: 2.0,
            }],
        ];
        let abort = AbortFlag::new();
        let p = probability_from_event_chains(&time, 2.0, 2, &chains, &abort).unwrap();
        assert_relative_eq!(p[[0, 0]], 0.5);
        assert_relative_eq!(p[[0, 1]], 0.5);
        assert_relative_eq!(p[[1, 0]], 0.5);
    }

    #[test]
    fn test_empty_chain_list() {
        let time = Array1::from(vec![0.0, 1.0]);
        let abort = AbortFlag::new();
        let p = probability_from_event_chains(&time, 2.0, 2, &[], &abort).unwrap();
        assert_eq!(p.sum(), 0.0);
    }
}
