//! Spectral kernel.
//!
//! `exp(tQ)` is expanded as `sum_i exp(t lambda_i) A_i` where the `A_i` are
//! the rank-1 spectral projectors `v_i w_i^T` built from the right
//! eigenvectors of Q and the rows of their inverse. Propagating a starting
//! probability across an epoch is then a handful of row-vector products per
//! eigenvalue instead of a matrix exponential per sample.

use std::cmp::Ordering;

use gatesim_core::{AbortFlag, GateSimError, Result};
use gatesim_model::SparseMatrix;
use nalgebra::{DMatrix, Normed, RowDVector, SVD};
use ndarray::Array2;

use crate::registry::UniqueEpochs;
use crate::Simulation;

/// Eigenvalues and rank-1 projectors of one Q matrix, sorted by ascending
/// `|lambda|` so index 0 holds the near-zero eigenvalue whose projector maps
/// any probability vector to equilibrium.
#[derive(Debug, Clone)]
pub struct SpectralExpansion {
    pub eigenvalues: Vec<f64>,
    pub projectors: Vec<DMatrix<f64>>,
}

pub(crate) fn to_dmatrix(matrix: &SparseMatrix) -> DMatrix<f64> {
    let n = matrix.n();
    let mut dense = DMatrix::zeros(n, n);
    for i in 0..n {
        dense[(i, i)] = matrix.diag(i);
        for &(j, value) in matrix.row_entries(i) {
            dense[(i, j)] = value;
        }
    }
    dense
}

/// Equilibrium state probabilities from a dense Q matrix, solving
/// `u * (S S^T)^-1` with `S = [Q | 1]`.
///
/// With a spectral expansion in hand this is redundant: the equilibrium is
/// the starting probability times the zero-eigenvalue projector.
pub fn equilibrium_probability(q: &DMatrix<f64>) -> Result<RowDVector<f64>> {
    let n = q.ncols();
    let mut s = DMatrix::from_element(n, n + 1, 1.0);
    s.view_mut((0, 0), (n, n)).copy_from(q);
    let normal = &s * s.transpose();
    let inverse = normal
        .try_inverse()
        .ok_or_else(|| GateSimError::Spectral("singular equilibrium system".to_string()))?;
    Ok(RowDVector::from_element(n, 1.0) * inverse)
}

/// Compute the spectral expansion of a generator matrix.
///
/// Eigenvalues come from a real Schur decomposition; an eigenvalue with a
/// non-negligible imaginary part fails, as does a defective eigenvector
/// basis. Repeated eigenvalues are clustered and resolved with a null-space
/// basis of matching multiplicity.
pub fn spectral_expansion(q: &SparseMatrix, abort: &AbortFlag) -> Result<SpectralExpansion> {
    let n = q.n();
    if n < 2 {
        return Err(GateSimError::Spectral(
            "expansion for fewer than two states does not make sense".to_string(),
        ));
    }
    let dense = to_dmatrix(q);
    abort.check()?;

    let schur = nalgebra::linalg::Schur::try_new(dense.clone(), f64::EPSILON, 100_000)
        .ok_or_else(|| GateSimError::Spectral("Schur iteration did not converge".to_string()))?;
    let complex_eigenvalues = schur.complex_eigenvalues();
    let scale = complex_eigenvalues
        .iter()
        .fold(1.0_f64, |acc, ev| acc.max(ev.norm()));
    let mut eigenvalues = Vec::with_capacity(n);
    for ev in complex_eigenvalues.iter() {
        if ev.im.abs() > 1e-7 * scale {
            return Err(GateSimError::Spectral(format!(
                "complex eigenvalue {} {:+}i",
                ev.re, ev.im
            )));
        }
        eigenvalues.push(ev.re);
    }
    eigenvalues.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    abort.check()?;

    // Eigenvectors per eigenvalue cluster via the null space of Q - lambda I.
    let cluster_tolerance = 1e-6 * scale;
    let mut basis = DMatrix::zeros(n, n);
    let mut column_eigenvalues = Vec::with_capacity(n);
    let mut column = 0;
    let mut i = 0;
    while i < n {
        let mut multiplicity = 1;
        while i + multiplicity < n
            && (eigenvalues[i + multiplicity] - eigenvalues[i]).abs() <= cluster_tolerance
        {
            multiplicity += 1;
        }
        let lambda = eigenvalues[i..i + multiplicity].iter().sum::<f64>() / multiplicity as f64;
        abort.check()?;

        let shifted = &dense - DMatrix::identity(n, n) * lambda;
        let svd = SVD::try_new(shifted, false, true, f64::EPSILON, 100_000)
            .ok_or_else(|| GateSimError::Spectral("SVD did not converge".to_string()))?;
        let v_t = svd
            .v_t
            .ok_or_else(|| GateSimError::Spectral("missing singular vectors".to_string()))?;
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            svd.singular_values[a]
                .partial_cmp(&svd.singular_values[b])
                .unwrap_or(Ordering::Equal)
        });
        for &row in order.iter().take(multiplicity) {
            for r in 0..n {
                basis[(r, column)] = v_t[(row, r)];
            }
            column_eigenvalues.push(lambda);
            column += 1;
        }
        i += multiplicity;
    }

    let inverse = basis
        .clone()
        .try_inverse()
        .ok_or_else(|| GateSimError::Spectral("defective eigenvector basis".to_string()))?;
    let mut pairs: Vec<(f64, DMatrix<f64>)> = (0..n)
        .map(|i| {
            let projector = basis.column(i) * inverse.row(i);
            (column_eigenvalues[i], projector)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.abs().partial_cmp(&b.0.abs()).unwrap_or(Ordering::Equal));

    let (eigenvalues, projectors) = pairs.into_iter().unzip();
    Ok(SpectralExpansion {
        eigenvalues,
        projectors,
    })
}

impl Simulation {
    /// Fill the probability matrix for one variable set by propagating the
    /// starting probability across this cell's epochs with each epoch's
    /// spectral expansion.
    pub fn spectral_simulation(
        &mut self,
        registry: &UniqueEpochs,
        starting: ndarray::Array1<f64>,
        start_equilibrated: bool,
        set_index: usize,
        abort: &AbortFlag,
    ) -> Result<()> {
        let num_pts = self.time.len();
        let num_states = starting.len();
        while self.probability.len() <= set_index {
            self.probability.push(Array2::zeros((num_pts, num_states)));
        }
        let p = &mut self.probability[set_index];
        *p = Array2::zeros((num_pts, num_states));

        let mut pi = RowDVector::from_iterator(num_states, starting.iter().copied());
        let num_epochs = self.epochs.len();
        for (epoch_counter, epoch) in self.epochs.iter().enumerate() {
            abort.check()?;
            let unique = registry.get(epoch.unique);
            let spectral = unique.spectral.as_ref().ok_or_else(|| {
                GateSimError::Spectral("epoch is missing its decomposition".to_string())
            })?;
            if epoch_counter == 0 && start_equilibrated {
                // The first epoch sits at equilibrium, which its own Q
                // cannot move, so the block is constant.
                pi = &pi * &spectral.projectors[0];
                for k in 0..epoch.num_pts {
                    for j in 0..num_states {
                        p[[epoch.first_pt + k, j]] = pi[j];
                    }
                }
            } else {
                if epoch.num_pts > 0 {
                    for i in 0..num_states {
                        abort.check()?;
                        let lambda = spectral.eigenvalues[i];
                        let contribution = &pi * &spectral.projectors[i];
                        for k in 0..epoch.num_pts {
                            let tau = self.time[epoch.first_pt + k] - epoch.start;
                            let weight = (tau * lambda).exp();
                            for j in 0..num_states {
                                p[[epoch.first_pt + k, j]] += weight * contribution[j];
                            }
                        }
                    }
                }
                if epoch_counter + 1 < num_epochs {
                    // Advance the starting probability to the epoch boundary.
                    let mut next = RowDVector::zeros(num_states);
                    for i in 0..num_states {
                        abort.check()?;
                        let lambda = spectral.eigenvalues[i];
                        let contribution = &pi * &spectral.projectors[i];
                        next += contribution * (lambda * epoch.duration).exp();
                    }
                    pi = next;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Two-state generator with rates a (0 -> 1) and b (1 -> 0).
    fn two_state(a: f64, b: f64) -> SparseMatrix {
        let mut q = SparseMatrix::new(2);
        q.insert(0, 1, a);
        q.insert(1, 0, b);
        q.set_conserving_diagonal();
        q
    }

    #[test]
    fn test_two_state_expansion() {
        let q = two_state(3.0, 1.0);
        let abort = AbortFlag::new();
        let spectral = spectral_expansion(&q, &abort).unwrap();
        // Eigenvalues of the generator are 0 and -(a + b), ascending |.|.
        assert_relative_eq!(spectral.eigenvalues[0], 0.0, epsilon = 1e-10);
        assert_relative_eq!(spectral.eigenvalues[1], -4.0, epsilon = 1e-10);

        // Projectors resolve the identity.
        let sum = &spectral.projectors[0] + &spectral.projectors[1];
        let identity = DMatrix::<f64>::identity(2, 2);
        assert!((sum - identity).abs().max() < 1e-9);
    }

    #[test]
    fn test_equilibrium_projector() {
        // pi0 * A0 is the equilibrium distribution b/(a+b), a/(a+b), and
        // applying Q to it gives (numerically) zero.
        let q = two_state(3.0, 1.0);
        let abort = AbortFlag::new();
        let spectral = spectral_expansion(&q, &abort).unwrap();
        let pi0 = RowDVector::from_vec(vec![1.0, 0.0]);
        let eq = &pi0 * &spectral.projectors[0];
        assert_relative_eq!(eq[0], 0.25, epsilon = 1e-9);
        assert_relative_eq!(eq[1], 0.75, epsilon = 1e-9);
        let residual = &eq * to_dmatrix(&q);
        assert!(residual.amax() < 1e-8);
    }

    #[test]
    fn test_equilibrium_probability_direct() {
        let q = two_state(3.0, 1.0);
        let eq = equilibrium_probability(&to_dmatrix(&q)).unwrap();
        assert_relative_eq!(eq[0], 0.25, epsilon = 1e-9);
        assert_relative_eq!(eq[1], 0.75, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_spectrum() {
        // Two identical independent elements give a doubly repeated
        // eigenvalue; the cluster handling must still produce a full basis.
        let (a, b) = (2.0, 5.0);
        let mut q = SparseMatrix::new(4);
        for j in 0..2usize {
            let mask = 1usize << j;
            for from in 0..4usize {
                if from & mask == 0 {
                    q.insert(from, from | mask, a);
                } else {
                    q.insert(from, from & !mask, b);
                }
            }
        }
        q.set_conserving_diagonal();
        let abort = AbortFlag::new();
        let spectral = spectral_expansion(&q, &abort).unwrap();
        assert_relative_eq!(spectral.eigenvalues[0], 0.0, epsilon = 1e-8);
        assert_relative_eq!(spectral.eigenvalues[1], -7.0, epsilon = 1e-6);
        assert_relative_eq!(spectral.eigenvalues[2], -7.0, epsilon = 1e-6);
        assert_relative_eq!(spectral.eigenvalues[3], -14.0, epsilon = 1e-6);

        let mut sum = DMatrix::<f64>::zeros(4, 4);
        for projector in &spectral.projectors {
            sum += projector;
        }
        assert!((sum - DMatrix::<f64>::identity(4, 4)).abs().max() < 1e-7);
    }

    #[test]
    fn test_too_few_states() {
        let q = SparseMatrix::new(1);
        let abort = AbortFlag::new();
        assert!(matches!(
            spectral_expansion(&q, &abort),
            Err(GateSimError::Spectral(_))
        ));
    }

    #[test]
    fn test_cancellation() {
        let q = two_state(1.0, 1.0);
        let abort = AbortFlag::new();
        abort.raise();
        assert!(matches!(
            spectral_expansion(&q, &abort),
            Err(GateSimError::Cancelled)
        ));
    }
}
