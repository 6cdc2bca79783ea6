//! Row-compressed square matrices sized for CTMC generators.
//!
//! Off-diagonal entries are stored per row in insertion order; the diagonal
//! is kept separately so the probability-conserving form (`diag = -rowsum`)
//! can be applied after all edges and interaction factors are in place.

use ndarray::Array2;

#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    n: usize,
    rows: Vec<Vec<(usize, f64)>>,
    diag: Vec<f64>,
}

impl SparseMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            rows: vec![Vec::new(); n],
            diag: vec![0.0; n],
        }
    }

    /// Matrix dimension (square).
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of stored off-diagonal entries.
    pub fn nonzeros(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Set an entry. Off-diagonal entries are replaced if already present.
    pub fn insert(&mut self, i: usize, j: usize, value: f64) {
        if i == j {
            self.diag[i] = value;
            return;
        }
        if let Some(entry) = self.rows[i].iter_mut().find(|(col, _)| *col == j) {
            entry.1 = value;
        } else {
            self.rows[i].push((j, value));
        }
    }

    /// Multiply an existing off-diagonal entry; absent entries stay zero.
    pub fn scale_entry(&mut self, i: usize, j: usize, factor: f64) {
        if let Some(entry) = self.rows[i].iter_mut().find(|(col, _)| *col == j) {
            entry.1 *= factor;
        }
    }

    pub fn entry(&self, i: usize, j: usize) -> f64 {
        if i == j {
            return self.diag[i];
        }
        self.rows[i]
            .iter()
            .find(|(col, _)| *col == j)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    pub fn diag(&self, i: usize) -> f64 {
        self.diag[i]
    }

    /// Off-diagonal entries of row `i` as `(column, value)` pairs.
    pub fn row_entries(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    /// Set each diagonal entry to the negated off-diagonal row sum, turning
    /// the matrix into a valid infinitesimal generator.
    pub fn set_conserving_diagonal(&mut self) {
        for i in 0..self.n {
            self.diag[i] = -self.rows[i].iter().map(|(_, v)| v).sum::<f64>();
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n, self.n));
        for i in 0..self.n {
            dense[[i, i]] = self.diag[i];
            for &(j, v) in &self.rows[i] {
                dense[[i, j]] = v;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_entry() {
        let mut m = SparseMatrix::new(3);
        m.insert(0, 1, 2.0);
        m.insert(0, 2, 3.0);
        m.insert(0, 1, 4.0); // replaces
        assert_eq!(m.entry(0, 1), 4.0);
        assert_eq!(m.entry(1, 0), 0.0);
        assert_eq!(m.nonzeros(), 2);
    }

    #[test]
    fn test_conserving_diagonal() {
        let mut m = SparseMatrix::new(2);
        m.insert(0, 1, 5.0);
        m.insert(1, 0, 2.0);
        m.set_conserving_diagonal();
        assert_eq!(m.diag(0), -5.0);
        assert_eq!(m.diag(1), -2.0);
        let dense = m.to_dense();
        assert_eq!(dense[[0, 0]], -5.0);
        assert_eq!(dense[[0, 1]], 5.0);
    }

    #[test]
    fn test_scale_absent_entry_is_noop() {
        let mut m = SparseMatrix::new(2);
        m.scale_entry(0, 1, 10.0);
        assert_eq!(m.entry(0, 1), 0.0);
    }
}
