//! Raw row-major matrix used to hand inputs to, and read outputs from,
//! library adapters. Every allocation is fallible so that memory exhaustion
//! under the worker's address-space limit becomes a typed outcome.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Allocation of a matrix buffer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot allocate {rows}x{cols} matrix")]
pub struct AllocError {
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl DenseMatrix {
    pub fn try_zeros(rows: usize, cols: usize) -> Result<Self, AllocError> {
        let err = AllocError { rows, cols };
        let len = rows.checked_mul(cols).ok_or(err)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| err)?;
        data.resize(len, 0.0);
        Ok(Self { rows, cols, data })
    }

    pub fn try_identity(n: usize) -> Result<Self, AllocError> {
        let mut m = Self::try_zeros(n, n)?;
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        Ok(m)
    }

    /// Builds from row-major data. Returns `None` when the length does not
    /// match the shape.
    pub fn from_row_major(rows: usize, cols: usize, data: Vec<f64>) -> Option<Self> {
        (rows.checked_mul(cols)? == data.len()).then_some(Self { rows, cols, data })
    }

    pub fn try_clone(&self) -> Result<Self, AllocError> {
        let mut out = Self::try_zeros(self.rows, self.cols)?;
        out.data.copy_from_slice(&self.data);
        Ok(out)
    }

    /// Uniform entries in `[-1, 1)`.
    pub fn try_random<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        rng: &mut R,
    ) -> Result<Self, AllocError> {
        let mut m = Self::try_zeros(rows, cols)?;
        let dist = Uniform::new(-1.0, 1.0);
        for v in &mut m.data {
            *v = dist.sample(rng);
        }
        Ok(m)
    }

    /// Symmetric positive definite: `R·Rᵀ + n·I` for a random `R`.
    pub fn try_random_spd<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Result<Self, AllocError> {
        let r = Self::try_random(n, n, rng)?;
        let mut m = Self::try_zeros(n, n)?;
        for i in 0..n {
            for j in 0..=i {
                let mut acc = 0.0;
                for k in 0..n {
                    acc += r.get(i, k) * r.get(j, k);
                }
                m.set(i, j, acc);
                m.set(j, i, acc);
            }
            let d = m.get(i, i) + n as f64;
            m.set(i, i, d);
        }
        Ok(m)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let cols = self.cols;
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = self.data.split_at_mut(hi * cols);
        head[lo * cols..(lo + 1) * cols].swap_with_slice(&mut tail[..cols]);
    }

    /// Largest absolute entry; `NaN` if any entry is non-finite.
    pub fn max_abs(&self) -> f64 {
        let mut best = 0.0f64;
        for &v in &self.data {
            if !v.is_finite() {
                return f64::NAN;
            }
            best = best.max(v.abs());
        }
        best
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn random_matrices_are_seeded() {
        let a = DenseMatrix::try_random(3, 4, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = DenseMatrix::try_random(3, 4, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.as_slice().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn spd_is_symmetric_with_dominant_diagonal() {
        let m = DenseMatrix::try_random_spd(5, &mut StdRng::seed_from_u64(1)).unwrap();
        for i in 0..5 {
            assert!(m.get(i, i) >= 5.0);
            for j in 0..5 {
                assert_eq!(m.get(i, j), m.get(j, i));
            }
        }
    }

    #[test]
    fn absurd_shapes_fail_to_allocate() {
        let err = DenseMatrix::try_zeros(usize::MAX, 2).unwrap_err();
        assert_eq!(err.rows, usize::MAX);
        assert!(DenseMatrix::try_zeros(1 << 40, 1 << 20).is_err());
    }

    #[test]
    fn swap_rows_in_both_directions() {
        let mut m = DenseMatrix::from_row_major(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        m.swap_rows(2, 0);
        assert_eq!(m.row(0), &[5.0, 6.0]);
        assert_eq!(m.row(2), &[1.0, 2.0]);
        m.swap_rows(1, 1);
        assert_eq!(m.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn from_row_major_checks_length() {
        assert!(DenseMatrix::from_row_major(2, 2, vec![0.0; 3]).is_none());
    }
}
