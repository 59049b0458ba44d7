//! Factorization kernels shared by the built-in libraries.

use matbench_core::adapter::AdapterError;
use matbench_core::matrix::{AllocError, DenseMatrix};

/// Row-pivoted LU factors packed into one matrix: `L` below the diagonal
/// (unit diagonal implied), `U` on and above it.
pub struct Lu {
    pub packed: DenseMatrix,
    pub perm: Vec<usize>,
    /// +1 or -1 depending on the number of row swaps.
    pub sign: f64,
    pub singular: bool,
}

pub fn lu(a: &DenseMatrix) -> Result<Lu, AdapterError> {
    let n = a.rows();
    let mut m = a.try_clone()?;
    let mut perm: Vec<usize> = (0..n).collect();
    let mut sign = 1.0;
    let mut singular = false;

    for k in 0..n {
        let mut pivot = k;
        let mut best = m.get(k, k).abs();
        for r in k + 1..n {
            let v = m.get(r, k).abs();
            if v > best {
                best = v;
                pivot = r;
            }
        }
        if best == 0.0 {
            singular = true;
            continue;
        }
        if pivot != k {
            m.swap_rows(pivot, k);
            perm.swap(pivot, k);
            sign = -sign;
        }
        let d = m.get(k, k);
        for r in k + 1..n {
            let f = m.get(r, k) / d;
            m.set(r, k, f);
            if f != 0.0 {
                for c in k + 1..n {
                    let v = m.get(r, c) - f * m.get(k, c);
                    m.set(r, c, v);
                }
            }
        }
    }

    Ok(Lu {
        packed: m,
        perm,
        sign,
        singular,
    })
}

impl Lu {
    pub fn det(&self) -> f64 {
        if self.singular {
            return 0.0;
        }
        (0..self.packed.rows()).fold(self.sign, |acc, i| acc * self.packed.get(i, i))
    }

    /// Solves `A·x = b` for every column of `b` in place.
    pub fn solve_into(&self, b: &mut DenseMatrix) -> Result<(), AdapterError> {
        if self.singular {
            return Err(AdapterError::Compute("singular matrix".into()));
        }
        let n = self.packed.rows();
        let mut col = Vec::new();
        col.try_reserve_exact(n)
            .map_err(|_| AdapterError::OutOfMemory(AllocError { rows: n, cols: 1 }))?;

        for j in 0..b.cols() {
            col.clear();
            col.extend(self.perm.iter().map(|&p| b.get(p, j)));
            for i in 0..n {
                let row = self.packed.row(i);
                let s: f64 = row[..i].iter().zip(&col[..i]).map(|(l, y)| l * y).sum();
                col[i] -= s;
            }
            for i in (0..n).rev() {
                let row = self.packed.row(i);
                let s: f64 = row[i + 1..]
                    .iter()
                    .zip(&col[i + 1..])
                    .map(|(u, x)| u * x)
                    .sum();
                col[i] = (col[i] - s) / row[i];
            }
            for (i, v) in col.iter().enumerate() {
                b.set(i, j, *v);
            }
        }
        Ok(())
    }
}

/// Lower Cholesky factor of a symmetric positive definite matrix.
pub fn cholesky(a: &DenseMatrix) -> Result<DenseMatrix, AdapterError> {
    let n = a.rows();
    let mut l = DenseMatrix::try_zeros(n, n)?;
    for i in 0..n {
        for j in 0..=i {
            let s: f64 = l.row(i)[..j]
                .iter()
                .zip(&l.row(j)[..j])
                .map(|(x, y)| x * y)
                .sum();
            if i == j {
                let d = a.get(i, i) - s;
                if d <= 0.0 || !d.is_finite() {
                    return Err(AdapterError::Compute(format!(
                        "matrix is not positive definite (pivot {i} is {d})"
                    )));
                }
                l.set(i, i, d.sqrt());
            } else {
                let v = (a.get(i, j) - s) / l.get(j, j);
                l.set(i, j, v);
            }
        }
    }
    Ok(l)
}
