//! Textbook loops over `get`/`set`; the baseline every other library is
//! compared with.

use crate::kernels;
use crate::{check_inputs, scalar, timed};
use matbench_core::adapter::{AdapterError, MatrixLibrary, OpRun};
use matbench_core::matrix::DenseMatrix;
use matbench_core::model::Operation;

#[derive(Debug, Clone, Copy, Default)]
pub struct Naive;

impl MatrixLibrary for Naive {
    fn name(&self) -> &str {
        "naive"
    }

    fn display_name(&self) -> &str {
        "Naive loops"
    }

    fn supports(&self, _op: Operation) -> bool {
        true
    }

    fn run(
        &self,
        op: Operation,
        inputs: &[DenseMatrix],
        cycles: u64,
    ) -> Result<OpRun, AdapterError> {
        check_inputs(op, inputs)?;
        let a = &inputs[0];
        match op {
            Operation::Add => timed(cycles, || Ok(vec![add(a, &inputs[1])?])),
            Operation::Scale => timed(cycles, || Ok(vec![scale(a, Operation::SCALE_FACTOR)?])),
            Operation::Mult => timed(cycles, || Ok(vec![mult(a, &inputs[1], false)?])),
            Operation::MultTransB => timed(cycles, || Ok(vec![mult(a, &inputs[1], true)?])),
            Operation::Transpose => timed(cycles, || Ok(vec![transpose(a)?])),
            Operation::Det => timed(cycles, || Ok(vec![scalar(det(a)?)?])),
            Operation::Invert => timed(cycles, || Ok(vec![invert(a)?])),
            Operation::Solve => timed(cycles, || Ok(vec![solve(a, &inputs[1])?])),
            Operation::Chol => timed(cycles, || Ok(vec![kernels::cholesky(a)?])),
        }
    }
}

fn add(a: &DenseMatrix, b: &DenseMatrix) -> Result<DenseMatrix, AdapterError> {
    let mut c = DenseMatrix::try_zeros(a.rows(), a.cols())?;
    for i in 0..a.rows() {
        for j in 0..a.cols() {
            c.set(i, j, a.get(i, j) + b.get(i, j));
        }
    }
    Ok(c)
}

fn scale(a: &DenseMatrix, s: f64) -> Result<DenseMatrix, AdapterError> {
    let mut c = DenseMatrix::try_zeros(a.rows(), a.cols())?;
    for i in 0..a.rows() {
        for j in 0..a.cols() {
            c.set(i, j, s * a.get(i, j));
        }
    }
    Ok(c)
}

/// `A·B`, or `A·Bᵀ` when `trans_b` is set.
fn mult(a: &DenseMatrix, b: &DenseMatrix, trans_b: bool) -> Result<DenseMatrix, AdapterError> {
    let cols = if trans_b { b.rows() } else { b.cols() };
    let mut c = DenseMatrix::try_zeros(a.rows(), cols)?;
    for i in 0..a.rows() {
        for j in 0..cols {
            let mut acc = 0.0;
            for k in 0..a.cols() {
                let bkj = if trans_b { b.get(j, k) } else { b.get(k, j) };
                acc += a.get(i, k) * bkj;
            }
            c.set(i, j, acc);
        }
    }
    Ok(c)
}

fn transpose(a: &DenseMatrix) -> Result<DenseMatrix, AdapterError> {
    let mut t = DenseMatrix::try_zeros(a.cols(), a.rows())?;
    for i in 0..a.rows() {
        for j in 0..a.cols() {
            t.set(j, i, a.get(i, j));
        }
    }
    Ok(t)
}

fn pivot_row(m: &DenseMatrix, k: usize) -> usize {
    (k..m.rows())
        .max_by(|&x, &y| m.get(x, k).abs().total_cmp(&m.get(y, k).abs()))
        .unwrap_or(k)
}

fn det(a: &DenseMatrix) -> Result<f64, AdapterError> {
    let n = a.rows();
    let mut m = a.try_clone()?;
    let mut det = 1.0;
    for k in 0..n {
        let p = pivot_row(&m, k);
        if m.get(p, k) == 0.0 {
            return Ok(0.0);
        }
        if p != k {
            m.swap_rows(p, k);
            det = -det;
        }
        let d = m.get(k, k);
        det *= d;
        for r in k + 1..n {
            let f = m.get(r, k) / d;
            for c in k..n {
                m.set(r, c, m.get(r, c) - f * m.get(k, c));
            }
        }
    }
    Ok(det)
}

/// Gauss-Jordan elimination on `[A | I]`.
fn invert(a: &DenseMatrix) -> Result<DenseMatrix, AdapterError> {
    let n = a.rows();
    let mut m = a.try_clone()?;
    let mut inv = DenseMatrix::try_identity(n)?;
    for k in 0..n {
        let p = pivot_row(&m, k);
        if m.get(p, k) == 0.0 {
            return Err(AdapterError::Compute("singular matrix".into()));
        }
        m.swap_rows(p, k);
        inv.swap_rows(p, k);
        let d = m.get(k, k);
        for c in 0..n {
            m.set(k, c, m.get(k, c) / d);
            inv.set(k, c, inv.get(k, c) / d);
        }
        for r in 0..n {
            let f = m.get(r, k);
            if r == k || f == 0.0 {
                continue;
            }
            for c in 0..n {
                m.set(r, c, m.get(r, c) - f * m.get(k, c));
                inv.set(r, c, inv.get(r, c) - f * inv.get(k, c));
            }
        }
    }
    Ok(inv)
}

/// Forward elimination on `[A | b]`, then back substitution.
fn solve(a: &DenseMatrix, b: &DenseMatrix) -> Result<DenseMatrix, AdapterError> {
    let n = a.rows();
    let mut m = a.try_clone()?;
    let mut x = b.try_clone()?;
    for k in 0..n {
        let p = pivot_row(&m, k);
        if m.get(p, k) == 0.0 {
            return Err(AdapterError::Compute("singular matrix".into()));
        }
        m.swap_rows(p, k);
        x.swap_rows(p, k);
        for r in k + 1..n {
            let f = m.get(r, k) / m.get(k, k);
            for c in k..n {
                m.set(r, c, m.get(r, c) - f * m.get(k, c));
            }
            x.set(r, 0, x.get(r, 0) - f * x.get(k, 0));
        }
    }
    for i in (0..n).rev() {
        let mut acc = x.get(i, 0);
        for c in i + 1..n {
            acc -= m.get(i, c) * x.get(c, 0);
        }
        x.set(i, 0, acc / m.get(i, i));
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(rows: usize, data: &[f64]) -> DenseMatrix {
        DenseMatrix::from_row_major(rows, data.len() / rows, data.to_vec()).unwrap()
    }

    #[test]
    fn small_products() {
        let a = m(2, &[1.0, 2.0, 3.0, 4.0]);
        let b = m(2, &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(
            mult(&a, &b, false).unwrap().as_slice(),
            &[19.0, 22.0, 43.0, 50.0]
        );
        assert_eq!(
            mult(&a, &b, true).unwrap().as_slice(),
            &[17.0, 23.0, 39.0, 53.0]
        );
    }

    #[test]
    fn det_needs_pivoting() {
        let a = m(2, &[0.0, 1.0, 1.0, 0.0]);
        assert_eq!(det(&a).unwrap(), -1.0);
        assert_eq!(det(&m(2, &[1.0, 2.0, 2.0, 4.0])).unwrap(), 0.0);
    }

    #[test]
    fn singular_inverse_is_a_compute_error() {
        let err = Naive
            .run(Operation::Invert, &[m(2, &[1.0, 2.0, 2.0, 4.0])], 1)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Compute(_)));
    }
}
