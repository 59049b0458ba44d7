//! Cache-tiled kernels over row slices; det, solve and invert go through a
//! single pivoted LU factorization.

use crate::kernels;
use crate::{check_inputs, scalar, timed};
use matbench_core::adapter::{AdapterError, MatrixLibrary, OpRun};
use matbench_core::matrix::DenseMatrix;
use matbench_core::model::Operation;

const DEFAULT_TILE: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct Blocked {
    tile: usize,
}

impl Default for Blocked {
    fn default() -> Self {
        Self { tile: DEFAULT_TILE }
    }
}

impl Blocked {
    pub fn with_tile(tile: usize) -> Self {
        Self { tile: tile.max(1) }
    }
}

impl MatrixLibrary for Blocked {
    fn name(&self) -> &str {
        "blocked"
    }

    fn display_name(&self) -> &str {
        "Blocked (tiled + LU)"
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
        let t = self.tile;
        match op {
            Operation::Add => timed(cycles, || Ok(vec![zip_map(a, &inputs[1], |x, y| x + y)?])),
            Operation::Scale => timed(cycles, || {
                Ok(vec![zip_map(a, a, |x, _| Operation::SCALE_FACTOR * x)?])
            }),
            Operation::Mult => timed(cycles, || Ok(vec![mult(a, &inputs[1], t)?])),
            Operation::MultTransB => timed(cycles, || Ok(vec![mult_trans_b(a, &inputs[1], t)?])),
            Operation::Transpose => timed(cycles, || Ok(vec![transpose(a, t)?])),
            Operation::Det => timed(cycles, || Ok(vec![scalar(kernels::lu(a)?.det())?])),
            Operation::Invert => timed(cycles, || {
                let lu = kernels::lu(a)?;
                let mut x = DenseMatrix::try_identity(a.rows())?;
                lu.solve_into(&mut x)?;
                Ok(vec![x])
            }),
            Operation::Solve => timed(cycles, || {
                let lu = kernels::lu(a)?;
                let mut x = inputs[1].try_clone()?;
                lu.solve_into(&mut x)?;
                Ok(vec![x])
            }),
            Operation::Chol => timed(cycles, || Ok(vec![kernels::cholesky(a)?])),
        }
    }
}

fn zip_map(
    a: &DenseMatrix,
    b: &DenseMatrix,
    f: impl Fn(f64, f64) -> f64,
) -> Result<DenseMatrix, AdapterError> {
    let mut c = DenseMatrix::try_zeros(a.rows(), a.cols())?;
    for ((out, &x), &y) in c
        .as_mut_slice()
        .iter_mut()
        .zip(a.as_slice())
        .zip(b.as_slice())
    {
        *out = f(x, y);
    }
    Ok(c)
}

/// i-k-j order inside tiles so the inner loop streams rows of B and C.
fn mult(a: &DenseMatrix, b: &DenseMatrix, tile: usize) -> Result<DenseMatrix, AdapterError> {
    let (n, inner, m) = (a.rows(), a.cols(), b.cols());
    let mut c = DenseMatrix::try_zeros(n, m)?;
    let out = c.as_mut_slice();
    for ii in (0..n).step_by(tile) {
        for kk in (0..inner).step_by(tile) {
            for jj in (0..m).step_by(tile) {
                let j_end = (jj + tile).min(m);
                for i in ii..(ii + tile).min(n) {
                    let a_row = a.row(i);
                    let c_row = &mut out[i * m + jj..i * m + j_end];
                    for k in kk..(kk + tile).min(inner) {
                        let aik = a_row[k];
                        for (cv, bv) in c_row.iter_mut().zip(&b.row(k)[jj..j_end]) {
                            *cv += aik * bv;
                        }
                    }
                }
            }
        }
    }
    Ok(c)
}

/// Rows of A dotted with rows of B, tiled over both.
fn mult_trans_b(
    a: &DenseMatrix,
    b: &DenseMatrix,
    tile: usize,
) -> Result<DenseMatrix, AdapterError> {
    let (n, m) = (a.rows(), b.rows());
    let mut c = DenseMatrix::try_zeros(n, m)?;
    for ii in (0..n).step_by(tile) {
        for jj in (0..m).step_by(tile) {
            for i in ii..(ii + tile).min(n) {
                let a_row = a.row(i);
                for j in jj..(jj + tile).min(m) {
                    let dot: f64 = a_row.iter().zip(b.row(j)).map(|(x, y)| x * y).sum();
                    c.set(i, j, dot);
                }
            }
        }
    }
    Ok(c)
}

fn transpose(a: &DenseMatrix, tile: usize) -> Result<DenseMatrix, AdapterError> {
    let (r, c) = a.shape();
    let mut t = DenseMatrix::try_zeros(c, r)?;
    for ii in (0..r).step_by(tile) {
        for jj in (0..c).step_by(tile) {
            for i in ii..(ii + tile).min(r) {
                for j in jj..(jj + tile).min(c) {
                    t.set(j, i, a.get(i, j));
                }
            }
        }
    }
    Ok(t)
}
