//! Built-in pure-Rust matrix libraries benchmarked by matbench.
//!
//! `naive` is the textbook formulation of every operation; `blocked` uses
//! cache tiling and shared LU factorization. Both work directly on
//! [`DenseMatrix`], so constructing the native representation is free.

pub mod blocked;
mod kernels;
pub mod naive;

pub use blocked::Blocked;
pub use naive::Naive;

use matbench_core::adapter::{AdapterError, LibraryRegistry, OpRun};
use matbench_core::matrix::DenseMatrix;
use matbench_core::model::Operation;
use std::sync::Arc;
use std::time::Instant;

/// Every built-in library.
pub fn registry() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    registry
        .register(Arc::new(Naive))
        .register(Arc::new(Blocked::default()));
    registry
}

/// Checks the inputs have the shapes `op` declares and returns the size.
pub(crate) fn check_inputs(op: Operation, inputs: &[DenseMatrix]) -> Result<usize, AdapterError> {
    let n = inputs
        .first()
        .map(DenseMatrix::rows)
        .ok_or_else(|| AdapterError::BadInput(format!("{op} called without inputs")))?;
    let want = op.input_shapes(n);
    let got: Vec<(usize, usize)> = inputs.iter().map(DenseMatrix::shape).collect();
    if got != want {
        return Err(AdapterError::BadInput(format!("{op} expects {want:?}, got {got:?}")));
    }
    Ok(n)
}

/// Runs `f` `cycles` times; the outputs of the last run are returned.
pub(crate) fn timed<F>(cycles: u64, mut f: F) -> Result<OpRun, AdapterError>
where
    F: FnMut() -> Result<Vec<DenseMatrix>, AdapterError>,
{
    let start = Instant::now();
    let mut outputs = Vec::new();
    for _ in 0..cycles.max(1) {
        outputs = std::hint::black_box(f()?);
    }
    Ok(OpRun {
        elapsed: start.elapsed(),
        outputs,
    })
}

pub(crate) fn scalar(v: f64) -> Result<DenseMatrix, AdapterError> {
    let mut m = DenseMatrix::try_zeros(1, 1)?;
    m.set(0, 0, v);
    Ok(m)
}
