//! Capability interface every implementation under test presents.
//!
//! An adapter converts raw inputs into its native representation, runs one
//! operation exactly `cycles` times, and reports the elapsed time of those
//! cycles plus the outputs of the last cycle for correctness checking.

use crate::matrix::{AllocError, DenseMatrix};
use crate::model::Operation;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] AllocError),

    #[error("{library} does not implement {operation}")]
    Unsupported {
        library: String,
        operation: Operation,
    },

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("computation failed: {0}")]
    Compute(String),
}

/// Result of running one operation `cycles` times.
#[derive(Debug)]
pub struct OpRun {
    pub elapsed: Duration,
    pub outputs: Vec<DenseMatrix>,
}

pub trait MatrixLibrary: Send + Sync {
    /// Stable identifier used in file names and on the command line.
    fn name(&self) -> &str;

    /// Display name used in records and logs.
    fn display_name(&self) -> &str {
        self.name()
    }

    fn supports(&self, op: Operation) -> bool;

    fn run(
        &self,
        op: Operation,
        inputs: &[DenseMatrix],
        cycles: u64,
    ) -> Result<OpRun, AdapterError>;
}

/// Name-indexed set of available implementations.
#[derive(Clone, Default)]
pub struct LibraryRegistry {
    libs: BTreeMap<String, Arc<dyn MatrixLibrary>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, lib: Arc<dyn MatrixLibrary>) -> &mut Self {
        self.libs.insert(lib.name().to_string(), lib);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MatrixLibrary>> {
        self.libs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.libs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn MatrixLibrary>> {
        self.libs.values()
    }

    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
    }
}

impl std::fmt::Debug for LibraryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.libs.keys()).finish()
    }
}
