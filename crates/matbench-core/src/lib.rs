//! Process-isolated, resumable benchmark orchestration for matrix libraries.
//!
//! A sweep runs every (library, operation) case across increasing sizes.
//! Each block of trials runs in a separate worker process; results are
//! persisted after every block so a restarted sweep picks up where the last
//! one stopped.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod matrix;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod runner;
pub mod sequencer;
pub mod session_log;
pub mod stats;
pub mod store;
pub mod validate;

pub use adapter::{LibraryRegistry, MatrixLibrary};
pub use config::SweepConfig;
pub use model::{BenchmarkCase, Measurement, Operation};
pub use orchestrator::{Sweep, SweepSummary};
