//! Core data model: cases, measurements, per-size metrics.

use crate::errors::ConfigError;
use crate::stats::Summary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const F64_BYTES: u64 = std::mem::size_of::<f64>() as u64;

/// The fixed menu of benchmarked operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Scale,
    Mult,
    MultTransB,
    Transpose,
    Det,
    Invert,
    Solve,
    Chol,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Add,
        Operation::Scale,
        Operation::Mult,
        Operation::MultTransB,
        Operation::Transpose,
        Operation::Det,
        Operation::Invert,
        Operation::Solve,
        Operation::Chol,
    ];

    /// Factor applied by [`Operation::Scale`].
    pub const SCALE_FACTOR: f64 = 2.5;

    pub fn name(self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Scale => "scale",
            Operation::Mult => "mult",
            Operation::MultTransB => "mult_trans_b",
            Operation::Transpose => "transpose",
            Operation::Det => "det",
            Operation::Invert => "invert",
            Operation::Solve => "solve",
            Operation::Chol => "chol",
        }
    }

    /// Input shapes `(rows, cols)` for problem size `n`.
    pub fn input_shapes(self, n: usize) -> Vec<(usize, usize)> {
        match self {
            Operation::Add | Operation::Mult | Operation::MultTransB => vec![(n, n), (n, n)],
            Operation::Scale
            | Operation::Transpose
            | Operation::Det
            | Operation::Invert
            | Operation::Chol => vec![(n, n)],
            Operation::Solve => vec![(n, n), (n, 1)],
        }
    }

    /// Estimated bytes held by the inputs at size `n`.
    pub fn input_footprint_bytes(self, n: usize) -> u64 {
        self.input_shapes(n)
            .iter()
            .map(|&(r, c)| {
                (r as u64)
                    .saturating_mul(c as u64)
                    .saturating_mul(F64_BYTES)
            })
            .fold(0u64, u64::saturating_add)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Operation::ALL
            .into_iter()
            .find(|op| op.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownOperation { name: s.to_string() })
    }
}

/// One (operation, implementation) pair swept across increasing sizes.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkCase {
    library: String,
    display_name: Option<String>,
    operation: Operation,
    sizes: Vec<usize>,
    max_trials: u32,
}

impl BenchmarkCase {
    pub fn new(
        library: impl Into<String>,
        operation: Operation,
        sizes: Vec<usize>,
        max_trials: u32,
    ) -> Result<Self, ConfigError> {
        let library = library.into();
        let label = format!("{library}/{operation}");
        if sizes.is_empty() {
            return Err(ConfigError::EmptySizes { case: label });
        }
        if sizes.windows(2).any(|w| w[0] >= w[1]) || sizes[0] == 0 {
            return Err(ConfigError::SizesNotIncreasing { case: label, sizes });
        }
        if max_trials == 0 {
            return Err(ConfigError::Zero {
                field: "max_trials",
            });
        }
        Ok(Self {
            library,
            display_name: None,
            operation,
            sizes,
            max_trials,
        })
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    /// Falls back to the library name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.library)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn max_trials(&self) -> u32 {
        self.max_trials
    }

    /// Human-readable identifier, e.g. `naive/mult`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.library, self.operation)
    }
}

/// One successful trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub ops_per_sec: f64,
    /// Wall time of the whole trial, calibration rounds included.
    pub elapsed_secs: f64,
    /// Operation executions in the timed run the throughput was derived from.
    pub cycles: u64,
}

impl Measurement {
    pub fn seconds_per_op(&self) -> f64 {
        if self.ops_per_sec > 0.0 {
            1.0 / self.ops_per_sec
        } else {
            f64::INFINITY
        }
    }

    /// True when either the trial's wall time or a single operation took
    /// longer than `ceiling`.
    pub fn exceeds(&self, ceiling: Duration) -> bool {
        let limit = ceiling.as_secs_f64();
        self.elapsed_secs > limit || self.seconds_per_op() > limit
    }
}

/// Summary over every sample collected for one size. This is the unit that
/// gets persisted and inspected on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeMetrics {
    pub sample_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops_per_sec: Option<Summary>,
    pub samples: Vec<Measurement>,
}

impl SizeMetrics {
    pub fn from_samples(samples: &[Measurement]) -> Self {
        let ops: Vec<f64> = samples.iter().map(|m| m.ops_per_sec).collect();
        Self {
            sample_count: samples.len(),
            ops_per_sec: Summary::of(&ops),
            samples: samples.to_vec(),
        }
    }
}
