//! File protocol between the controller and an isolated worker.
//!
//! The controller writes a [`BlockPlan`] and invokes the worker with the plan
//! path, a trial count and a request id. The worker writes exactly one
//! [`WorkerOutcome`] echoing that request id, then exits. An outcome whose id
//! does not match the dispatch that is waiting for it is stale.

use crate::errors::ProtocolError;
use crate::model::{Measurement, Operation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const PLAN_SCHEMA: &str = "matbench-plan-v1";

/// Everything the worker needs to run one block, minus the trial count,
/// request id and memory budget which travel on the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockPlan {
    pub schema_version: String,
    pub library: String,
    pub operation: Operation,
    pub size: usize,
    pub size_index: usize,
    pub seed: u64,
    pub trial_time_ms: u64,
    pub max_trial_time_ms: u64,
    pub max_block_time_ms: u64,
    pub validate: bool,
    pub tolerance: f64,
}

impl BlockPlan {
    pub fn trial_time(&self) -> Duration {
        Duration::from_millis(self.trial_time_ms)
    }

    pub fn max_trial_time(&self) -> Duration {
        Duration::from_millis(self.max_trial_time_ms)
    }

    pub fn max_block_time(&self) -> Duration {
        Duration::from_millis(self.max_block_time_ms)
    }

    pub fn read(path: &Path) -> Result<Self, ProtocolError> {
        let plan: Self = read_json(path, "plan")?;
        if plan.schema_version != PLAN_SCHEMA {
            return Err(ProtocolError::Malformed {
                what: "plan",
                path: path.to_path_buf(),
                message: format!("unsupported schema {}", plan.schema_version),
            });
        }
        Ok(plan)
    }

    pub fn write(&self, path: &Path) -> Result<(), ProtocolError> {
        write_json(path, self)
    }
}

/// Why a block did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MiscException,
    BadConfig,
    TooSlow,
    OutOfMemory,
    /// Synthesized by the controller; a worker never reports it.
    Frozen,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::MiscException => "misc_exception",
            FailureReason::BadConfig => "bad_config",
            FailureReason::TooSlow => "too_slow",
            FailureReason::OutOfMemory => "out_of_memory",
            FailureReason::Frozen => "frozen",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the worker writes before terminating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerOutcome {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl WorkerOutcome {
    pub fn success(request_id: u64, measurements: Vec<Measurement>) -> Self {
        Self {
            request_id,
            failure: None,
            detail: None,
            measurements,
        }
    }

    pub fn too_slow(request_id: u64, measurements: Vec<Measurement>) -> Self {
        Self {
            request_id,
            failure: Some(FailureReason::TooSlow),
            detail: None,
            measurements,
        }
    }

    pub fn failure(request_id: u64, reason: FailureReason, detail: Option<String>) -> Self {
        Self {
            request_id,
            failure: Some(reason),
            detail,
            measurements: Vec::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, ProtocolError> {
        read_json(path, "outcome")
    }

    pub fn write(&self, path: &Path) -> Result<(), ProtocolError> {
        write_json(path, self)
    }

    /// Typed view used by the controller; no casting at call sites.
    pub fn into_block_outcome(self) -> BlockOutcome {
        match self.failure {
            None => BlockOutcome::Completed {
                measurements: self.measurements,
            },
            Some(FailureReason::TooSlow) => BlockOutcome::TooSlow {
                measurements: self.measurements,
            },
            Some(reason) => BlockOutcome::Failed {
                reason,
                detail: self.detail,
            },
        }
    }
}

/// One block's result as seen by the case sequencer.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Completed { measurements: Vec<Measurement> },
    /// A trial exceeded the per-trial ceiling; `measurements` holds every
    /// trial that ran, the slow one included.
    TooSlow { measurements: Vec<Measurement> },
    Failed {
        reason: FailureReason,
        detail: Option<String>,
    },
}

impl BlockOutcome {
    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        BlockOutcome::Failed {
            reason,
            detail: Some(detail.into()),
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            BlockOutcome::Completed { .. } => None,
            BlockOutcome::TooSlow { .. } => Some(FailureReason::TooSlow),
            BlockOutcome::Failed { reason, .. } => Some(*reason),
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            BlockOutcome::Failed {
                reason: FailureReason::OutOfMemory,
                ..
            }
        )
    }
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    what: &'static str,
) -> Result<T, ProtocolError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ProtocolError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| ProtocolError::Malformed {
        what,
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProtocolError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| ProtocolError::Malformed {
        what: "payload",
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    // Readers poll for the file; it must appear complete or not at all.
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = std::path::PathBuf::from(staging);
    let write_err = |source| ProtocolError::Write {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&staging, json).map_err(write_err)?;
    std::fs::rename(&staging, path).map_err(write_err)
}
