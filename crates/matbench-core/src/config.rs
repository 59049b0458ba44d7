//! Sweep configuration (YAML file, every field optional).

use crate::errors::ConfigError;
use crate::model::{BenchmarkCase, Operation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "matbench.yaml";

/// What a "too slow" block means for the sizes after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TooSlowPolicy {
    /// Finalize the size and move on to the next one.
    #[default]
    AdvanceSize,
    /// Finalize the size and end the case; larger sizes are never tried.
    AbortCase,
}

/// Memory budget estimation and out-of-memory escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Fixed overhead added to the estimated input footprint.
    pub base_mb: u64,
    /// Attempts per block before the case is failed permanently.
    pub max_attempts: u32,
    /// Budget multiplier on attempt `k` (0-based) is `1 + growth_step * k`.
    pub growth_step: u64,
    /// Use exactly this budget for every block; disables estimation and retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_mb: 256,
            max_attempts: 5,
            growth_step: 1,
            fixed_mb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub output_dir: PathBuf,
    pub seed: u64,
    /// Pick the next case uniformly at random instead of in fixed order.
    pub randomize_order: bool,
    pub sizes: Vec<usize>,
    /// Empty means every operation.
    pub operations: Vec<Operation>,
    /// Empty means every registered library.
    pub libraries: Vec<String>,
    /// Trial ceiling per size.
    pub max_trials: u32,
    /// Trials requested per worker invocation.
    pub block_trials: u32,
    /// Target wall time of the timed part of one trial.
    pub trial_time_ms: u64,
    /// A trial slower than this ends the size ("too slow").
    pub max_trial_time_ms: u64,
    /// Worker stops starting new trials after this much block time.
    pub max_block_time_ms: u64,
    /// Extra allowance on top of the block budget before a worker is frozen.
    pub block_timeout_slack_ms: u64,
    pub memory: MemoryConfig,
    pub validate: bool,
    pub tolerance: f64,
    pub too_slow_policy: TooSlowPolicy,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results"),
            seed: 0x5EED_2011,
            randomize_order: true,
            sizes: vec![2, 4, 10, 20, 50, 100, 200, 500, 1000, 2000],
            operations: Vec::new(),
            libraries: Vec::new(),
            max_trials: 5,
            block_trials: 5,
            trial_time_ms: 1_500,
            max_trial_time_ms: 30_000,
            max_block_time_ms: 300_000,
            block_timeout_slack_ms: 60_000,
            memory: MemoryConfig::default(),
            validate: false,
            tolerance: 1e-8,
            too_slow_policy: TooSlowPolicy::default(),
        }
    }
}

impl SweepConfig {
    /// Loads `path`; a missing file is an error, an empty file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads `path` if it exists, otherwise returns defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 6] = [
            ("max_trials", u64::from(self.max_trials)),
            ("block_trials", u64::from(self.block_trials)),
            ("trial_time_ms", self.trial_time_ms),
            ("max_trial_time_ms", self.max_trial_time_ms),
            ("max_block_time_ms", self.max_block_time_ms),
            ("memory.max_attempts", u64::from(self.memory.max_attempts)),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.memory.fixed_mb == Some(0) {
            return Err(ConfigError::Zero {
                field: "memory.fixed_mb",
            });
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Tolerance {
                value: self.tolerance,
            });
        }
        if self.sizes.is_empty() {
            return Err(ConfigError::EmptySizes {
                case: "sweep".into(),
            });
        }
        if self.sizes.windows(2).any(|w| w[0] >= w[1]) || self.sizes[0] == 0 {
            return Err(ConfigError::SizesNotIncreasing {
                case: "sweep".into(),
                sizes: self.sizes.clone(),
            });
        }
        Ok(())
    }

    pub fn trial_time(&self) -> Duration {
        Duration::from_millis(self.trial_time_ms)
    }

    pub fn max_trial_time(&self) -> Duration {
        Duration::from_millis(self.max_trial_time_ms)
    }

    pub fn max_block_time(&self) -> Duration {
        Duration::from_millis(self.max_block_time_ms)
    }

    /// Wall-clock budget for one worker invocation before it is declared frozen.
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(
            self.max_block_time_ms
                .saturating_add(self.max_trial_time_ms)
                .saturating_add(self.block_timeout_slack_ms),
        )
    }

    pub fn selected_operations(&self) -> Vec<Operation> {
        if self.operations.is_empty() {
            Operation::ALL.to_vec()
        } else {
            self.operations.clone()
        }
    }

    /// Cross product of `libraries` and operations, skipping pairs the
    /// library reports as unsupported.
    pub fn build_cases<'a, F>(
        &self,
        libraries: impl IntoIterator<Item = &'a str>,
        supports: F,
    ) -> Result<Vec<BenchmarkCase>, ConfigError>
    where
        F: Fn(&str, Operation) -> bool,
    {
        let ops = self.selected_operations();
        let mut cases = Vec::new();
        for lib in libraries {
            for &op in &ops {
                if supports(lib, op) {
                    cases.push(BenchmarkCase::new(lib, op, self.sizes.clone(), self.max_trials)?);
                }
            }
        }
        Ok(cases)
    }
}
