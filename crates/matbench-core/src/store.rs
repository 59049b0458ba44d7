//! Resumable store: one JSON record per case at
//! `<root>/<library>/<operation>.json`.
//!
//! Records are rewritten after every block through a temp file in the same
//! directory, so a crash leaves either the old record or the new one.

use crate::errors::StoreError;
use crate::model::{BenchmarkCase, Operation, SizeMetrics};
use crate::sequencer::{CaseFailure, CaseState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const RECORD_SCHEMA: &str = "matbench-case-v1";

/// On-disk counterpart of a case's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedCaseRecord {
    pub schema_version: String,
    pub library: String,
    pub display_name: String,
    pub operation: Operation,
    pub sizes: Vec<usize>,
    /// One slot per size; `null` until the size has samples.
    pub metrics: Vec<Option<SizeMetrics>>,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CaseFailure>,
    #[serde(default)]
    pub max_memory_mb: u64,
    pub updated_at: DateTime<Utc>,
}

impl PersistedCaseRecord {
    /// Sizes with at least one slot populated.
    pub fn populated(&self) -> usize {
        self.metrics.iter().filter(|m| m.is_some()).count()
    }
}

/// What a fresh run should do with a case, given its record.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedCase {
    /// No usable record; start at the first size.
    Fresh,
    /// The record was written for a different size list.
    Stale(PersistedCaseRecord),
    /// Nothing left to run.
    Complete(PersistedCaseRecord),
    Resume(CaseState),
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, library: &str, op: Operation) -> PathBuf {
        self.root.join(library).join(format!("{}.json", op.name()))
    }

    pub fn read(
        &self,
        library: &str,
        op: Operation,
    ) -> Result<Option<PersistedCaseRecord>, StoreError> {
        let path = self.record_path(library, op);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Reads the record for `case` and applies the resumption rule.
    pub fn load(
        &self,
        case: &BenchmarkCase,
        max_trial_time: Duration,
    ) -> Result<LoadedCase, StoreError> {
        let Some(record) = self.read(case.library(), case.operation())? else {
            return Ok(LoadedCase::Fresh);
        };
        if record.sizes != case.sizes() || record.metrics.len() != record.sizes.len() {
            warn!(
                case = %case.label(),
                stored = ?record.sizes,
                "record size list differs; starting fresh"
            );
            return Ok(LoadedCase::Stale(record));
        }
        Ok(resume_point(record, case.max_trials() as usize, max_trial_time))
    }

    pub fn save(&self, record: &PersistedCaseRecord) -> Result<PathBuf, StoreError> {
        let path = self.record_path(&record.library, record.operation);
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::io(dir, e))?;

        let json = serde_json::to_string_pretty(record).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| StoreError::io(dir, e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;
        debug!(path = %path.display(), "record saved");
        Ok(path)
    }

    /// Every record under the root, sorted by path.
    pub fn list(&self) -> Result<Vec<(PathBuf, PersistedCaseRecord)>, StoreError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        let libs = std::fs::read_dir(&self.root)
            .map_err(|e| StoreError::io(&self.root, e))?;
        for lib in libs {
            let lib = lib.map_err(|e| StoreError::io(&self.root, e))?.path();
            if !lib.is_dir() {
                continue;
            }
            let files = std::fs::read_dir(&lib).map_err(|e| StoreError::io(&lib, e))?;
            for file in files {
                let path = file.map_err(|e| StoreError::io(&lib, e))?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    out.push((path.clone(), read_record(&path)?));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn read_record(path: &Path) -> Result<PersistedCaseRecord, StoreError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| StoreError::io(path, e))?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let found = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if found != RECORD_SCHEMA {
        return Err(StoreError::Schema {
            path: path.to_path_buf(),
            found: found.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Where to pick up a case that is not flagged complete.
///
/// Resumes at the first empty slot (or one past the last slot when all are
/// populated), unless the slot before it is short of the trial ceiling and
/// none of its samples exceeded the per-trial ceiling; then that slot is
/// resumed with its samples kept.
pub fn resume_point(
    record: PersistedCaseRecord,
    max_trials: usize,
    max_trial_time: Duration,
) -> LoadedCase {
    if record.complete {
        return LoadedCase::Complete(record);
    }
    let first_empty = record
        .metrics
        .iter()
        .position(Option::is_none)
        .unwrap_or(record.metrics.len());

    let mut index = first_empty;
    let mut pending = Vec::new();
    if let Some(Some(prev)) = first_empty.checked_sub(1).map(|i| &record.metrics[i]) {
        let reached_ceiling = prev.samples.len() >= max_trials;
        let too_slow = prev.samples.iter().any(|m| m.exceeds(max_trial_time));
        if !(reached_ceiling || too_slow) {
            index = first_empty - 1;
            pending = prev.samples.clone();
        }
    }

    if index >= record.metrics.len() {
        warn!(
            library = %record.library,
            operation = %record.operation,
            "record not flagged complete but every size is finalized; treating as complete"
        );
        return LoadedCase::Complete(record);
    }

    let finalized = record
        .metrics
        .iter()
        .enumerate()
        .map(|(i, slot)| if i < index { slot.clone() } else { None })
        .collect();
    LoadedCase::Resume(CaseState::resumed(index, pending, finalized, record.max_memory_mb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TooSlowPolicy;
    use crate::dispatch::DispatchReport;
    use crate::model::Measurement;
    use crate::protocol::{BlockOutcome, FailureReason};
    use crate::sequencer::CaseSequencer;

    fn m(elapsed: f64) -> Measurement {
        Measurement {
            ops_per_sec: 50.0,
            elapsed_secs: elapsed,
            cycles: 50,
        }
    }

    fn block(outcome: BlockOutcome) -> DispatchReport {
        DispatchReport {
            request_id: 7,
            outcome,
            memory_mb: 512,
            budgets_mb: vec![512],
            memory_exhausted: false,
        }
    }

    fn ok(n: usize) -> DispatchReport {
        block(BlockOutcome::Completed {
            measurements: vec![m(0.2); n],
        })
    }

    fn case() -> BenchmarkCase {
        BenchmarkCase::new("naive", Operation::Invert, vec![10, 50, 100], 5)
            .unwrap()
            .with_display_name("Naive")
    }

    const CEILING: Duration = Duration::from_secs(1);

    #[test]
    fn missing_record_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        assert_eq!(store.load(&case(), CEILING).unwrap(), LoadedCase::Fresh);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn partial_size_resumes_with_its_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AdvanceSize);
        seq.fold(&ok(5));
        seq.fold(&ok(3));
        let path = store.save(&seq.to_record()).unwrap();
        assert_eq!(path, dir.path().join("naive").join("invert.json"));

        let LoadedCase::Resume(state) = store.load(&case(), CEILING).unwrap() else {
            panic!("expected resume");
        };
        assert_eq!(state.size_index(), 1);
        assert_eq!(state.pending().len(), 3);
        assert_eq!(state.finalized()[0].as_ref().unwrap().sample_count, 5);
        assert!(state.finalized()[1].is_none());
        assert_eq!(state.max_memory_mb(), 512);

        // The resumed state carries on exactly where the old one stopped.
        let mut resumed = CaseSequencer::with_state(case(), TooSlowPolicy::AdvanceSize, state);
        resumed.fold(&ok(2));
        assert_eq!(resumed.state().size_index(), 2);
    }

    #[test]
    fn round_trip_matches_resumption_rule() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AdvanceSize);
        seq.fold(&ok(5));
        seq.fold(&ok(5));
        let record = seq.to_record();
        store.save(&record).unwrap();

        let back = store.read("naive", Operation::Invert).unwrap().unwrap();
        assert_eq!(back, record);
        let LoadedCase::Resume(state) = store.load(&case(), CEILING).unwrap() else {
            panic!("expected resume");
        };
        assert_eq!(state.size_index(), seq.state().size_index());
        assert_eq!(state.finalized(), seq.state().finalized());
        assert!(state.pending().is_empty());
    }

    #[test]
    fn slow_sample_finalizes_short_slot() {
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AdvanceSize);
        seq.fold(&block(BlockOutcome::TooSlow {
            measurements: vec![m(0.2), m(3.0)],
        }));
        let record = seq.to_record();
        let LoadedCase::Resume(state) = resume_point(record, 5, CEILING) else {
            panic!("expected resume");
        };
        assert_eq!(state.size_index(), 1);
        assert!(state.pending().is_empty());
    }

    #[test]
    fn complete_flag_and_full_slots_skip_the_case() {
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AbortCase);
        seq.fold(&block(BlockOutcome::TooSlow {
            measurements: vec![m(3.0)],
        }));
        assert!(matches!(
            resume_point(seq.to_record(), 5, CEILING),
            LoadedCase::Complete(_)
        ));

        let mut record = seq.to_record();
        record.complete = false;
        record.metrics = vec![
            Some(SizeMetrics::from_samples(&[m(0.1)])),
            Some(SizeMetrics::from_samples(&[m(0.1)])),
            Some(SizeMetrics::from_samples(&[m(0.1); 5])),
        ];
        assert!(matches!(
            resume_point(record.clone(), 5, CEILING),
            LoadedCase::Complete(_)
        ));

        record.metrics[2] = Some(SizeMetrics::from_samples(&[m(0.1), m(3.0)]));
        assert!(matches!(resume_point(record, 5, CEILING), LoadedCase::Complete(_)));
    }

    #[test]
    fn partial_last_size_resumes_with_its_samples() {
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AdvanceSize);
        seq.fold(&ok(5));
        seq.fold(&ok(5));
        seq.fold(&ok(3));
        seq.fold(&block(BlockOutcome::failed(FailureReason::Frozen, "no outcome")));
        let record = seq.to_record();
        assert!(!record.complete);
        assert_eq!(record.populated(), 3);

        let LoadedCase::Resume(state) = resume_point(record, 5, CEILING) else {
            panic!("expected resume");
        };
        assert_eq!(state.size_index(), 2);
        assert_eq!(state.pending().len(), 3);
        assert!(state.finalized()[..2].iter().all(Option::is_some));
        assert!(state.finalized()[2].is_none());
    }

    #[test]
    fn failed_case_resumes_at_failing_size() {
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AdvanceSize);
        seq.fold(&ok(5));
        seq.fold(&block(BlockOutcome::failed(FailureReason::MiscException, "boom")));
        let LoadedCase::Resume(state) = resume_point(seq.to_record(), 5, CEILING) else {
            panic!("expected resume");
        };
        assert_eq!(state.size_index(), 1);
        assert!(state.failure().is_none());
    }

    #[test]
    fn different_size_list_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let mut seq = CaseSequencer::new(case(), TooSlowPolicy::AdvanceSize);
        seq.fold(&ok(5));
        store.save(&seq.to_record()).unwrap();

        let wider = BenchmarkCase::new("naive", Operation::Invert, vec![10, 50, 100, 200], 5)
            .unwrap();
        assert!(matches!(store.load(&wider, CEILING).unwrap(), LoadedCase::Stale(_)));
    }

    #[test]
    fn foreign_schema_and_garbage_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let path = store.record_path("naive", Operation::Invert);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, r#"{"schema_version": "other"}"#).unwrap();
        assert!(matches!(
            store.load(&case(), CEILING),
            Err(StoreError::Schema { .. })
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            store.load(&case(), CEILING),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn list_reports_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        for op in [Operation::Add, Operation::Det] {
            let c = BenchmarkCase::new("blocked", op, vec![2, 4], 5).unwrap();
            let mut seq = CaseSequencer::new(c, TooSlowPolicy::AdvanceSize);
            seq.fold(&ok(5));
            store.save(&seq.to_record()).unwrap();
        }
        std::fs::write(dir.path().join("log0.txt"), "not a record").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].1.operation, Operation::Add);
        assert_eq!(listed[1].1.populated(), 1);
    }
}
