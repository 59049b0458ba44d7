use super::super::args::StatusArgs;
use crate::exit_codes;
use matbench_core::store::{PersistedCaseRecord, ResultStore};
use matbench_core::SweepConfig;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct CaseStatus {
    library: String,
    operation: String,
    sizes_done: usize,
    sizes_total: usize,
    samples: usize,
    max_memory_mb: u64,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl From<&PersistedCaseRecord> for CaseStatus {
    fn from(r: &PersistedCaseRecord) -> Self {
        let state = match (&r.failure, r.complete) {
            (Some(f), _) if f.permanent => "failed",
            (_, true) => "complete",
            (Some(_), false) => "resumable",
            (None, false) => "in progress",
        };
        Self {
            library: r.display_name.clone(),
            operation: r.operation.to_string(),
            sizes_done: r.populated(),
            sizes_total: r.sizes.len(),
            samples: r.metrics.iter().flatten().map(|m| m.sample_count).sum(),
            max_memory_mb: r.max_memory_mb,
            state,
            failure: r
                .failure
                .as_ref()
                .map(|f| format!("{} at size {}", f.reason, f.size)),
        }
    }
}

pub fn run(args: &StatusArgs) -> anyhow::Result<i32> {
    let output_dir = match &args.output_dir {
        Some(dir) => dir.clone(),
        None => match SweepConfig::load_or_default(&args.config) {
            Ok(cfg) => cfg.output_dir,
            Err(e) => {
                eprintln!("config error: {e}");
                return Ok(exit_codes::CONFIG_ERROR);
            }
        },
    };

    let records = ResultStore::new(&output_dir).list()?;
    let rows: Vec<CaseStatus> = records.iter().map(|(_, r)| CaseStatus::from(r)).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(exit_codes::SUCCESS);
    }
    if rows.is_empty() {
        println!("no case records in {}", output_dir.display());
        return Ok(exit_codes::SUCCESS);
    }
    println!(
        "{:<24} {:<14} {:>7} {:>8} {:>8}  state",
        "library", "operation", "sizes", "samples", "mem MB"
    );
    for row in &rows {
        println!(
            "{:<24} {:<14} {:>3}/{:<3} {:>8} {:>8}  {}{}",
            row.library,
            row.operation,
            row.sizes_done,
            row.sizes_total,
            row.samples,
            row.max_memory_mb,
            row.state,
            row.failure
                .as_deref()
                .map(|f| format!(" ({f})"))
                .unwrap_or_default()
        );
    }
    Ok(exit_codes::SUCCESS)
}
