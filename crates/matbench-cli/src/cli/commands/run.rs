use super::super::args::RunArgs;
use crate::exit_codes;
use anyhow::Context;
use matbench_core::dispatch::launcher::resolve_worker_binary;
use matbench_core::dispatch::{BlockDispatcher, ProcessLauncher, WorkerLauncher};
use matbench_core::model::BenchmarkCase;
use matbench_core::session_log::SessionLog;
use matbench_core::store::ResultStore;
use matbench_core::{LibraryRegistry, Sweep, SweepConfig, SweepSummary};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut cfg = match SweepConfig::load_or_default(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    args.apply(&mut cfg);
    if let Err(e) = cfg.validate() {
        eprintln!("config error: {e}");
        return Ok(exit_codes::CONFIG_ERROR);
    }

    let registry = matbench_native::registry();
    let cases = match select_cases(&cfg, &registry) {
        Ok(cases) if cases.is_empty() => {
            eprintln!("config error: no supported (library, operation) pairs selected");
            return Ok(exit_codes::CONFIG_ERROR);
        }
        Ok(cases) => cases,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let mut log = SessionLog::create_in(&cfg.output_dir)?;
    let work_dir = tempfile::Builder::new()
        .prefix("matbench-worker-")
        .tempdir()
        .context("creating worker scratch directory")?;
    let launcher = ProcessLauncher::new(
        resolve_worker_binary(),
        vec!["worker".into()],
        work_dir.path(),
    );
    let cwd = std::env::current_dir().context("reading working directory")?;
    log.startup(&cwd, &launcher.describe());
    info!(
        cases = cases.len(),
        output = %cfg.output_dir.display(),
        worker = %launcher.program().display(),
        "starting sweep"
    );
    if let Some(path) = log.path() {
        info!(session_log = %path.display(), "session log");
    }

    let worker = launcher.handle();
    let dispatcher = BlockDispatcher::new(launcher, &cfg);
    let mut sweep = Sweep::new(dispatcher, ResultStore::new(&cfg.output_dir), &cfg);

    let stop = sweep.stop_flag();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current block (Ctrl-C again to abort)...");
            stop.store(true, Ordering::SeqCst);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            if worker.kill() {
                eprintln!("Killed the worker in flight; its block is lost.");
            }
            std::process::exit(exit_codes::INTERRUPTED);
        }
    });

    let result = tokio::task::spawn_blocking(move || {
        let summary = sweep.run(cases, &mut log);
        drop(work_dir);
        summary
    })
    .await
    .context("sweep task panicked")?;
    signals.abort();
    let summary = result?;

    report(&summary, args.json)?;
    Ok(exit_code(&summary))
}

fn select_cases(
    cfg: &SweepConfig,
    registry: &LibraryRegistry,
) -> anyhow::Result<Vec<BenchmarkCase>> {
    let libraries: Vec<String> = if cfg.libraries.is_empty() {
        registry.names().map(str::to_string).collect()
    } else {
        cfg.libraries.clone()
    };
    if let Some(unknown) = libraries.iter().find(|l| registry.get(l).is_none()) {
        let known: Vec<&str> = registry.names().collect();
        anyhow::bail!(
            "unknown library {unknown:?} (available: {})",
            known.join(", ")
        );
    }

    let cases = cfg.build_cases(libraries.iter().map(String::as_str), |lib, op| {
        registry.get(lib).is_some_and(|l| l.supports(op))
    })?;
    Ok(cases
        .into_iter()
        .map(|case| match registry.get(case.library()) {
            Some(lib) => {
                let name = lib.display_name().to_string();
                case.with_display_name(name)
            }
            None => case,
        })
        .collect())
}

fn report(summary: &SweepSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!(
        "cases: {} completed, {} failed, {} already complete, {} resumed; {} blocks run",
        summary.completed, summary.failed, summary.skipped, summary.resumed, summary.blocks
    );
    for (case, failure) in &summary.failures {
        let kind = if failure.permanent {
            "permanent"
        } else {
            "resumable"
        };
        println!(
            "  FAILED {case} at size {} ({}, {kind})",
            failure.size, failure.reason
        );
        if let Some(detail) = failure.detail.as_deref().and_then(|d| d.lines().next()) {
            println!("         {detail}");
        }
    }
    if summary.interrupted {
        warn!("sweep interrupted; rerun the same command to resume");
        println!("interrupted: rerun to resume");
    }
    Ok(())
}

fn exit_code(summary: &SweepSummary) -> i32 {
    if summary.interrupted {
        exit_codes::INTERRUPTED
    } else if summary.failed > 0 {
        exit_codes::CASE_FAILED
    } else {
        exit_codes::SUCCESS
    }
}
