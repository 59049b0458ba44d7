use clap::{Parser, Subcommand};
use matbench_core::config::{SweepConfig, DEFAULT_CONFIG_FILE};
use matbench_core::model::Operation;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "matbench",
    version,
    about = "Process-isolated, resumable throughput sweeps for matrix libraries"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run (or resume) a sweep
    Run(RunArgs),
    /// Show progress of every case recorded in the output directory
    Status(StatusArgs),
    /// List built-in libraries and the operations they support
    Libraries,
    /// Isolated trial runner; launched by `run` once per block
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Directory for case records and session logs
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Advance cases in fixed order instead of picking at random
    #[arg(long)]
    pub ordered: bool,

    /// Only these libraries (repeatable)
    #[arg(long = "library", short = 'l')]
    pub libraries: Vec<String>,

    /// Only these operations (repeatable)
    #[arg(long = "operation", short = 'o')]
    pub operations: Vec<Operation>,

    /// Comma-separated, strictly increasing sizes
    #[arg(long, value_delimiter = ',')]
    pub sizes: Option<Vec<usize>>,

    /// Trial ceiling per size
    #[arg(long)]
    pub max_trials: Option<u32>,

    /// Check every output against an independent computation
    #[arg(long)]
    pub validate: bool,

    /// Print the sweep summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Flags win over the file.
    pub fn apply(&self, cfg: &mut SweepConfig) {
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        if self.ordered {
            cfg.randomize_order = false;
        }
        if !self.libraries.is_empty() {
            cfg.libraries = self.libraries.clone();
        }
        if !self.operations.is_empty() {
            cfg.operations = self.operations.clone();
        }
        if let Some(sizes) = &self.sizes {
            cfg.sizes = sizes.clone();
        }
        if let Some(max) = self.max_trials {
            cfg.max_trials = max;
        }
        if self.validate {
            cfg.validate = true;
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct StatusArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Overrides the config's output directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Clone, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub plan: PathBuf,

    #[arg(long)]
    pub trials: u32,

    #[arg(long)]
    pub request_id: u64,

    /// Address-space limit for this process; 0 leaves it unlimited
    #[arg(long, default_value_t = 0)]
    pub memory_mb: u64,

    #[arg(long)]
    pub outcome: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "matbench",
            "run",
            "--ordered",
            "-l",
            "naive",
            "-o",
            "mult-trans-b",
            "-o",
            "det",
            "--sizes",
            "4,8,16",
            "--max-trials",
            "3",
            "--seed",
            "11",
        ])
        .unwrap();
        let Command::Run(args) = cli.cmd else {
            panic!("expected run");
        };
        let mut cfg = SweepConfig::default();
        args.apply(&mut cfg);
        assert!(!cfg.randomize_order);
        assert_eq!(cfg.libraries, vec!["naive"]);
        assert_eq!(cfg.operations, vec![Operation::MultTransB, Operation::Det]);
        assert_eq!(cfg.sizes, vec![4, 8, 16]);
        assert_eq!(cfg.max_trials, 3);
        assert_eq!(cfg.seed, 11);
        assert!(!cfg.validate);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(Cli::try_parse_from(["matbench", "run", "-o", "svd"]).is_err());
    }
}
