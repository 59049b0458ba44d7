use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
pub mod exit_codes;

use cli::args::{Cli, Command};
use cli::commands::{dispatch, worker};

fn main() {
    let cli = Cli::parse();

    // Workers stay single-threaded and quiet: no runtime, warnings only,
    // everything on stderr where the controller keeps the tail.
    if let Command::Worker(args) = &cli.cmd {
        init_tracing("warn");
        std::process::exit(worker::run(args));
    }

    init_tracing("info");
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: cannot start runtime: {e}");
            std::process::exit(exit_codes::CONFIG_ERROR);
        }
    };
    let code = match runtime.block_on(dispatch(cli.cmd)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            exit_codes::CONFIG_ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
