use super::args::*;

pub mod libraries;
pub mod run;
pub mod status;
pub mod worker;

/// Controller-side commands; `worker` never goes through here.
pub async fn dispatch(cmd: Command) -> anyhow::Result<i32> {
    match cmd {
        Command::Run(args) => run::run(args).await,
        Command::Status(args) => status::run(&args),
        Command::Libraries => Ok(libraries::run()),
        Command::Worker(args) => Ok(worker::run(&args)),
    }
}
