// src/main.rs

use std::process::ExitCode;

use taskexec::{cli, logging, run};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("taskexec: cannot set up logging: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("executor stopped: {err:#}");
            ExitCode::FAILURE
        }
    }
}
