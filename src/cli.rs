// src/cli.rs

//! Command-line surface of the executor daemon.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskexec",
    version,
    about = "Execute hosting resource tasks received from the broker and the local scheduler.",
    long_about = None
)]
pub struct CliArgs {
    /// Executor config: pools, retry policy, broker bindings and schedule.
    #[arg(long, value_name = "PATH", default_value = "taskexec.toml")]
    pub config: PathBuf,

    /// Verbosity; overrides `TASKEXEC_LOG` when given.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Load the config, show pool sizes, scheduled jobs and queue bindings,
    /// and exit without consuming anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_local_config_file() {
        let args = CliArgs::parse_from(["taskexec"]);
        assert_eq!(args.config, PathBuf::from("taskexec.toml"));
        assert!(args.log_level.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn dry_run_with_explicit_level() {
        let args = CliArgs::parse_from([
            "taskexec",
            "--config",
            "/etc/te/taskexec.toml",
            "--log-level",
            "debug",
            "--dry-run",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/te/taskexec.toml"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert!(args.dry_run);
    }
}
