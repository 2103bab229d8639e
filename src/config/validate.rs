// src/config/validate.rs

use std::str::FromStr;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, TaskExecError};
use crate::listener::scheduler::JobTiming;
use crate::task::Action;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TaskExecError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_server(cfg)?;
    validate_workers(cfg)?;
    validate_schedule(cfg)?;
    Ok(())
}

fn validate_server(cfg: &RawConfigFile) -> Result<()> {
    if cfg.server.id.trim().is_empty() {
        return Err(TaskExecError::ConfigError(
            "[server].id must not be empty".to_string(),
        ));
    }
    if cfg.server.hostname.trim().is_empty() {
        return Err(TaskExecError::ConfigError(
            "[server].hostname must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_workers(cfg: &RawConfigFile) -> Result<()> {
    let workers = &cfg.max_workers;
    for (name, value) in [
        ("command", workers.command),
        ("query", workers.query),
        ("backup.files", workers.backup.files),
        ("backup.dbs", workers.backup.dbs),
    ] {
        if value == 0 {
            return Err(TaskExecError::ConfigError(format!(
                "[max_workers].{name} must be >= 1 (got 0)"
            )));
        }
    }
    if cfg.executor.poll_interval_ms == 0 {
        return Err(TaskExecError::ConfigError(
            "[executor].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_schedule(cfg: &RawConfigFile) -> Result<()> {
    for (idx, entry) in cfg.schedule.iter().enumerate() {
        Action::from_str(&entry.action).map_err(|e| {
            TaskExecError::ConfigError(format!("[[schedule]] #{idx} ({}): {e}", entry.res_type))
        })?;
        JobTiming::from_entry(entry).map_err(|e| {
            TaskExecError::ConfigError(format!(
                "[[schedule]] #{idx} ({}.{}): {e}",
                entry.res_type, entry.action
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> RawConfigFile {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = ConfigFile::try_from(parse(
            r#"
            [server]
            hostname = "web15"
            id = "srv-15"
            "#,
        ))
        .unwrap();
        assert_eq!(cfg.max_workers.command, 10);
        assert_eq!(cfg.max_workers.long_command(), 5);
        assert_eq!(cfg.task.max_retries, 5);
        assert_eq!(cfg.consumer_routing_key(), "te.web15");
    }

    #[test]
    fn zero_workers_rejected() {
        let err = ConfigFile::try_from(parse(
            r#"
            [server]
            id = "srv-15"
            [max_workers.backup]
            dbs = 0
            "#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("backup.dbs"));
    }

    #[test]
    fn schedule_entries_are_checked() {
        let bad_action = parse(
            r#"
            [server]
            id = "srv-15"
            [[schedule]]
            action = "explode"
            res_type = "unix-account"
            interval = 10
            "#,
        );
        assert!(ConfigFile::try_from(bad_action).is_err());

        let daily_without_at = parse(
            r#"
            [server]
            id = "srv-15"
            [[schedule]]
            action = "backup"
            res_type = "database"
            daily = true
            "#,
        );
        assert!(ConfigFile::try_from(daily_without_at).is_err());

        let ok = parse(
            r#"
            [server]
            id = "srv-15"
            [[schedule]]
            action = "backup"
            res_type = "database"
            daily = true
            at = "03:30"
            "#,
        );
        assert!(ConfigFile::try_from(ok).is_ok());
    }
}
