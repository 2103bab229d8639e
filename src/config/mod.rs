// src/config/mod.rs

//! Configuration loading and validation for taskexec.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate invariants such as worker counts and schedule entries
//!   (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    AmqpSection, BackupWorkersSection, CacheSection, ConfigFile, ExecutorSection,
    MaxWorkersSection, RawConfigFile, ScheduleEntry, ServerSection, TaskSection,
    WatchdogSection,
};
