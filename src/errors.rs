// src/errors.rs

//! Crate-wide error types.
//!
//! Each collaborator seam has its own small enum so callers can tell a
//! "not found" from a transport failure without string matching. The
//! process surface collapses everything into [`TaskExecError`] or
//! `anyhow::Error`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskExecError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Broker listener stopped: {0}")]
    ListenerDied(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the resource catalog collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("catalog transport error: {0}")]
    Transport(String),
}

/// Errors raised by a concrete create/update/delete handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid resource: {0}")]
    Validation(String),

    #[error("{operation} failed for {resource}: {reason}")]
    Failed {
        operation: String,
        resource: String,
        reason: String,
    },

    #[error("operational service error: {0}")]
    Service(String),
}

/// Errors while turning a resource into a processing sequence.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("no handler registered for resource type '{0}'")]
    HandlerNotFound(String),

    #[error("dependency cycle detected at {0}")]
    DependencyCycle(String),

    #[error("malformed resource: {0}")]
    Malformed(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Everything a single task run can fail with.
///
/// `class()` is what ends up in `params.last_exception.class`.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("task worker panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    pub fn class(&self) -> &'static str {
        match self {
            ProcessError::Resolution(ResolutionError::HandlerNotFound(_)) => "HandlerNotFound",
            ProcessError::Resolution(ResolutionError::DependencyCycle(_)) => "DependencyCycle",
            ProcessError::Resolution(ResolutionError::Malformed(_)) => "ResourceValidationError",
            ProcessError::Resolution(ResolutionError::Catalog(_)) | ProcessError::Catalog(_) => {
                "CatalogError"
            }
            ProcessError::Handler(HandlerError::Validation(_)) => "ResourceValidationError",
            ProcessError::Handler(_) => "ResourceProcessingError",
            ProcessError::Collector(_) => "CollectorError",
            ProcessError::Backup(_) => "BackupError",
            ProcessError::Panicked(_) => "WorkerPanic",
        }
    }
}

/// Errors raised while reading the live state of a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("no collector registered for resource type '{0}'")]
    NotRegistered(String),

    #[error("property '{property}' is not supported for {res_type}")]
    UnsupportedProperty { res_type: String, property: String },

    #[error("collecting {property} failed: {reason}")]
    Failed { property: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("no backup runner for resource type '{0}'")]
    Unsupported(String),

    #[error("backup of {resource} failed: {reason}")]
    Failed { resource: String, reason: String },
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker consumer closed")]
    ConsumerClosed,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error on snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode snapshot {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot {path} is not valid JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskExecError>;
