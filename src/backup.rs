// src/backup.rs

//! Backup collaborator.

use async_trait::async_trait;
use tracing::warn;

use crate::errors::BackupError;
use crate::resource::Resource;

#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn backup(&self, res_type: &str, resource: &Resource) -> Result<(), BackupError>;
}

/// Runner for hosts without a backup backend: every backup fails loudly
/// so the alerting reporter surfaces it.
pub struct NoBackup;

#[async_trait]
impl BackupRunner for NoBackup {
    async fn backup(&self, res_type: &str, resource: &Resource) -> Result<(), BackupError> {
        warn!(res_type, resource = %resource, "backup requested but no backup backend configured");
        Err(BackupError::Unsupported(res_type.to_string()))
    }
}
