//! Disabled backup backend.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Backend, BackupError};

/// Backend that stores nothing and never has anything to restore.
pub struct NoBackend;

#[async_trait]
impl Backend for NoBackend {
    async fn store(
        &self,
        _ctx: &CancellationToken,
        _name: &str,
        _source: &Path,
    ) -> Result<(), BackupError> {
        Ok(())
    }

    async fn fetch(
        &self,
        _ctx: &CancellationToken,
        _name: &str,
        _dest: &Path,
    ) -> Result<(), BackupError> {
        Err(BackupError::NotFound)
    }
}
