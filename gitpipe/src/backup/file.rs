//! Filesystem backup backend.
//!
//! One file per namespace inside a flat directory. Writes go through a
//! `.!tmp` sibling and a rename so a crashed upload never corrupts the
//! previous artefact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Backend, BackupError};

/// Backend storing artefacts as plain files.
pub struct FileBackend {
    directory: PathBuf,
}

impl FileBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn store(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        source: &Path,
    ) -> Result<(), BackupError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let staging = self.directory.join(format!("{name}.!tmp"));
        let dest = self.directory.join(name);
        tokio::fs::copy(source, &staging).await?;
        tokio::fs::rename(&staging, &dest).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        dest: &Path,
    ) -> Result<(), BackupError> {
        let source = self.directory.join(name);
        match tokio::fs::copy(&source, dest).await {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound)
            }
            Err(error) => Err(error.into()),
        }
    }
}
