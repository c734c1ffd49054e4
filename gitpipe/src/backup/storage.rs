//! Volume snapshot and restore pipeline.
//!
//! A helper container mounts the named volumes and produces (or unpacks)
//! a gzipped tar; the archive is pushed through the cryptor and handed
//! to the backend. Temporary files live in guards so every exit path
//! removes them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Backend, BackupError};
use crate::cryptor::{Cryptor, CryptorError};
use crate::runtime::{
    ContainerRuntime, HelperMount, HelperRun, MountSource, RuntimeError,
};
use crate::tasks::Task;

/// Image used for the tar helper container.
const HELPER_IMAGE: &str = "busybox";
/// Archive path inside the helper container.
const ARCHIVE_PATH: &str = "/backup.tar.gz";
/// Volume mount root inside the helper container.
const MOUNT_ROOT: &str = "/mnt";

/// Errors from the snapshot pipeline.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backup backend: {0}")]
    Backend(#[from] BackupError),

    #[error("archive encryption: {0}")]
    Cryptor(#[from] CryptorError),

    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("temp file: {0}")]
    TempFile(#[from] std::io::Error),
}

/// Archives and restores named volume sets.
pub struct VolumeStorage {
    runtime: Arc<dyn ContainerRuntime>,
    backend: Arc<dyn Backend>,
    cryptor: Arc<dyn Cryptor>,
    temp_dir: Option<PathBuf>,
    driver: String,
    interval: Duration,
}

impl VolumeStorage {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn Backend>,
        cryptor: Arc<dyn Cryptor>,
        temp_dir: Option<PathBuf>,
        driver: String,
        interval: Duration,
    ) -> Self {
        Self {
            runtime,
            backend,
            cryptor,
            temp_dir,
            driver,
            interval,
        }
    }

    /// Restores the artefact `name` into the given volumes.
    ///
    /// Volumes are created when missing. A missing artefact leaves them
    /// untouched and is not an error. Existing files are overwritten by
    /// the extraction.
    pub async fn restore(
        &self,
        ctx: &CancellationToken,
        name: &str,
        volumes: &[String],
    ) -> Result<(), StorageError> {
        self.ensure_volumes(ctx, volumes).await?;

        let encrypted = self.temp_file()?;
        match self.backend.fetch(ctx, name, encrypted.path()).await {
            Ok(()) => {}
            Err(BackupError::NotFound) => {
                debug!(name, "no prior backup, volumes left untouched");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }

        let archive = self.temp_file()?;
        self.cryptor
            .decrypt(ctx, encrypted.path(), archive.path())
            .await?;

        let mut mounts = volume_mounts(volumes, false);
        mounts.push(HelperMount {
            source: MountSource::Bind(archive.path().to_path_buf()),
            target: ARCHIVE_PATH.to_string(),
            read_only: true,
        });
        self.runtime
            .run_helper(
                ctx,
                HelperRun {
                    image: HELPER_IMAGE.to_string(),
                    command: tar_command("-zxf"),
                    mounts,
                },
            )
            .await?;
        info!(name, volumes = volumes.len(), "volumes restored from backup");
        Ok(())
    }

    /// Snapshots the given volumes and uploads the encrypted archive
    /// under `name`.
    pub async fn backup(
        &self,
        ctx: &CancellationToken,
        name: &str,
        volumes: &[String],
    ) -> Result<(), StorageError> {
        let archive = self.temp_file()?;

        let mut mounts = volume_mounts(volumes, true);
        mounts.push(HelperMount {
            source: MountSource::Bind(archive.path().to_path_buf()),
            target: ARCHIVE_PATH.to_string(),
            read_only: false,
        });
        self.runtime
            .run_helper(
                ctx,
                HelperRun {
                    image: HELPER_IMAGE.to_string(),
                    command: tar_command("-zcf"),
                    mounts,
                },
            )
            .await?;

        let encrypted = self.temp_file()?;
        self.cryptor
            .encrypt(ctx, archive.path(), encrypted.path())
            .await?;
        self.backend.store(ctx, name, encrypted.path()).await?;
        info!(name, volumes = volumes.len(), "volumes backed up");
        Ok(())
    }

    /// Interval between scheduled snapshots.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns a task snapshotting the volumes on the configured
    /// interval. Per-tick failures are logged and swallowed.
    pub fn schedule(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        name: String,
        volumes: Vec<String>,
    ) -> Task {
        let storage = Arc::clone(self);
        Task::timer(ctx, self.interval, move |token| {
            let storage = Arc::clone(&storage);
            let name = name.clone();
            let volumes = volumes.clone();
            async move {
                storage
                    .backup(&token, &name, &volumes)
                    .await
                    .map_err(|error| error.into())
            }
        })
    }

    async fn ensure_volumes(
        &self,
        ctx: &CancellationToken,
        volumes: &[String],
    ) -> Result<(), StorageError> {
        for volume in volumes {
            self.runtime
                .ensure_volume(ctx, volume, &self.driver)
                .await?;
        }
        Ok(())
    }

    fn temp_file(&self) -> Result<NamedTempFile, StorageError> {
        let file = match &self.temp_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        Ok(file)
    }
}

fn volume_mounts(volumes: &[String], read_only: bool) -> Vec<HelperMount> {
    volumes
        .iter()
        .map(|volume| HelperMount {
            source: MountSource::Volume(volume.clone()),
            target: format!("{MOUNT_ROOT}/{volume}"),
            read_only,
        })
        .collect()
}

fn tar_command(mode: &str) -> Vec<String> {
    [
        "tar",
        "-C",
        MOUNT_ROOT,
        "--overwrite",
        mode,
        ARCHIVE_PATH,
        ".",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}
