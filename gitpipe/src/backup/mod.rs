//! Volume backup pipeline.
//!
//! Named volume sets are archived by a helper container, encrypted and
//! pushed to a [`Backend`]; restores run the same path in reverse before
//! a workload first starts. Absence of a prior artefact is never an
//! error.

mod file;
mod none;
mod s3;
mod storage;

pub use file::FileBackend;
pub use none::NoBackend;
pub use s3::S3Backend;
pub use storage::{StorageError, VolumeStorage};

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from backup backends.
#[derive(Debug, Error)]
pub enum BackupError {
    /// No artefact is stored under the requested name.
    #[error("backup does not exist")]
    NotFound,

    #[error("backup io: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup transport: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote side answered with an unexpected status.
    #[error("backup store answered {status}: {body}")]
    Unexpected { status: u16, body: String },

    /// The backup location could not be understood.
    #[error("backup location invalid: {0}")]
    InvalidLocation(String),
}

/// Storage for encrypted artefacts, addressed by name.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Uploads `source` under `name`, replacing any previous artefact.
    async fn store(
        &self,
        ctx: &CancellationToken,
        name: &str,
        source: &Path,
    ) -> Result<(), BackupError>;

    /// Downloads the artefact `name` into `dest`.
    ///
    /// # Errors
    ///
    /// [`BackupError::NotFound`] when no artefact exists under `name`.
    async fn fetch(
        &self,
        ctx: &CancellationToken,
        name: &str,
        dest: &Path,
    ) -> Result<(), BackupError>;
}

/// Builds a backend from a location URL.
///
/// Supported forms: `none` (or empty) for no persistence, `file://dir`
/// for the local filesystem, `s3://id:secret@host/bucket` for object
/// storage.
pub fn from_location(location: &str) -> Result<std::sync::Arc<dyn Backend>, BackupError> {
    if location.is_empty() || location == "none" {
        return Ok(std::sync::Arc::new(NoBackend));
    }
    let url = url::Url::parse(location)
        .map_err(|error| BackupError::InvalidLocation(error.to_string()))?;
    match url.scheme() {
        "s3" => Ok(std::sync::Arc::new(S3Backend::from_url(&url)?)),
        "file" | "dir" => {
            let mut directory = std::path::PathBuf::new();
            if let Some(host) = url.host_str() {
                directory.push(host);
            }
            let path = url.path().trim_start_matches('/');
            if !path.is_empty() {
                directory.push(path);
            }
            Ok(std::sync::Arc::new(FileBackend::new(directory)))
        }
        other => Err(BackupError::InvalidLocation(format!(
            "unknown protocol {other}"
        ))),
    }
}
