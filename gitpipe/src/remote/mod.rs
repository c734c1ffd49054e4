//! Remote repository sources.
//!
//! A [`Source`] can be polled into a working directory and reports
//! whether anything changed since the previous poll. The only shipped
//! implementation wraps the `git` binary.

mod git;

pub use git::GitSource;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::command::CommandError;

/// Errors from polling a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The repository reference could not be parsed.
    #[error("parse url: {0}")]
    InvalidReference(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Provider of a remote repository.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// Reference to the repository.
    fn ref_url(&self) -> &Url;

    /// Syncs `target_dir` with the remote head.
    ///
    /// Returns `true` on the first clone and whenever the head hash
    /// moved.
    async fn poll(
        &self,
        ctx: &CancellationToken,
        target_dir: &Path,
    ) -> Result<bool, SourceError>;
}
