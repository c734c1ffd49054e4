//! Pluggable archive encryption.
//!
//! The backup pipeline pushes archives through a [`Cryptor`] in both
//! directions. Files are managed by the caller; implementations only
//! transform source into destination.

mod plain;
mod symmetric;

pub use plain::PlainCryptor;
pub use symmetric::SymmetricCryptor;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from encryption and decryption.
#[derive(Debug, Error)]
pub enum CryptorError {
    #[error("archive io: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed or the content is not a valid archive.
    #[error("archive cipher rejected the content")]
    Rejected,

    /// The encrypted file is too short to contain a nonce.
    #[error("encrypted archive malformed")]
    Malformed,
}

/// File-to-file encryption transform.
#[async_trait]
pub trait Cryptor: Send + Sync + 'static {
    /// Encrypts `source` into `dest`.
    async fn encrypt(
        &self,
        ctx: &CancellationToken,
        source: &Path,
        dest: &Path,
    ) -> Result<(), CryptorError>;

    /// Decrypts `source` into `dest`.
    async fn decrypt(
        &self,
        ctx: &CancellationToken,
        source: &Path,
        dest: &Path,
    ) -> Result<(), CryptorError>;
}
