//! Pass-through cryptor for unencrypted backups.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Cryptor, CryptorError};

/// Copies archives unchanged.
pub struct PlainCryptor;

#[async_trait]
impl Cryptor for PlainCryptor {
    async fn encrypt(
        &self,
        _ctx: &CancellationToken,
        source: &Path,
        dest: &Path,
    ) -> Result<(), CryptorError> {
        tokio::fs::copy(source, dest).await?;
        Ok(())
    }

    async fn decrypt(
        &self,
        _ctx: &CancellationToken,
        source: &Path,
        dest: &Path,
    ) -> Result<(), CryptorError> {
        tokio::fs::copy(source, dest).await?;
        Ok(())
    }
}
