//! Symmetric authenticated archive encryption.
//!
//! AES-256-GCM with the key derived from the shared passphrase via
//! SHA-256. The 12-byte nonce is generated per archive and prefixed to
//! the ciphertext.

use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{Cryptor, CryptorError};

const NONCE_LEN: usize = 12;

/// Shared-key archive cryptor.
pub struct SymmetricCryptor {
    key: [u8; 32],
}

impl SymmetricCryptor {
    /// Derives the cipher key from a passphrase.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.key).expect("fixed 32-byte key")
    }
}

#[async_trait]
impl Cryptor for SymmetricCryptor {
    async fn encrypt(
        &self,
        _ctx: &CancellationToken,
        source: &Path,
        dest: &Path,
    ) -> Result<(), CryptorError> {
        let plain = tokio::fs::read(source).await?;
        let cipher = self.cipher();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plain.as_ref())
            .map_err(|_| CryptorError::Rejected)?;

        let mut output = Vec::with_capacity(NONCE_LEN + sealed.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&sealed);
        tokio::fs::write(dest, output).await?;
        Ok(())
    }

    async fn decrypt(
        &self,
        _ctx: &CancellationToken,
        source: &Path,
        dest: &Path,
    ) -> Result<(), CryptorError> {
        let sealed = tokio::fs::read(source).await?;
        if sealed.len() < NONCE_LEN {
            return Err(CryptorError::Malformed);
        }
        let cipher = self.cipher();
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        let plain = cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| CryptorError::Rejected)?;
        tokio::fs::write(dest, plain).await?;
        Ok(())
    }
}
