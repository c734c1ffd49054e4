//! Certificate management for the TLS servers.
//!
//! Static mode reads `server.crt`/`server.key` from the SSL directory.
//! On-demand mode resolves certificates per SNI host: allowed hosts are
//! served from the in-memory/disk cache, unknown-but-allowed hosts get
//! an issuance scheduled in the background, and hosts outside the
//! routing table are rejected before anything touches the cache.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BoxError;

/// Errors loading certificate material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("read certificate material: {0}")]
    Io(#[from] std::io::Error),

    #[error("no private key found in {0}")]
    MissingKey(PathBuf),

    #[error("certificate rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Decides which SNI hosts may be served.
pub trait HostPolicy: Send + Sync + 'static {
    fn allows(&self, host: &str) -> bool;
}

/// Produces certificate material for a host.
///
/// The ACME client lives behind this seam; the in-tree implementation
/// issues self-signed certificates for development setups.
#[async_trait]
pub trait CertificateIssuer: Send + Sync + 'static {
    /// Returns `(certificate_pem, key_pem)` for the host.
    async fn issue(&self, host: &str) -> Result<(String, String), BoxError>;
}

/// Development issuer producing self-signed certificates.
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, host: &str) -> Result<(String, String), BoxError> {
        let certified = rcgen::generate_simple_self_signed(vec![host.to_string()])?;
        Ok((certified.cert.pem(), certified.key_pair.serialize_pem()))
    }
}

/// Loads a rustls server identity from PEM files.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs: Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file)).collect();

    let key_file = std::fs::File::open(key_path)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
        .ok_or_else(|| TlsError::MissingKey(key_path.to_path_buf()))?;

    let signing_key = any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs?, signing_key))
}

/// Resolver serving one fixed certificate for every host.
#[derive(Debug)]
pub struct StaticResolver(Arc<CertifiedKey>);

impl StaticResolver {
    pub fn new(certified: CertifiedKey) -> Self {
        Self(Arc::new(certified))
    }
}

impl ResolvesServerCert for StaticResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// SNI certificate resolver with a disk cache and background issuance.
pub struct OnDemandResolver {
    cache_dir: PathBuf,
    policy: Arc<dyn HostPolicy>,
    loaded: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    issue_tx: mpsc::Sender<String>,
}

impl OnDemandResolver {
    /// Creates the resolver and spawns its issuance worker.
    pub fn new(
        ctx: &CancellationToken,
        cache_dir: impl Into<PathBuf>,
        policy: Arc<dyn HostPolicy>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Arc<Self> {
        let (issue_tx, mut issue_rx) = mpsc::channel::<String>(64);
        let resolver = Arc::new(Self {
            cache_dir: cache_dir.into(),
            policy,
            loaded: RwLock::new(HashMap::new()),
            issue_tx,
        });

        let worker = Arc::clone(&resolver);
        let token = ctx.clone();
        tokio::spawn(async move {
            loop {
                let host = tokio::select! {
                    _ = token.cancelled() => break,
                    host = issue_rx.recv() => match host {
                        Some(host) => host,
                        None => break,
                    },
                };
                if worker.cached(&host).is_some() {
                    continue;
                }
                match worker.issue_into_cache(issuer.as_ref(), &host).await {
                    Ok(()) => info!(host = %host, "certificate issued and cached"),
                    Err(error) => {
                        warn!(host = %host, error = %error, "certificate issuance failed");
                    }
                }
            }
        });

        resolver
    }

    async fn issue_into_cache(
        &self,
        issuer: &dyn CertificateIssuer,
        host: &str,
    ) -> Result<(), BoxError> {
        let (cert_pem, key_pem) = issuer.issue(host).await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let (cert_path, key_path) = self.cache_paths(host);
        tokio::fs::write(&cert_path, cert_pem).await?;
        tokio::fs::write(&key_path, key_pem).await?;
        self.load_from_disk(host)
            .ok_or("issued certificate unreadable")?;
        Ok(())
    }

    fn cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.loaded
            .read()
            .expect("certificate cache lock")
            .get(host)
            .cloned()
    }

    fn cache_paths(&self, host: &str) -> (PathBuf, PathBuf) {
        (
            self.cache_dir.join(format!("{host}.crt")),
            self.cache_dir.join(format!("{host}.key")),
        )
    }

    fn load_from_disk(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let (cert_path, key_path) = self.cache_paths(host);
        if !cert_path.is_file() || !key_path.is_file() {
            return None;
        }
        match load_certified_key(&cert_path, &key_path) {
            Ok(key) => {
                let key = Arc::new(key);
                self.loaded
                    .write()
                    .expect("certificate cache lock")
                    .insert(host.to_string(), Arc::clone(&key));
                Some(key)
            }
            Err(error) => {
                warn!(host = %host, error = %error, "cached certificate unreadable");
                None
            }
        }
    }

    /// Resolution step shared by the rustls hook and tests.
    fn resolve_host(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if !self.policy.allows(host) {
            debug!(host = %host, "SNI host rejected by policy");
            return None;
        }
        if let Some(key) = self.cached(host) {
            return Some(key);
        }
        if let Some(key) = self.load_from_disk(host) {
            return Some(key);
        }
        // First contact for this host: schedule issuance and fail this
        // handshake; the next one finds the cached certificate.
        if self.issue_tx.try_send(host.to_string()).is_ok() {
            info!(host = %host, "certificate issuance scheduled");
        }
        None
    }
}

impl fmt::Debug for OnDemandResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDemandResolver")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl ResolvesServerCert for OnDemandResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?.to_string();
        self.resolve_host(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct AllowList(HashSet<String>);

    impl HostPolicy for AllowList {
        fn allows(&self, host: &str) -> bool {
            self.0.contains(host)
        }
    }

    fn allow(hosts: &[&str]) -> Arc<dyn HostPolicy> {
        Arc::new(AllowList(hosts.iter().map(|h| h.to_string()).collect()))
    }

    #[tokio::test]
    async fn test_self_signed_issuer_output_loads() {
        let issuer = SelfSignedIssuer;
        let (cert_pem, key_pem) = issuer.issue("a.example").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("a.example.crt");
        let key_path = dir.path().join("a.example.key");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();
        assert!(load_certified_key(&cert_path, &key_path).is_ok());
    }

    #[tokio::test]
    async fn test_rejected_host_writes_nothing() {
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let resolver = OnDemandResolver::new(
            &ctx,
            dir.path(),
            allow(&["a.example"]),
            Arc::new(SelfSignedIssuer),
        );

        assert!(resolver.resolve_host("b.example").is_none());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        // The policy rejection must keep the cache untouched.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_allowed_host_is_issued_eventually() {
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let resolver = OnDemandResolver::new(
            &ctx,
            dir.path(),
            allow(&["a.example"]),
            Arc::new(SelfSignedIssuer),
        );

        // Cold cache: the first resolution fails but schedules issuance.
        assert!(resolver.resolve_host("a.example").is_none());
        for _ in 0..50 {
            if resolver.resolve_host("a.example").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(resolver.resolve_host("a.example").is_some());
        assert!(dir.path().join("a.example.crt").is_file());
        assert!(dir.path().join("a.example.key").is_file());
        ctx.cancel();
    }
}
