//! HTTP(S) server front ends.
//!
//! Three serving modes share one axum application: plain HTTP, static
//! TLS from `server.{crt,key}`, and on-demand TLS on :443 with the SNI
//! resolver deciding per host. All of them shut down when the context
//! is cancelled.

use std::path::Path;
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tls::{
    load_certified_key, CertificateIssuer, HostPolicy, OnDemandResolver, StaticResolver, TlsError,
};

/// Port used by the on-demand TLS listener.
const AUTO_TLS_BIND: &str = "0.0.0.0:443";

/// Errors from the server front ends.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("listener: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("tls configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Serves plain HTTP until the context is cancelled.
pub async fn serve_http(
    ctx: &CancellationToken,
    bind: &str,
    app: axum::Router,
) -> Result<(), ServeError> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind, "http server listening");
    let token = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

/// Serves HTTPS with a static certificate pair from `ssl_dir`.
pub async fn serve_tls(
    ctx: &CancellationToken,
    bind: &str,
    ssl_dir: &Path,
    app: axum::Router,
) -> Result<(), ServeError> {
    let certified = load_certified_key(&ssl_dir.join("server.crt"), &ssl_dir.join("server.key"))?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(StaticResolver::new(certified)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    serve_rustls(ctx, bind, Arc::new(config), app).await
}

/// Serves HTTPS on :443, resolving certificates per SNI host.
pub async fn serve_auto_tls(
    ctx: &CancellationToken,
    ssl_dir: &Path,
    policy: Arc<dyn HostPolicy>,
    issuer: Arc<dyn CertificateIssuer>,
    app: axum::Router,
) -> Result<(), ServeError> {
    let resolver = OnDemandResolver::new(ctx, ssl_dir, policy, issuer);
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    serve_rustls(ctx, AUTO_TLS_BIND, Arc::new(config), app).await
}

async fn serve_rustls(
    ctx: &CancellationToken,
    bind: &str,
    config: Arc<rustls::ServerConfig>,
    app: axum::Router,
) -> Result<(), ServeError> {
    let listener = TcpListener::bind(bind).await?;
    let acceptor = TlsAcceptor::from(config);
    info!(bind, "https server listening");

    loop {
        let (stream, peer) = tokio::select! {
            biased;

            _ = ctx.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(error) => {
                    debug!(peer = %peer, error = %error, "tls handshake failed");
                    return;
                }
            };
            let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await;
            if let Err(error) = result {
                debug!(peer = %peer, error = %error, "connection ended with error");
            }
        });
    }
    Ok(())
}
