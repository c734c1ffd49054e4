//! DNS record publication.
//!
//! Newly registered services get an A-record pointing at this host. The
//! provider is consumed behind [`DnsProvider`]; the bridge daemon wires
//! it to registry events.

mod cloudflare;

pub use cloudflare::{Cloudflare, CloudflareConfig};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::{func_daemon, Daemon, RegistryEvent};

/// Errors from DNS providers.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("dns zone not found for {0}")]
    ZoneNotFound(String),

    #[error("dns provider rejected the request: {0}")]
    Api(String),
}

/// Idempotent A-record upsert.
#[async_trait]
pub trait DnsProvider: Send + Sync + 'static {
    async fn register(
        &self,
        ctx: &CancellationToken,
        domains: &[String],
    ) -> Result<(), DnsError>;
}

/// Daemon publishing every registered service's domain.
///
/// Subscribes with replay so services deployed before the bridge came
/// up are published too. Provider failures are logged and the stream
/// continues.
pub fn bridge_daemon(provider: Arc<dyn DnsProvider>, buffer: usize) -> impl Daemon {
    func_daemon(move |ctx, env| {
        let provider = Arc::clone(&provider);
        async move {
            let mut events = env.global().registry().subscribe(buffer, true);
            env.ready().await;

            loop {
                let event = tokio::select! {
                    _ = ctx.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if event.event != RegistryEvent::Registered {
                    continue;
                }
                let Some(domain) = event.service.domain.clone() else {
                    continue;
                };
                debug!(domain = %domain, "publishing dns record");
                if let Err(failure) = provider.register(&ctx, &[domain.clone()]).await {
                    error!(domain = %domain, error = %failure, "dns registration failed");
                }
            }
            Ok(())
        }
    })
}
