//! Routing engine.
//!
//! The [`Router`] is the HTTP(S) front door: it maps routing keys to
//! [`RouteRecord`]s and proxies requests to workload upstreams. A small
//! sync daemon keeps the table aligned with the service registry, so
//! workloads only ever talk to the registry.

mod auth;
mod proxy;
mod resolvers;
mod router;
mod server;
mod tls;

pub use auth::{AuthFailure, JwtVerifier, USER_HEADER};
pub use proxy::{AddressResolver, UpstreamProxy};
pub use resolvers::{ByDomain, ByPath, RequestResolver};
pub use router::Router;
pub use server::{serve_auto_tls, serve_http, serve_tls, ServeError};
pub use tls::{CertificateIssuer, HostPolicy, SelfSignedIssuer, TlsError};

use std::sync::Arc;

use tracing::debug;

use crate::core::{func_daemon, Daemon, RegistryEvent};

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    /// Unique fully-qualified routing key.
    pub domain: String,
    /// `host:port` upstreams; several for scaled workloads.
    pub addresses: Vec<String>,
    /// Owning namespace; used for authorisation, not for routing.
    pub group: String,
}

/// Daemon mirroring the registry into the routing table.
///
/// Subscribes with replay so a freshly started router converges on the
/// full service set, then rebuilds the table on every registry event.
pub fn registry_sync_daemon(router: Arc<Router>, buffer: usize) -> impl Daemon {
    func_daemon(move |ctx, env| {
        let router = Arc::clone(&router);
        async move {
            let registry = env.global().registry();
            let mut events = registry.subscribe(buffer, true);
            env.ready().await;

            loop {
                let event = tokio::select! {
                    _ = ctx.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                debug!(
                    service = %event.service.label(),
                    registered = matches!(event.event, RegistryEvent::Registered),
                    "routing table refresh"
                );
                let records = registry
                    .all()
                    .into_iter()
                    .map(|service| RouteRecord {
                        domain: service.domain.clone().unwrap_or_default(),
                        addresses: service.addresses,
                        group: service.namespace,
                    })
                    .collect();
                router.set(records);
            }
            Ok(())
        }
    })
}

/// Host policy backed by the routing table.
///
/// In path-routing mode the root domain itself is also allowed, since
/// every route lives under it.
pub struct RouterHostPolicy {
    router: Arc<Router>,
    root_domain: Option<String>,
}

impl RouterHostPolicy {
    pub fn new(router: Arc<Router>, root_domain: Option<String>) -> Self {
        Self {
            router,
            root_domain,
        }
    }
}

impl HostPolicy for RouterHostPolicy {
    fn allows(&self, host: &str) -> bool {
        if self
            .root_domain
            .as_deref()
            .is_some_and(|root| root == host)
        {
            return true;
        }
        self.router.has_domain(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn empty_router() -> Arc<Router> {
        Router::new(
            CancellationToken::new(),
            Box::new(ByDomain::new("")),
            None,
            UpstreamProxy::new(None),
            false,
        )
    }

    #[test]
    fn test_host_policy_follows_table() {
        let router = empty_router();
        router.set(vec![RouteRecord {
            domain: "a.example".to_string(),
            addresses: vec!["10.0.0.1:80".to_string()],
            group: "a".to_string(),
        }]);

        let policy = RouterHostPolicy::new(Arc::clone(&router), None);
        assert!(policy.allows("a.example"));
        assert!(!policy.allows("b.example"));
    }

    #[test]
    fn test_host_policy_allows_root_in_path_mode() {
        let policy = RouterHostPolicy::new(empty_router(), Some("example.com".to_string()));
        assert!(policy.allows("example.com"));
        assert!(!policy.allows("other.com"));
    }
}
