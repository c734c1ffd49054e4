//! Shared container network fabric.
//!
//! Every workload joins one named network so the routing engine can reach
//! its upstreams. When the supervisor itself runs inside a container it
//! joins too and uses in-network addresses directly; otherwise addresses
//! are resolved to externally routable IPs by inspecting the network.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runtime::{ContainerRuntime, NetworkInfo, RuntimeError};

/// Errors from network fabric operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The container has no alias on the shared network.
    #[error("alias not assigned for the container")]
    NotAssigned,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Handle to the shared network.
pub struct DockerNetwork {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    name: String,
    self_id: Option<String>,
    cache: RwLock<Option<NetworkInfo>>,
}

impl DockerNetwork {
    /// Ensures the named network exists and, when running inside the
    /// engine, joins the supervisor's own container to it.
    pub async fn new(
        ctx: &CancellationToken,
        runtime: Arc<dyn ContainerRuntime>,
        name: impl Into<String>,
    ) -> Result<Self, NetworkError> {
        Self::with_self_id(ctx, runtime, name, detect_own_container_id()).await
    }

    /// Like [`DockerNetwork::new`] with an explicit own-container id
    /// instead of auto-detection.
    pub async fn with_self_id(
        ctx: &CancellationToken,
        runtime: Arc<dyn ContainerRuntime>,
        name: impl Into<String>,
        self_id: Option<String>,
    ) -> Result<Self, NetworkError> {
        let name = name.into();
        let id = runtime.ensure_network(ctx, &name).await?;
        let network = Self {
            runtime,
            id,
            name,
            self_id,
            cache: RwLock::new(None),
        };
        if let Some(self_id) = network.self_id.clone() {
            network.join(ctx, &self_id).await?;
        }
        Ok(network)
    }

    /// Network id as reported by the engine.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attaches a container, returning its in-network alias. Idempotent:
    /// an already-attached container returns its existing alias.
    pub async fn join(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
    ) -> Result<String, NetworkError> {
        match self.alias_of(ctx, container_id).await {
            Ok(alias) => return Ok(alias),
            Err(NetworkError::NotAssigned) => {}
            Err(error) => return Err(error),
        }

        self.runtime
            .connect_network(ctx, &self.name, container_id)
            .await?;
        self.invalidate().await;
        debug!(container = container_id, network = %self.name, "container joined network");
        self.alias_of(ctx, container_id).await
    }

    /// Detaches a container; idempotent.
    pub async fn leave(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
    ) -> Result<(), NetworkError> {
        let result = self
            .runtime
            .disconnect_network(ctx, &self.name, container_id)
            .await;
        self.invalidate().await;
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Maps `host[:port]` to an address usable from the current process.
    ///
    /// Inside the network the address passes through unchanged; outside,
    /// the in-network alias or short id is replaced with the container's
    /// routable IP.
    pub async fn resolve(
        &self,
        ctx: &CancellationToken,
        address: &str,
    ) -> Result<String, NetworkError> {
        if self.self_id.is_some() {
            return Ok(address.to_string());
        }

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        };

        let info = self.network(ctx).await?;
        for container in &info.containers {
            let Some(ip) = &container.ipv4 else { continue };
            if container.id.starts_with(host) || container.name == host {
                return Ok(match port {
                    Some(port) => format!("{ip}:{port}"),
                    None => ip.clone(),
                });
            }
        }
        Err(NetworkError::NotAssigned)
    }

    async fn alias_of(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
    ) -> Result<String, NetworkError> {
        let networks = self.runtime.container_networks(ctx, container_id).await?;
        networks
            .get(&self.name)
            .and_then(|endpoint| endpoint.aliases.first().cloned())
            .ok_or(NetworkError::NotAssigned)
    }

    async fn network(&self, ctx: &CancellationToken) -> Result<NetworkInfo, NetworkError> {
        if let Some(info) = self.cache.read().await.as_ref() {
            return Ok(info.clone());
        }
        let mut cache = self.cache.write().await;
        if let Some(info) = cache.as_ref() {
            return Ok(info.clone());
        }
        let info = self.runtime.inspect_network(ctx, &self.name).await?;
        *cache = Some(info.clone());
        Ok(info)
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

/// Reads the id of the container this process runs in, if any.
fn detect_own_container_id() -> Option<String> {
    let content = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    parse_container_id(&content)
}

fn parse_container_id(cgroup: &str) -> Option<String> {
    cgroup
        .lines()
        .flat_map(|line| line.split('/'))
        .map(|segment| segment.trim_end_matches(".scope"))
        .map(|segment| segment.strip_prefix("docker-").unwrap_or(segment))
        .find(|segment| {
            segment.len() == 64 && segment.chars().all(|c| c.is_ascii_hexdigit())
        })
        .map(str::to_string)
}
