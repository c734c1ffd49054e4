//! Shared environment injected into every daemon.
//!
//! Aggregates the long-lived singletons: launcher, registry, network
//! fabric, volume storage and the runtime client. Building it is the
//! only place where an unreachable container engine is fatal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::launcher::Launcher;
use super::network::{DockerNetwork, NetworkError};
use super::registry::Registry;
use crate::backup::VolumeStorage;
use crate::runtime::ContainerRuntime;

/// Configuration of the core singletons.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Name of the shared container network.
    pub network_name: String,
    /// Delay between failed deployment attempts.
    pub retry_interval: Duration,
    /// Deadline for daemon cleanup.
    pub graceful_timeout: Duration,
    /// Directory for backup temp files; system default when `None`.
    pub temp_dir: Option<PathBuf>,
    /// Volume driver used when materialising volumes.
    pub volume_driver: String,
    /// Root domain appended to unqualified service domains.
    pub root_domain: String,
    /// Interval between volume snapshots.
    pub backup_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            network_name: "git-pipe".to_string(),
            retry_interval: Duration::from_secs(5),
            graceful_timeout: Duration::from_secs(30),
            temp_dir: None,
            volume_driver: "local".to_string(),
            root_domain: String::new(),
            backup_interval: Duration::from_secs(3600),
        }
    }
}

/// Errors constructing the environment.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The shared network could not be created or joined.
    #[error("initialize networking: {0}")]
    Network(#[from] NetworkError),
}

/// Aggregate of the shared singletons.
pub struct Environment {
    launcher: Launcher,
    registry: Registry,
    network: Arc<DockerNetwork>,
    storage: Arc<VolumeStorage>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Environment {
    /// Builds the environment, creating the shared network up-front.
    pub async fn new(
        ctx: &CancellationToken,
        config: CoreConfig,
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn crate::backup::Backend>,
        cryptor: Arc<dyn crate::cryptor::Cryptor>,
    ) -> Result<Arc<Self>, EnvironmentError> {
        let network =
            DockerNetwork::new(ctx, Arc::clone(&runtime), config.network_name.clone()).await?;
        let storage = VolumeStorage::new(
            Arc::clone(&runtime),
            backend,
            cryptor,
            config.temp_dir.clone(),
            config.volume_driver.clone(),
            config.backup_interval,
        );
        Ok(Arc::new(Self {
            launcher: Launcher::new(config.retry_interval, config.graceful_timeout),
            registry: Registry::new(config.root_domain.clone()),
            network: Arc::new(network),
            storage: Arc::new(storage),
            runtime,
        }))
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn network(&self) -> &Arc<DockerNetwork> {
        &self.network
    }

    pub fn storage(&self) -> &Arc<VolumeStorage> {
        &self.storage
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Drives the launcher loop until `ctx` is cancelled.
    pub async fn run(self: &Arc<Self>, ctx: &CancellationToken) {
        self.launcher.run(ctx, Arc::clone(self)).await;
    }

    /// Environment backed by the in-memory mock runtime.
    #[cfg(test)]
    pub(crate) async fn for_tests() -> Arc<Self> {
        use crate::backup::NoBackend;
        use crate::cryptor::PlainCryptor;
        use crate::runtime::tests::MockRuntime;

        let ctx = CancellationToken::new();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new());
        let network = DockerNetwork::with_self_id(&ctx, Arc::clone(&runtime), "git-pipe", None)
            .await
            .expect("mock network");
        let config = CoreConfig::default();
        let storage = VolumeStorage::new(
            Arc::clone(&runtime),
            Arc::new(NoBackend),
            Arc::new(PlainCryptor),
            None,
            config.volume_driver,
            config.backup_interval,
        );
        Arc::new(Self {
            launcher: Launcher::new(Duration::from_millis(50), Duration::from_secs(5)),
            registry: Registry::new(""),
            network: Arc::new(network),
            storage: Arc::new(storage),
            runtime,
        })
    }
}

/// Environment with the launcher loop running in a background task.
pub struct BackgroundEnvironment {
    environment: Arc<Environment>,
    cancel: CancellationToken,
    done: tokio::task::JoinHandle<()>,
}

impl BackgroundEnvironment {
    /// Builds the environment and spawns its supervisor loop.
    pub async fn start(
        ctx: &CancellationToken,
        config: CoreConfig,
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn crate::backup::Backend>,
        cryptor: Arc<dyn crate::cryptor::Cryptor>,
    ) -> Result<Self, EnvironmentError> {
        let environment = Environment::new(ctx, config, runtime, backend, cryptor).await?;
        let cancel = ctx.child_token();
        let run_env = Arc::clone(&environment);
        let run_ctx = cancel.clone();
        let done = tokio::spawn(async move {
            run_env.run(&run_ctx).await;
        });
        Ok(Self {
            environment,
            cancel,
            done,
        })
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// Waits for the supervisor loop to finish.
    pub async fn wait(self) {
        let _ = self.done.await;
    }

    /// Cancels the supervisor loop and waits until it has finished.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }
}
