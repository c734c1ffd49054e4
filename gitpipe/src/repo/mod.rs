//! Per-repository deployment supervisor.
//!
//! One [`PollerDaemon`] per configured remote. Each tick polls the
//! source, and when the head moved (or the previous attempt failed)
//! tears down the old packaging daemon, detects the packaging convention
//! in the working tree and launches the new one under the repository's
//! canonical name.

mod naming;

pub use naming::canonical_name;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{
    wait_for_launcher_event, Daemon, DaemonEnvironment, Descriptor, LauncherEvent,
    LauncherEventStream,
};
use crate::packs::{ComposePack, DockerPack};
use crate::remote::Source;
use crate::BoxError;

/// Buffer used for the launcher event subscription of each poller.
const EVENT_BUFFER: usize = 1024;

const COMPOSE_MANIFESTS: [&str; 2] = ["docker-compose.yaml", "docker-compose.yml"];
const DOCKER_MANIFEST: &str = "Dockerfile";

/// Errors terminal for a single deployment attempt.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The working tree contains no supported manifest.
    #[error("unknown packaging for repo")]
    UnknownPackaging,
}

/// Configuration for one repository poller.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between repository polls.
    pub poll_interval: Duration,
    /// Use long-form (FQDN) repository naming.
    pub fqdn: bool,
    /// Root directory holding one working tree per repository.
    pub work_dir: PathBuf,
    /// Variables forwarded to the workload.
    pub env: HashMap<String, String>,
}

/// Daemon polling one repository and (re)deploying its workload.
pub struct PollerDaemon {
    source: Arc<dyn Source>,
    config: PollConfig,
    name: String,
    base_dir: PathBuf,
    force: bool,
    deployed: bool,
}

impl PollerDaemon {
    pub fn new(source: Arc<dyn Source>, config: PollConfig) -> Self {
        let name = canonical_name(source.ref_url(), config.fqdn);
        let base_dir = config.work_dir.join(&name);
        Self {
            source,
            config,
            name,
            base_dir,
            force: true,
            deployed: false,
        }
    }

    /// Canonical repository name; doubles as the packaging daemon name.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn tick(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let changed = self.source.poll(ctx, &self.base_dir).await?;
        if !changed && !self.force {
            return Ok(());
        }
        self.force = true;

        let launcher = env.global().launcher();
        let mut updates = launcher.subscribe(ctx, EVENT_BUFFER, false).await?;
        let result = self.deploy(ctx, env, &mut updates).await;
        let _ = launcher.unsubscribe(ctx, updates).await;
        result
    }

    async fn deploy(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
        updates: &mut LauncherEventStream,
    ) -> Result<(), BoxError> {
        let launcher = env.global().launcher();

        if self.deployed {
            launcher.remove(ctx, &self.name).await?;
            wait_for_launcher_event(
                ctx,
                updates,
                &self.name,
                LauncherEvent::Removed | LauncherEvent::RemoveFailed,
            )
            .await;
            self.deployed = false;
        }

        let daemon = self.detect_packaging()?;
        launcher
            .launch(
                ctx,
                Descriptor {
                    name: self.name.clone(),
                    daemon,
                },
            )
            .await?;
        self.deployed = true;

        let outcome = wait_for_launcher_event(
            ctx,
            updates,
            &self.name,
            LauncherEvent::Ready | LauncherEvent::RunFailed | LauncherEvent::CreateFailed,
        )
        .await;
        match outcome {
            Some(message) if message.event == LauncherEvent::Ready => {
                info!(repo = %self.name, "deployment ready");
                self.force = false;
                env.ready().await;
            }
            Some(message) => {
                warn!(repo = %self.name, event = %message.event, "deployment failed, will retry");
                self.force = true;
            }
            None => {}
        }
        Ok(())
    }

    fn detect_packaging(&self) -> Result<Box<dyn Daemon>, RepoError> {
        if has_any_file(&self.base_dir, &COMPOSE_MANIFESTS) {
            return Ok(Box::new(ComposePack::new(
                self.base_dir.clone(),
                self.config.env.clone(),
            )));
        }
        if has_any_file(&self.base_dir, &[DOCKER_MANIFEST]) {
            return Ok(Box::new(DockerPack::new(
                self.base_dir.clone(),
                self.config.env.clone(),
            )));
        }
        Err(RepoError::UnknownPackaging)
    }
}

#[async_trait]
impl Daemon for PollerDaemon {
    async fn create(
        &mut self,
        _ctx: &CancellationToken,
        _env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    async fn run(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        loop {
            if let Err(error) = self.tick(ctx, env).await {
                // Configuration problems are terminal for this attempt;
                // transient ones wait for the next poll.
                if error.downcast_ref::<RepoError>().is_some() {
                    return Err(error);
                }
                warn!(repo = %self.name, error = %error, "deployment attempt failed");
            }
            tokio::select! {
                biased;

                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn remove(
        &mut self,
        _ctx: &CancellationToken,
        _env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

fn has_any_file(root: &Path, names: &[&str]) -> bool {
    names.iter().any(|name| root.join(name).is_file())
}
