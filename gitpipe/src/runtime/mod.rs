//! Container runtime abstraction.
//!
//! The pipeline consumes the local container engine through the
//! [`ContainerRuntime`] trait so that drivers, the network fabric and the
//! backup pipeline can be exercised against a mock. The shipped
//! implementation, [`DockerCli`], drives the `docker` binary.

mod docker_cli;

pub use docker_cli::DockerCli;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command::CommandError;

/// Errors from runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The referenced object does not exist.
    #[error("no such object: {0}")]
    NotFound(String),

    /// The engine rejected or failed the operation.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Engine output could not be understood.
    #[error("parse {what}: {source}")]
    Parse {
        what: &'static str,
        source: serde_json::Error,
    },
}

impl RuntimeError {
    /// True when the error means the object is absent rather than broken.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Command(CommandError::Failed { stderr, .. }) => {
                stderr.contains("No such") || stderr.contains("not found")
            }
            _ => false,
        }
    }
}

/// Image metadata the drivers need after a build.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    /// Declared TCP ports, ascending.
    pub exposed_ports: Vec<u16>,
    /// Declared volume mount paths inside the container.
    pub volumes: Vec<String>,
    /// Whether the image defines a health-check.
    pub has_healthcheck: bool,
}

/// Specification for a container to create.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub volume_mounts: Vec<VolumeMount>,
    pub restart_on_failure: bool,
}

/// Named volume bound to a path inside the container.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

/// Container listing entry.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Health-check state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Endpoint of a container on one network.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    pub aliases: Vec<String>,
    pub ip: Option<String>,
}

/// Network inspection result.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub containers: Vec<AttachedContainer>,
}

/// Container attached to an inspected network.
#[derive(Debug, Clone)]
pub struct AttachedContainer {
    pub id: String,
    pub name: String,
    pub ipv4: Option<String>,
}

/// Source side of a helper-container mount.
#[derive(Debug, Clone)]
pub enum MountSource {
    /// Named volume.
    Volume(String),
    /// File or directory on the host.
    Bind(PathBuf),
}

/// Mount for a one-shot helper container.
#[derive(Debug, Clone)]
pub struct HelperMount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

/// One-shot helper container run to completion with auto-removal.
#[derive(Debug, Clone)]
pub struct HelperRun {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<HelperMount>,
}

/// Operations the pipeline needs from the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Builds an image from `dir` and returns its metadata. The build log
    /// is streamed at debug level.
    async fn build_image(
        &self,
        ctx: &CancellationToken,
        dir: &std::path::Path,
        env: &HashMap<String, String>,
    ) -> Result<ImageInfo, RuntimeError>;

    /// Creates a container, returning its id.
    async fn create_container(
        &self,
        ctx: &CancellationToken,
        spec: ContainerSpec,
    ) -> Result<String, RuntimeError>;

    async fn start_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError>;

    async fn stop_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError>;

    /// Force-removes a container.
    async fn remove_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError>;

    /// Lists containers matching all given `label=value` filters.
    async fn list_containers(
        &self,
        ctx: &CancellationToken,
        label_filters: &[(String, String)],
        all: bool,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Health-check state, `None` when the image defines none.
    async fn container_health(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<Option<HealthStatus>, RuntimeError>;

    /// Networks the container is attached to, keyed by network name.
    async fn container_networks(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<HashMap<String, EndpointInfo>, RuntimeError>;

    /// Returns the id of the named network, creating it when absent.
    async fn ensure_network(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<String, RuntimeError>;

    async fn connect_network(
        &self,
        ctx: &CancellationToken,
        network: &str,
        container: &str,
    ) -> Result<(), RuntimeError>;

    async fn disconnect_network(
        &self,
        ctx: &CancellationToken,
        network: &str,
        container: &str,
    ) -> Result<(), RuntimeError>;

    async fn inspect_network(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<NetworkInfo, RuntimeError>;

    /// Creates the named volume when it does not exist yet.
    async fn ensure_volume(
        &self,
        ctx: &CancellationToken,
        name: &str,
        driver: &str,
    ) -> Result<(), RuntimeError>;

    /// Runs a helper container to completion and removes it.
    async fn run_helper(
        &self,
        ctx: &CancellationToken,
        run: HelperRun,
    ) -> Result<(), RuntimeError>;

    /// `compose build` with the manifest fed on stdin.
    async fn compose_build(
        &self,
        ctx: &CancellationToken,
        dir: &std::path::Path,
        project: &str,
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    /// `compose up -d` with the manifest fed on stdin.
    async fn compose_up(
        &self,
        ctx: &CancellationToken,
        dir: &std::path::Path,
        project: &str,
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    /// `compose stop` with the manifest fed on stdin.
    async fn compose_stop(
        &self,
        ctx: &CancellationToken,
        dir: &std::path::Path,
        project: &str,
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;
}
