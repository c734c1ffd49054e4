//! Packaging drivers.
//!
//! Both drivers implement the daemon contract: build the workload from
//! the working tree, restore volumes, start containers on the shared
//! network, publish services and snapshot volumes on a schedule. The
//! packaging convention is detected by the repo supervisor.

mod compose;
mod docker;
mod manifest;

pub use compose::ComposePack;
pub use docker::DockerPack;
pub use manifest::{ComposeFile, ComposeService, PortEntry, VolumeEntry};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::env_file::read_env_file;
use crate::runtime::{ContainerRuntime, HealthStatus};
use crate::BoxError;

/// Ports answering the bare-namespace domain, in preference order.
pub const PORT_PRIORITY: [u16; 2] = [80, 8080];

/// Service names answering the bare-namespace domain, in preference
/// order, when no service carries the root flag.
pub const ROOT_NAME_PRIORITY: [&str; 3] = ["www", "web", "gateway"];

/// Label marking containers owned by the pipeline.
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "git-pipe";
/// Label carrying the owning daemon name.
pub const GROUP_LABEL: &str = "group";

/// Interval between health-state polls while waiting for a container.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Picks the port answering the bare domain: first match in the
/// priority list, else the first declared port.
pub fn primary_port(ports: &[u16]) -> Option<u16> {
    PORT_PRIORITY
        .iter()
        .copied()
        .find(|candidate| ports.contains(candidate))
        .or_else(|| ports.first().copied())
}

/// Merges the workload environment: the repository `.env` file first,
/// overridden by caller-supplied variables. The system environment is
/// never overlaid at this layer.
pub(crate) fn merge_workload_env(
    repo_root: &Path,
    caller: &HashMap<String, String>,
) -> std::io::Result<HashMap<String, String>> {
    let mut merged = match read_env_file(repo_root.join(".env")) {
        Ok(vars) => vars,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(error) => return Err(error),
    };
    merged.extend(caller.clone());
    Ok(merged)
}

/// Labels identifying the containers of one daemon.
pub(crate) fn group_labels(daemon: &str) -> Vec<(String, String)> {
    vec![
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (GROUP_LABEL.to_string(), daemon.to_string()),
    ]
}

/// Waits until the container reports healthy.
///
/// Containers without a health-check pass immediately; an unhealthy
/// report is fatal for the attempt.
pub(crate) async fn wait_healthy(
    ctx: &CancellationToken,
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> Result<(), BoxError> {
    loop {
        match runtime.container_health(ctx, container_id).await? {
            None | Some(HealthStatus::Healthy) => return Ok(()),
            Some(HealthStatus::Unhealthy) => {
                return Err(format!("container {container_id} is unhealthy").into());
            }
            Some(HealthStatus::Starting) => {}
        }
        tokio::select! {
            biased;

            _ = ctx.cancelled() => return Err("health wait cancelled".into()),
            _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
        }
    }
}

/// Collects teardown errors so every step runs before reporting.
#[derive(Debug, Default)]
pub(crate) struct ErrorList {
    errors: Vec<String>,
}

impl ErrorList {
    pub fn push(&mut self, context: &str, error: impl std::fmt::Display) {
        self.errors.push(format!("{context}: {error}"));
    }

    pub fn into_result(self) -> Result<(), BoxError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.join("; ").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_port_prefers_http() {
        assert_eq!(primary_port(&[9000, 8080, 80]), Some(80));
        assert_eq!(primary_port(&[9000, 8080]), Some(8080));
        assert_eq!(primary_port(&[9000, 3000]), Some(9000));
        assert_eq!(primary_port(&[]), None);
    }

    #[test]
    fn test_merge_env_caller_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "SHARED=file\nFILE_ONLY=1\n").unwrap();

        let mut caller = HashMap::new();
        caller.insert("SHARED".to_string(), "caller".to_string());
        let merged = merge_workload_env(dir.path(), &caller).unwrap();
        assert_eq!(merged["SHARED"], "caller");
        assert_eq!(merged["FILE_ONLY"], "1");
    }

    #[test]
    fn test_merge_env_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let merged = merge_workload_env(dir.path(), &HashMap::new()).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn test_error_list_aggregates() {
        let mut errors = ErrorList::default();
        assert!(errors.into_result().is_ok());

        let mut errors = ErrorList::default();
        errors.push("stop container", "gone");
        errors.push("leave network", "also gone");
        let failure = errors.into_result().unwrap_err().to_string();
        assert!(failure.contains("stop container: gone"));
        assert!(failure.contains("leave network: also gone"));
    }
}
