//! Container runtime backed by the `docker` binary.
//!
//! Inspection output is consumed as JSON. Build and compose invocations
//! stream their progress to the log at debug level; everything else
//! captures output and attaches it to failures.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    AttachedContainer, ContainerRuntime, ContainerSpec, ContainerSummary, EndpointInfo,
    HealthStatus, HelperMount, HelperRun, ImageInfo, MountSource, NetworkInfo, RuntimeError,
};
use crate::command::in_dir;

/// Runtime client invoking the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn docker(
        &self,
        ctx: &CancellationToken,
        args: Vec<String>,
    ) -> Result<String, RuntimeError> {
        Ok(in_dir(".").run("docker", args).output(ctx).await?)
    }

    async fn compose(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
        project: &str,
        action: &[&str],
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            "-".to_string(),
            "-p".to_string(),
            project.to_string(),
        ];
        args.extend(action.iter().map(|arg| arg.to_string()));
        in_dir(dir)
            .run("docker", args)
            .stdin(manifest.as_bytes().to_vec())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stream_stderr()
            .exec(ctx)
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ImageInspect {
    #[serde(rename = "Config")]
    config: ImageConfig,
}

#[derive(Deserialize, Default)]
struct ImageConfig {
    #[serde(rename = "ExposedPorts", default)]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "Volumes", default)]
    volumes: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "Healthcheck", default)]
    healthcheck: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerStateJson,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettingsJson,
}

#[derive(Deserialize)]
struct ContainerStateJson {
    #[serde(rename = "Health", default)]
    health: Option<HealthJson>,
}

#[derive(Deserialize)]
struct HealthJson {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Deserialize, Default)]
struct NetworkSettingsJson {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, EndpointJson>,
}

#[derive(Deserialize)]
struct EndpointJson {
    #[serde(rename = "Aliases", default)]
    aliases: Option<Vec<String>>,
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Deserialize)]
struct NetworkInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Containers", default)]
    containers: HashMap<String, NetworkContainerJson>,
}

#[derive(Deserialize)]
struct NetworkContainerJson {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_json<T: serde::de::DeserializeOwned>(
    what: &'static str,
    raw: &str,
) -> Result<T, RuntimeError> {
    serde_json::from_str(raw).map_err(|source| RuntimeError::Parse { what, source })
}

fn parse_tcp_ports(ports: &HashMap<String, serde_json::Value>) -> Vec<u16> {
    let mut declared: Vec<u16> = ports
        .keys()
        .filter_map(|key| {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            if protocol != "tcp" {
                return None;
            }
            port.parse().ok()
        })
        .collect();
    declared.sort_unstable();
    declared
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<ImageInfo, RuntimeError> {
        let id = in_dir(dir)
            .run("docker", ["build", "-q", "."])
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stream_stderr()
            .output(ctx)
            .await?;
        info!(image = %id, "image built");

        let raw = self
            .docker(
                ctx,
                vec!["image".into(), "inspect".into(), id.clone()],
            )
            .await?;
        let inspected: Vec<ImageInspect> = parse_json("image inspect", &raw)?;
        let config = inspected
            .into_iter()
            .next()
            .map(|image| image.config)
            .unwrap_or_default();

        let mut volumes: Vec<String> = config
            .volumes
            .unwrap_or_default()
            .into_keys()
            .collect();
        volumes.sort();

        Ok(ImageInfo {
            id,
            exposed_ports: parse_tcp_ports(&config.exposed_ports.unwrap_or_default()),
            volumes,
            has_healthcheck: config.healthcheck.is_some(),
        })
    }

    async fn create_container(
        &self,
        ctx: &CancellationToken,
        spec: ContainerSpec,
    ) -> Result<String, RuntimeError> {
        let mut args = vec!["create".to_string()];
        if spec.restart_on_failure {
            args.push("--restart".into());
            args.push("on-failure".into());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.volume_mounts {
            args.push("--mount".into());
            args.push(format!(
                "type=volume,source={},target={}",
                mount.source, mount.target
            ));
        }
        args.push(spec.image);
        self.docker(ctx, args).await
    }

    async fn start_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError> {
        self.docker(ctx, vec!["start".into(), id.into()]).await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        self.docker(
            ctx,
            vec![
                "stop".into(),
                "-t".into(),
                timeout.as_secs().to_string(),
                id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError> {
        self.docker(ctx, vec!["rm".into(), "-f".into(), id.into()])
            .await?;
        Ok(())
    }

    async fn list_containers(
        &self,
        ctx: &CancellationToken,
        label_filters: &[(String, String)],
        all: bool,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            "--no-trunc".to_string(),
        ];
        if all {
            args.push("-a".into());
        }
        for (key, value) in label_filters {
            args.push("--filter".into());
            args.push(format!("label={key}={value}"));
        }
        let raw = self.docker(ctx, args).await?;

        let mut containers = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let entry: PsLine = parse_json("container list", line)?;
            let labels = entry
                .labels
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect();
            containers.push(ContainerSummary {
                id: entry.id,
                name: entry.names,
                labels,
            });
        }
        Ok(containers)
    }

    async fn container_health(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<Option<HealthStatus>, RuntimeError> {
        let raw = self
            .docker(ctx, vec!["inspect".into(), id.into()])
            .await?;
        let inspected: Vec<ContainerInspect> = parse_json("container inspect", &raw)?;
        let Some(container) = inspected.into_iter().next() else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };
        Ok(container.state.health.map(|health| {
            match health.status.as_str() {
                "healthy" => HealthStatus::Healthy,
                "unhealthy" => HealthStatus::Unhealthy,
                _ => HealthStatus::Starting,
            }
        }))
    }

    async fn container_networks(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<HashMap<String, EndpointInfo>, RuntimeError> {
        let raw = self
            .docker(ctx, vec!["inspect".into(), id.into()])
            .await?;
        let inspected: Vec<ContainerInspect> = parse_json("container inspect", &raw)?;
        let Some(container) = inspected.into_iter().next() else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };
        Ok(container
            .network_settings
            .networks
            .into_iter()
            .map(|(name, endpoint)| {
                (
                    name,
                    EndpointInfo {
                        aliases: endpoint.aliases.unwrap_or_default(),
                        ip: (!endpoint.ip_address.is_empty()).then_some(endpoint.ip_address),
                    },
                )
            })
            .collect())
    }

    async fn ensure_network(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<String, RuntimeError> {
        let existing = self
            .docker(
                ctx,
                vec![
                    "network".into(),
                    "inspect".into(),
                    "--format".into(),
                    "{{.Id}}".into(),
                    name.into(),
                ],
            )
            .await;
        match existing {
            Ok(id) => return Ok(id),
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        debug!(network = name, "creating shared network");
        self.docker(ctx, vec!["network".into(), "create".into(), name.into()])
            .await
    }

    async fn connect_network(
        &self,
        ctx: &CancellationToken,
        network: &str,
        container: &str,
    ) -> Result<(), RuntimeError> {
        self.docker(
            ctx,
            vec![
                "network".into(),
                "connect".into(),
                network.into(),
                container.into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        ctx: &CancellationToken,
        network: &str,
        container: &str,
    ) -> Result<(), RuntimeError> {
        self.docker(
            ctx,
            vec![
                "network".into(),
                "disconnect".into(),
                "-f".into(),
                network.into(),
                container.into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn inspect_network(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<NetworkInfo, RuntimeError> {
        let raw = self
            .docker(ctx, vec!["network".into(), "inspect".into(), name.into()])
            .await?;
        let inspected: Vec<NetworkInspect> = parse_json("network inspect", &raw)?;
        let Some(network) = inspected.into_iter().next() else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        Ok(NetworkInfo {
            id: network.id,
            name: network.name,
            containers: network
                .containers
                .into_iter()
                .map(|(id, container)| AttachedContainer {
                    id,
                    name: container.name,
                    ipv4: container
                        .ipv4_address
                        .split('/')
                        .next()
                        .filter(|ip| !ip.is_empty())
                        .map(str::to_string),
                })
                .collect(),
        })
    }

    async fn ensure_volume(
        &self,
        ctx: &CancellationToken,
        name: &str,
        driver: &str,
    ) -> Result<(), RuntimeError> {
        let existing = self
            .docker(ctx, vec!["volume".into(), "inspect".into(), name.into()])
            .await;
        match existing {
            Ok(_) => return Ok(()),
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        self.docker(
            ctx,
            vec![
                "volume".into(),
                "create".into(),
                "--driver".into(),
                driver.into(),
                name.into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn run_helper(
        &self,
        ctx: &CancellationToken,
        run: HelperRun,
    ) -> Result<(), RuntimeError> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for mount in &run.mounts {
            args.push("--mount".into());
            args.push(render_helper_mount(mount));
        }
        args.push(run.image);
        args.extend(run.command);
        self.docker(ctx, args).await?;
        Ok(())
    }

    async fn compose_build(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
        project: &str,
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        self.compose(ctx, dir, project, &["build", "--pull"], manifest, env)
            .await
    }

    async fn compose_up(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
        project: &str,
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        self.compose(
            ctx,
            dir,
            project,
            &["up", "-d", "--remove-orphans"],
            manifest,
            env,
        )
        .await
    }

    async fn compose_stop(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
        project: &str,
        manifest: &str,
        env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        self.compose(ctx, dir, project, &["stop"], manifest, env)
            .await
    }
}

fn render_helper_mount(mount: &HelperMount) -> String {
    let mut rendered = match &mount.source {
        MountSource::Volume(volume) => {
            format!("type=volume,source={volume},target={}", mount.target)
        }
        MountSource::Bind(path) => format!(
            "type=bind,source={},target={}",
            path.display(),
            mount.target
        ),
    };
    if mount.read_only {
        rendered.push_str(",readonly");
    }
    rendered
}
