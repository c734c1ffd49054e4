//! Single-container packaging driver.
//!
//! A working tree with a `Dockerfile` becomes one container. Every
//! declared volume path is backed by a single named volume (named after
//! the daemon) so the whole workload state travels as one archive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    group_labels, merge_workload_env, primary_port, wait_healthy, ErrorList, GROUP_LABEL,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use crate::core::{Daemon, DaemonEnvironment, Service};
use crate::runtime::{ContainerSpec, ImageInfo, VolumeMount};
use crate::BoxError;

/// Daemon running one container built from a `Dockerfile`.
pub struct DockerPack {
    directory: PathBuf,
    env: HashMap<String, String>,

    image: Option<ImageInfo>,
    container_id: Option<String>,
    address: Option<String>,
    services: Vec<Service>,
}

impl DockerPack {
    pub fn new(directory: PathBuf, env: HashMap<String, String>) -> Self {
        Self {
            directory,
            env,
            image: None,
            container_id: None,
            address: None,
            services: Vec::new(),
        }
    }

    /// Volume set archived for this workload.
    fn backup_volumes(&self, daemon: &str) -> Vec<String> {
        match &self.image {
            Some(image) if !image.volumes.is_empty() => vec![daemon.to_string()],
            _ => Vec::new(),
        }
    }

    fn exposed_services(&self, namespace: &str) -> Vec<Service> {
        let Some(image) = &self.image else {
            return Vec::new();
        };
        let Some(address) = &self.address else {
            return Vec::new();
        };

        let mut services = Vec::new();
        for port in &image.exposed_ports {
            services.push(Service {
                namespace: namespace.to_string(),
                name: port.to_string(),
                domain: None,
                addresses: vec![format!("{address}:{port}")],
            });
        }
        if let Some(primary) = primary_port(&image.exposed_ports) {
            services.push(Service {
                namespace: namespace.to_string(),
                name: String::new(),
                domain: Some(namespace.to_string()),
                addresses: vec![format!("{address}:{primary}")],
            });
        }
        services
    }

    async fn cleanup_containers(
        &self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
        errors: &mut ErrorList,
    ) {
        let runtime = env.global().runtime();
        let filters = [
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (GROUP_LABEL.to_string(), env.name().to_string()),
        ];
        match runtime.list_containers(ctx, &filters, true).await {
            Ok(stale) => {
                for container in stale {
                    if let Err(error) = runtime.remove_container(ctx, &container.id).await {
                        errors.push("remove container", error);
                    }
                }
            }
            Err(error) => errors.push("list containers", error),
        }
    }

    fn unregister_services(&self, env: &DaemonEnvironment) {
        let registry = env.global().registry();
        for service in &self.services {
            registry.unregister(&service.namespace, &service.name);
        }
    }
}

#[async_trait]
impl Daemon for DockerPack {
    async fn create(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        let name = env.name().to_string();
        let global = env.global();

        let mut stale = ErrorList::default();
        self.cleanup_containers(ctx, env, &mut stale).await;
        stale.into_result()?;

        let workload_env = merge_workload_env(&self.directory, &self.env)?;
        let image = global
            .runtime()
            .build_image(ctx, &self.directory, &workload_env)
            .await?;
        debug!(
            image = %image.id,
            ports = ?image.exposed_ports,
            volumes = ?image.volumes,
            "workload image ready"
        );
        self.image = Some(image.clone());

        let volumes = self.backup_volumes(&name);
        if !volumes.is_empty() {
            global.storage().restore(ctx, &name, &volumes).await?;
        }

        let mounts = image
            .volumes
            .iter()
            .map(|path| VolumeMount {
                source: name.clone(),
                target: path.clone(),
            })
            .collect();
        let container_id = global
            .runtime()
            .create_container(
                ctx,
                ContainerSpec {
                    image: image.id.clone(),
                    env: workload_env.into_iter().collect(),
                    labels: group_labels(&name),
                    volume_mounts: mounts,
                    restart_on_failure: true,
                },
            )
            .await?;
        self.container_id = Some(container_id.clone());

        let address = global.network().join(ctx, &container_id).await?;
        self.address = Some(address);

        self.services = self.exposed_services(&name);
        Ok(())
    }

    async fn run(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        let name = env.name().to_string();
        let global = env.global();
        let container_id = self
            .container_id
            .clone()
            .ok_or("container was not created")?;

        global.runtime().start_container(ctx, &container_id).await?;

        if self.image.as_ref().is_some_and(|image| image.has_healthcheck) {
            wait_healthy(ctx, global.runtime().as_ref(), &container_id).await?;
        }

        for service in &self.services {
            global
                .registry()
                .register(service.clone())
                .map_err(|error| format!("register service {}: {error}", service.label()))?;
        }
        env.ready().await;

        let volumes = self.backup_volumes(&name);
        let backups = (!volumes.is_empty())
            .then(|| global.storage().schedule(ctx, name.clone(), volumes));

        ctx.cancelled().await;
        if let Some(task) = backups {
            let _ = task.stop().await;
        }
        self.unregister_services(env);
        Ok(())
    }

    async fn remove(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        self.unregister_services(env);
        let global = env.global();
        let mut errors = ErrorList::default();

        if let Some(container_id) = self.container_id.take() {
            if let Err(error) = global
                .runtime()
                .stop_container(ctx, &container_id, Duration::from_secs(10))
                .await
            {
                if !error.is_not_found() {
                    errors.push("stop container", error);
                }
            }
            if let Err(error) = global.network().leave(ctx, &container_id).await {
                errors.push("leave network", error);
            }
        }

        self.cleanup_containers(ctx, env, &mut errors).await;
        self.services.clear();
        errors.into_result()
    }
}
