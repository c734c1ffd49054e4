//! Multi-container packaging driver.
//!
//! A working tree with a compose manifest is deployed through the
//! compose CLI, with the manifest rewritten first: published ports are
//! neutralised, bind sources anchored, backup-eligible volumes named.
//! Containers are joined to the shared network and each service's TCP
//! ports become routable sub-domains.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manifest::{self, ComposeFile, ComposeService};
use super::{merge_workload_env, primary_port, wait_healthy, ErrorList, ROOT_NAME_PRIORITY};
use crate::core::{Daemon, DaemonEnvironment, Service};
use crate::BoxError;

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Daemon running a compose project.
pub struct ComposePack {
    directory: PathBuf,
    env: HashMap<String, String>,

    file: Option<ComposeFile>,
    rendered: String,
    workload_env: HashMap<String, String>,
    volumes: Vec<String>,
    joined: Vec<String>,
    services: Vec<Service>,
}

impl ComposePack {
    pub fn new(directory: PathBuf, env: HashMap<String, String>) -> Self {
        Self {
            directory,
            env,
            file: None,
            rendered: String::new(),
            workload_env: HashMap::new(),
            volumes: Vec::new(),
            joined: Vec::new(),
            services: Vec::new(),
        }
    }

    fn read_manifest(&self) -> Result<String, BoxError> {
        for candidate in ["docker-compose.yaml", "docker-compose.yml"] {
            match std::fs::read_to_string(self.directory.join(candidate)) {
                Ok(content) => return Ok(content),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Err("compose manifest not found".into())
    }

    /// Maps deployed containers onto manifest services.
    async fn project_containers(
        &self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<HashMap<String, Vec<String>>, BoxError> {
        let filters = [(
            COMPOSE_PROJECT_LABEL.to_string(),
            env.name().to_string(),
        )];
        let containers = env
            .global()
            .runtime()
            .list_containers(ctx, &filters, false)
            .await?;

        let mut by_service: HashMap<String, Vec<String>> = HashMap::new();
        for container in containers {
            let Some(service) = container.labels.get(COMPOSE_SERVICE_LABEL) else {
                continue;
            };
            by_service
                .entry(service.clone())
                .or_default()
                .push(container.id);
        }
        Ok(by_service)
    }

    fn unregister_services(&self, env: &DaemonEnvironment) {
        let registry = env.global().registry();
        for service in &self.services {
            registry.unregister(&service.namespace, &service.name);
        }
    }
}

#[async_trait]
impl Daemon for ComposePack {
    async fn create(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        let name = env.name().to_string();
        let global = env.global();

        self.workload_env = merge_workload_env(&self.directory, &self.env)?;

        let raw = self.read_manifest()?;
        let file: ComposeFile = serde_yaml::from_str(&raw)?;
        let root = std::path::absolute(&self.directory)?;
        let prepared = manifest::prepare(file, &name, &root);

        self.rendered = serde_yaml::to_string(&prepared.file)?;
        self.volumes = prepared.backup_volumes;
        self.file = Some(prepared.file);
        debug!(
            project = %name,
            volumes = ?self.volumes,
            "compose manifest prepared"
        );

        global
            .runtime()
            .compose_build(ctx, &self.directory, &name, &self.rendered, &self.workload_env)
            .await?;

        if !self.volumes.is_empty() {
            global.storage().restore(ctx, &name, &self.volumes).await?;
        }
        Ok(())
    }

    async fn run(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        let name = env.name().to_string();
        let global = env.global();
        let file = self.file.clone().ok_or("compose manifest was not prepared")?;

        global
            .runtime()
            .compose_up(ctx, &self.directory, &name, &self.rendered, &self.workload_env)
            .await?;

        let by_service = self.project_containers(ctx, env).await?;

        // Join every exposed service's containers and collect their
        // in-network addresses.
        let mut links_by_service: HashMap<String, Vec<String>> = HashMap::new();
        for (service_name, service) in &file.services {
            if tcp_ports(service).is_empty() {
                continue;
            }
            let Some(containers) = by_service.get(service_name) else {
                continue;
            };
            let mut links = Vec::new();
            for container_id in containers {
                let alias = global.network().join(ctx, container_id).await?;
                self.joined.push(container_id.clone());
                wait_healthy(ctx, global.runtime().as_ref(), container_id).await?;
                links.push(alias);
            }
            links_by_service.insert(service_name.clone(), links);
        }

        self.services = allocate_services(&name, &file, &links_by_service);
        for service in &self.services {
            global
                .registry()
                .register(service.clone())
                .map_err(|error| format!("register service {}: {error}", service.label()))?;
        }
        env.ready().await;

        let backups = (!self.volumes.is_empty())
            .then(|| global.storage().schedule(ctx, name.clone(), self.volumes.clone()));

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
        let name = env.name().to_string();
        let global = env.global();
        let mut errors = ErrorList::default();

        for container_id in self.joined.drain(..) {
            if let Err(error) = global.network().leave(ctx, &container_id).await {
                errors.push("leave network", error);
            }
        }

        if !self.rendered.is_empty() {
            if let Err(error) = global
                .runtime()
                .compose_stop(ctx, &self.directory, &name, &self.rendered, &self.workload_env)
                .await
            {
                errors.push("compose stop", error);
            }
        }

        self.services.clear();
        errors.into_result()
    }
}

fn tcp_ports(service: &ComposeService) -> Vec<u16> {
    service
        .ports
        .iter()
        .filter(|port| port.protocol() == "tcp")
        .filter_map(|port| port.target())
        .collect()
}

/// Computes the `(domain, addresses)` allocation for a compose project.
///
/// Per service: `<port>.<serviceDomain>` for every TCP port plus
/// `<serviceDomain>` at the priority port. The bare namespace goes to
/// the `x-root` service, else the first service whose name is in the
/// root priority list, and always answers at that service's first
/// declared port.
fn allocate_services(
    namespace: &str,
    file: &ComposeFile,
    links_by_service: &HashMap<String, Vec<String>>,
) -> Vec<Service> {
    let mut services = Vec::new();
    let mut root_addresses: Option<Vec<String>> = None;
    let mut fallback_root: Option<(usize, Vec<String>)> = None;

    for (service_name, service) in &file.services {
        let Some(links) = links_by_service.get(service_name) else {
            continue;
        };
        let ports = tcp_ports(service);
        let Some(primary) = primary_port(&ports) else {
            continue;
        };

        let base = service.domain.clone().unwrap_or_else(|| service_name.clone());
        let service_domain = format!("{base}.{namespace}");

        for port in &ports {
            services.push(Service {
                namespace: namespace.to_string(),
                name: format!("{port}.{base}"),
                domain: Some(format!("{port}.{service_domain}")),
                addresses: join_port(links, *port),
            });
        }

        services.push(Service {
            namespace: namespace.to_string(),
            name: base.clone(),
            domain: Some(service_domain),
            addresses: join_port(links, primary),
        });

        let first_addresses = join_port(links, ports[0]);
        if service.root && root_addresses.is_none() {
            root_addresses = Some(first_addresses.clone());
        }
        let priority = ROOT_NAME_PRIORITY
            .iter()
            .position(|candidate| *candidate == service_name);
        if let Some(priority) = priority {
            let better = fallback_root
                .as_ref()
                .map_or(true, |(current, _)| priority < *current);
            if better {
                fallback_root = Some((priority, first_addresses));
            }
        }
    }

    let root = root_addresses.or(fallback_root.map(|(_, addresses)| addresses));
    if let Some(addresses) = root {
        services.push(Service {
            namespace: namespace.to_string(),
            name: String::new(),
            domain: Some(namespace.to_string()),
            addresses,
        });
    }
    services
}

fn join_port(links: &[String], port: u16) -> Vec<String> {
    links.iter().map(|link| format!("{link}:{port}")).collect()
}
