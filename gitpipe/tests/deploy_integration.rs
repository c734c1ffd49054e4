//! Full deployment flow: poll a git repository, build through a mock
//! container runtime, and verify the services end up in the registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gitpipe::backup::FileBackend;
use gitpipe::command::in_dir;
use gitpipe::core::{
    wait_for_launcher_event, CoreConfig, Descriptor, Environment, LauncherEvent,
};
use gitpipe::cryptor::PlainCryptor;
use gitpipe::remote::GitSource;
use gitpipe::repo::{PollConfig, PollerDaemon};
use gitpipe::runtime::{
    AttachedContainer, ContainerRuntime, ContainerSpec, ContainerSummary, EndpointInfo,
    HealthStatus, HelperRun, ImageInfo, NetworkInfo, RuntimeError,
};

/// Minimal in-memory engine: enough state for the single-container
/// driver and the network fabric.
#[derive(Default)]
struct FakeEngine {
    next_id: AtomicU64,
    containers: Mutex<HashMap<String, (ContainerSpec, bool)>>,
    networks: Mutex<HashMap<String, Vec<String>>>,
    volumes: Mutex<Vec<String>>,
    image: ImageInfo,
}

impl FakeEngine {
    fn with_image(image: ImageInfo) -> Self {
        Self {
            image,
            ..Self::default()
        }
    }

    fn running_containers(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|(_, running)| *running)
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for FakeEngine {
    async fn build_image(
        &self,
        _ctx: &CancellationToken,
        _dir: &Path,
        _env: &HashMap<String, String>,
    ) -> Result<ImageInfo, RuntimeError> {
        Ok(self.image.clone())
    }

    async fn create_container(
        &self,
        _ctx: &CancellationToken,
        spec: ContainerSpec,
    ) -> Result<String, RuntimeError> {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), (spec, false));
        Ok(id)
    }

    async fn start_container(
        &self,
        _ctx: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError> {
        match self.containers.lock().unwrap().get_mut(id) {
            Some(entry) => {
                entry.1 = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn stop_container(
        &self,
        _ctx: &CancellationToken,
        id: &str,
        _timeout: Duration,
    ) -> Result<(), RuntimeError> {
        if let Some(entry) = self.containers.lock().unwrap().get_mut(id) {
            entry.1 = false;
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        _ctx: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError> {
        self.containers.lock().unwrap().remove(id);
        for members in self.networks.lock().unwrap().values_mut() {
            members.retain(|member| member != id);
        }
        Ok(())
    }

    async fn list_containers(
        &self,
        _ctx: &CancellationToken,
        label_filters: &[(String, String)],
        _all: bool,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (spec, _))| {
                label_filters.iter().all(|(key, value)| {
                    spec.labels
                        .iter()
                        .any(|(have_key, have_value)| have_key == key && have_value == value)
                })
            })
            .map(|(id, (spec, _))| ContainerSummary {
                id: id.clone(),
                name: id.clone(),
                labels: spec.labels.iter().cloned().collect(),
            })
            .collect())
    }

    async fn container_health(
        &self,
        _ctx: &CancellationToken,
        _id: &str,
    ) -> Result<Option<HealthStatus>, RuntimeError> {
        Ok(None)
    }

    async fn container_networks(
        &self,
        _ctx: &CancellationToken,
        id: &str,
    ) -> Result<HashMap<String, EndpointInfo>, RuntimeError> {
        let networks = self.networks.lock().unwrap();
        Ok(networks
            .iter()
            .filter(|(_, members)| members.iter().any(|member| member == id))
            .map(|(name, _)| {
                (
                    name.clone(),
                    EndpointInfo {
                        aliases: vec![format!("{id}.net")],
                        ip: Some("10.10.0.2".to_string()),
                    },
                )
            })
            .collect())
    }

    async fn ensure_network(
        &self,
        _ctx: &CancellationToken,
        name: &str,
    ) -> Result<String, RuntimeError> {
        self.networks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(format!("net-{name}"))
    }

    async fn connect_network(
        &self,
        _ctx: &CancellationToken,
        network: &str,
        container: &str,
    ) -> Result<(), RuntimeError> {
        let mut networks = self.networks.lock().unwrap();
        let members = networks
            .get_mut(network)
            .ok_or_else(|| RuntimeError::NotFound(network.to_string()))?;
        if !members.iter().any(|member| member == container) {
            members.push(container.to_string());
        }
        Ok(())
    }

    async fn disconnect_network(
        &self,
        _ctx: &CancellationToken,
        network: &str,
        container: &str,
    ) -> Result<(), RuntimeError> {
        if let Some(members) = self.networks.lock().unwrap().get_mut(network) {
            members.retain(|member| member != container);
        }
        Ok(())
    }

    async fn inspect_network(
        &self,
        _ctx: &CancellationToken,
        name: &str,
    ) -> Result<NetworkInfo, RuntimeError> {
        let networks = self.networks.lock().unwrap();
        let members = networks
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(NetworkInfo {
            id: format!("net-{name}"),
            name: name.to_string(),
            containers: members
                .iter()
                .map(|id| AttachedContainer {
                    id: id.clone(),
                    name: id.clone(),
                    ipv4: Some("10.10.0.2".to_string()),
                })
                .collect(),
        })
    }

    async fn ensure_volume(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        _driver: &str,
    ) -> Result<(), RuntimeError> {
        let mut volumes = self.volumes.lock().unwrap();
        if !volumes.iter().any(|volume| volume == name) {
            volumes.push(name.to_string());
        }
        Ok(())
    }

    async fn run_helper(
        &self,
        _ctx: &CancellationToken,
        _run: HelperRun,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn compose_build(
        &self,
        _ctx: &CancellationToken,
        _dir: &Path,
        _project: &str,
        _manifest: &str,
        _env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn compose_up(
        &self,
        _ctx: &CancellationToken,
        _dir: &Path,
        _project: &str,
        _manifest: &str,
        _env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn compose_stop(
        &self,
        _ctx: &CancellationToken,
        _dir: &Path,
        _project: &str,
        _manifest: &str,
        _env: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}

async fn init_upstream_repo(dir: &Path) {
    let ctx = CancellationToken::new();
    let invoker = in_dir(dir);
    invoker
        .run("git", ["init", "-q", "-b", "master", "."])
        .exec(&ctx)
        .await
        .unwrap();
    invoker
        .run("git", ["config", "user.email", "test@example.com"])
        .exec(&ctx)
        .await
        .unwrap();
    invoker
        .run("git", ["config", "user.name", "Test"])
        .exec(&ctx)
        .await
        .unwrap();
    std::fs::write(dir.join("Dockerfile"), "FROM scratch\nEXPOSE 80\n").unwrap();
    invoker.run("git", ["add", "."]).exec(&ctx).await.unwrap();
    invoker
        .run("git", ["commit", "-q", "-m", "initial"])
        .exec(&ctx)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_repository_deploys_and_registers_services() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("my-app");
    std::fs::create_dir(&upstream).unwrap();
    init_upstream_repo(&upstream).await;

    let engine = Arc::new(FakeEngine::with_image(ImageInfo {
        id: "sha256:fake".to_string(),
        exposed_ports: vec![80, 9000],
        volumes: vec!["/data".to_string()],
        has_healthcheck: false,
    }));

    let ctx = CancellationToken::new();
    let env = Environment::new(
        &ctx,
        CoreConfig {
            retry_interval: Duration::from_millis(100),
            root_domain: "localhost".to_string(),
            ..CoreConfig::default()
        },
        Arc::clone(&engine) as Arc<dyn ContainerRuntime>,
        Arc::new(FileBackend::new(root.path().join("backups"))),
        Arc::new(PlainCryptor),
    )
    .await
    .unwrap();

    let run_env = Arc::clone(&env);
    let run_ctx = ctx.clone();
    let supervisor = tokio::spawn(async move {
        run_env.run(&run_ctx).await;
    });

    let mut events = env.launcher().subscribe(&ctx, 256, false).await.unwrap();

    let source = Arc::new(
        GitSource::from_reference(&format!("file://{}", upstream.display())).unwrap(),
    );
    let poller = PollerDaemon::new(
        source,
        PollConfig {
            poll_interval: Duration::from_millis(200),
            fqdn: false,
            work_dir: root.path().join("repos"),
            env: HashMap::new(),
        },
    );
    env.launcher()
        .launch(&ctx, Descriptor::new("poll.my-app", poller))
        .await
        .unwrap();

    // The packaging daemon, named after the repository, must go ready.
    let ready = tokio::time::timeout(
        Duration::from_secs(30),
        wait_for_launcher_event(&ctx, &mut events, "my-app", LauncherEvent::Ready.into()),
    )
    .await
    .expect("deployment never became ready");
    assert!(ready.is_some());

    // Domains: one per exposed port plus the bare namespace.
    let registry = env.registry();
    let root_service = registry.lookup("my-app.localhost").unwrap();
    let web = registry.lookup("80.my-app.localhost").unwrap();
    let other = registry.lookup("9000.my-app.localhost").unwrap();
    assert_eq!(root_service.addresses, web.addresses);
    assert_eq!(web.addresses.len(), 1);
    assert!(web.addresses[0].ends_with(":80"));
    assert!(other.addresses[0].ends_with(":9000"));

    // One running container carrying the group labels, and the backup
    // volume named after the daemon.
    assert_eq!(engine.running_containers(), 1);
    assert!(engine
        .volumes
        .lock()
        .unwrap()
        .contains(&"my-app".to_string()));

    // Shutdown tears everything down and unregisters the services.
    ctx.cancel();
    supervisor.await.unwrap();
    assert!(env.registry().lookup("my-app.localhost").is_err());
    assert_eq!(engine.running_containers(), 0);
}
