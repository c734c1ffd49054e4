//! The `run` subcommand: boot the environment, launch one poller per
//! repository, the DNS bridge and the router, then wait for shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gitpipe::backup;
use gitpipe::core::{BackgroundEnvironment, CoreConfig, Descriptor, Environment};
use gitpipe::cryptor::{Cryptor, PlainCryptor, SymmetricCryptor};
use gitpipe::dns::{bridge_daemon, Cloudflare, CloudflareConfig, DnsProvider};
use gitpipe::env_file::{filter_for_workload, merge_env_files};
use gitpipe::ingress::{
    registry_sync_daemon, serve_auto_tls, serve_http, serve_tls, AddressResolver, ByDomain,
    ByPath, JwtVerifier, RequestResolver, Router, RouterHostPolicy, SelfSignedIssuer,
    UpstreamProxy,
};
use gitpipe::remote::{GitSource, Source};
use gitpipe::repo::{canonical_name, PollConfig, PollerDaemon};
use gitpipe::runtime::DockerCli;

use crate::error::CliError;

/// Buffer for event subscriptions of the long-lived bridges.
const BRIDGE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DnsProviderKind {
    /// Cloudflare v4 API
    Cloudflare,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Root domain; defaults to the host name
    #[arg(long, short = 'd', env = "DOMAIN")]
    pub domain: Option<String>,

    /// Dummy mode disables the HTTP router
    #[arg(long, short = 'D', env = "DUMMY")]
    pub dummy: bool,

    /// Address to bind the HTTP server to
    #[arg(long, short = 'b', env = "BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Automatic TLS; ignores the bind address and listens on :443
    #[arg(long, short = 'T', env = "AUTO_TLS")]
    pub auto_tls: bool,

    /// Serve HTTPS with server.{crt,key} from the SSL directory
    #[arg(long, env = "TLS")]
    pub tls: bool,

    /// Directory for SSL certificates; certificate cache with --auto-tls
    #[arg(long, env = "SSL_DIR", default_value = "ssl")]
    pub ssl_dir: PathBuf,

    /// Disable the index page for unknown routes
    #[arg(long, env = "NO_INDEX")]
    pub no_index: bool,

    /// Route by first path segment instead of by domain
    #[arg(long, short = 'P', env = "PATH_ROUTING")]
    pub path_routing: bool,

    /// JWT shared secret; enables authorisation when set
    #[arg(long, env = "JWT")]
    pub jwt: Option<String>,

    /// Network name for internal communication
    #[arg(long, short = 'n', env = "NETWORK", default_value = "git-pipe")]
    pub network: String,

    /// Interval to poll repositories
    #[arg(long, short = 'i', env = "INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Output directory for clones
    #[arg(long, short = 'o', env = "OUTPUT", default_value = "repos")]
    pub output: PathBuf,

    /// Backup location (file://dir, s3://id:secret@host/bucket, none)
    #[arg(long, short = 'B', env = "BACKUP", default_value = "file://backups")]
    pub backup: String,

    /// Symmetric backup encryption key
    #[arg(long, short = 'K', env = "BACKUP_KEY", default_value = "git-pipe-change-me")]
    pub backup_key: String,

    /// Interval between volume snapshots
    #[arg(long, short = 'I', env = "BACKUP_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub backup_interval: Duration,

    /// Construct unique FQDN names from the URL path and host
    #[arg(long, short = 'F', env = "FQDN")]
    pub fqdn: bool,

    /// Deadline for cleanup during shutdown
    #[arg(long, env = "GRACEFUL_SHUTDOWN", default_value = "15s", value_parser = humantime::parse_duration)]
    pub graceful_shutdown: Duration,

    /// Environment variable files merged into each workload
    #[arg(long = "env-file", short = 'e', env = "ENV_FILE", value_delimiter = ',')]
    pub env_file: Vec<PathBuf>,

    /// DNS provider for automatic record registration
    #[arg(long, short = 'p', env = "PROVIDER", value_enum)]
    pub provider: Option<DnsProviderKind>,

    /// Public IP for DNS records; auto-detected when missing
    #[arg(long = "cloudflare-ip", env = "CLOUDFLARE_IP")]
    pub cloudflare_ip: Option<String>,

    /// Let Cloudflare proxy the traffic
    #[arg(long = "cloudflare-proxy", env = "CLOUDFLARE_PROXY")]
    pub cloudflare_proxy: bool,

    /// Cloudflare API token
    #[arg(long = "cloudflare-api-token", env = "CLOUDFLARE_API_TOKEN")]
    pub cloudflare_api_token: Option<String>,

    /// Remote git URLs to poll, with an optional branch or tag after '#'
    #[arg(value_name = "git-url", required = true)]
    pub repos: Vec<String>,
}

impl RunArgs {
    /// Effective root domain: the flag value or the local host name.
    fn effective_domain(&self) -> String {
        match &self.domain {
            Some(domain) if !domain.is_empty() => domain.clone(),
            _ => nix::unistd::gethostname()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }

    /// Root domain handed to the registry; empty in path-routing mode,
    /// where the domain is only the outer shell of the URL.
    fn root_domain(&self) -> String {
        if self.path_routing {
            String::new()
        } else {
            self.effective_domain()
        }
    }
}

pub fn execute(args: RunArgs) -> Result<(), CliError> {
    init_logging()?;
    let runtime = tokio::runtime::Runtime::new().map_err(CliError::Runtime)?;
    runtime.block_on(run(args))
}

fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| CliError::LoggingInit(error.to_string()))
}

async fn run(args: RunArgs) -> Result<(), CliError> {
    let ctx = CancellationToken::new();

    let backend = backup::from_location(&args.backup)?;
    let cryptor: Arc<dyn Cryptor> = if args.backup_key.is_empty() {
        Arc::new(PlainCryptor)
    } else {
        Arc::new(SymmetricCryptor::new(&args.backup_key))
    };

    let config = CoreConfig {
        network_name: args.network.clone(),
        graceful_timeout: args.graceful_shutdown,
        root_domain: args.root_domain(),
        backup_interval: args.backup_interval,
        ..CoreConfig::default()
    };
    let background =
        BackgroundEnvironment::start(&ctx, config, Arc::new(DockerCli::new()), backend, cryptor)
            .await?;
    let env = Arc::clone(background.environment());

    let env_vars = merge_env_files(&args.env_file).map_err(CliError::EnvFile)?;

    if let Some(kind) = args.provider {
        let provider = build_dns_provider(&ctx, kind, &args).await?;
        env.launcher()
            .launch(
                &ctx,
                Descriptor::new("dns", bridge_daemon(provider, BRIDGE_BUFFER)),
            )
            .await?;
    }

    let mut server = None;
    if !args.dummy {
        server = Some(start_router(&ctx, &args, &env).await?);
    }

    for repo in &args.repos {
        let source = Arc::new(GitSource::from_reference(repo)?);
        let name = canonical_name(source.ref_url(), args.fqdn);
        let poller = PollerDaemon::new(
            source,
            PollConfig {
                poll_interval: args.interval,
                fqdn: args.fqdn,
                work_dir: args.output.clone(),
                env: filter_for_workload(&env_vars, &name),
            },
        );
        info!(repo = %repo, name = %name, "watching repository");
        env.launcher()
            .launch(&ctx, Descriptor::new(format!("poll.{name}"), poller))
            .await?;
    }

    wait_for_shutdown(&ctx, server).await;

    ctx.cancel();
    if tokio::time::timeout(args.graceful_shutdown, background.stop())
        .await
        .is_err()
    {
        error!("graceful shutdown deadline exceeded");
    }
    Ok(())
}

async fn build_dns_provider(
    ctx: &CancellationToken,
    kind: DnsProviderKind,
    args: &RunArgs,
) -> Result<Arc<dyn DnsProvider>, CliError> {
    match kind {
        DnsProviderKind::Cloudflare => {
            let provider = Cloudflare::new(
                ctx,
                CloudflareConfig {
                    api_token: args.cloudflare_api_token.clone().unwrap_or_default(),
                    ip: args.cloudflare_ip.clone(),
                    proxied: args.cloudflare_proxy,
                },
            )
            .await?;
            Ok(Arc::new(provider))
        }
    }
}

/// Builds the router, wires it to the registry and spawns the chosen
/// server front end. Returns the server task handle.
async fn start_router(
    ctx: &CancellationToken,
    args: &RunArgs,
    env: &Arc<Environment>,
) -> Result<tokio::task::JoinHandle<()>, CliError> {
    let resolver: Box<dyn RequestResolver> = if args.path_routing {
        Box::new(ByPath)
    } else {
        // Registry domains are already fully qualified.
        Box::new(ByDomain::new(""))
    };
    let auth = args
        .jwt
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .map(JwtVerifier::new);
    if auth.is_some() {
        info!("JWT authorization enabled");
    }
    let proxy = UpstreamProxy::new(Some(
        Arc::clone(env.network()) as Arc<dyn AddressResolver>
    ));
    let router = Router::new(ctx.clone(), resolver, auth, proxy, !args.no_index);

    env.launcher()
        .launch(
            ctx,
            Descriptor::new(
                "router",
                registry_sync_daemon(Arc::clone(&router), BRIDGE_BUFFER),
            ),
        )
        .await?;

    let app = Arc::clone(&router).into_service();
    let token = ctx.clone();
    let bind = args.bind.clone();
    let ssl_dir = args.ssl_dir.clone();
    let auto_tls = args.auto_tls;
    let tls = args.tls && !args.auto_tls;
    let policy = Arc::new(RouterHostPolicy::new(
        Arc::clone(&router),
        args.path_routing.then(|| args.effective_domain()),
    ));

    let handle = tokio::spawn(async move {
        let served = if auto_tls {
            serve_auto_tls(&token, &ssl_dir, policy, Arc::new(SelfSignedIssuer), app).await
        } else if tls {
            serve_tls(&token, &bind, &ssl_dir, app).await
        } else {
            serve_http(&token, &bind, app).await
        };
        if let Err(failure) = served {
            error!(error = %failure, "router server failed");
        }
    });
    Ok(handle)
}

async fn wait_for_shutdown(
    ctx: &CancellationToken,
    server: Option<tokio::task::JoinHandle<()>>,
) {
    match server {
        Some(handle) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = handle => error!("router server stopped"),
                _ = ctx.cancelled() => {}
            }
        }
        None => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = ctx.cancelled() => {}
            }
        }
    }
}
