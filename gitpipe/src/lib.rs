//! git-pipe - continuous deployment from Git behind a single ingress
//!
//! This library watches remote Git repositories, builds and runs their
//! container workloads on the local runtime, joins them into a shared
//! network, publishes each exposed port under a deterministic sub-domain
//! and proxies inbound HTTP(S) traffic to the right workload. Volumes are
//! periodically snapshotted into an encrypted remote archive and restored
//! before first start.
//!
//! # High-Level API
//!
//! The [`core::Environment`] aggregates the long-lived singletons and the
//! [`core::Launcher`] supervises everything else as daemons:
//!
//! ```ignore
//! use gitpipe::core::{CoreConfig, Environment, Descriptor};
//! use gitpipe::repo::PollerDaemon;
//!
//! let env = Environment::new(&ctx, config, runtime, backend, cryptor).await?;
//! env.launcher()
//!     .launch(&ctx, Descriptor::new("my-app", PollerDaemon::new(source, poll_config)))
//!     .await?;
//! ```

pub mod backup;
pub mod command;
pub mod core;
pub mod cryptor;
pub mod dns;
pub mod env_file;
pub mod ingress;
pub mod packs;
pub mod remote;
pub mod repo;
pub mod runtime;
pub mod tasks;

/// Version of the git-pipe library and CLI.
///
/// Synchronized across all workspace members; injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Boxed error used where daemons and collaborators carry heterogeneous
/// failure types across a single channel.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
