//! Core contracts: services, daemons and the events connecting them.
//!
//! A [`Daemon`] is a long-lived managed task with create/run/remove
//! phases, supervised by the [`Launcher`]. Exposed endpoints are
//! published as [`Service`]s in the [`Registry`]. The [`Environment`]
//! aggregates the singletons every daemon receives.

pub mod environment;
pub mod launcher;
pub mod network;
pub mod registry;

pub use environment::{BackgroundEnvironment, CoreConfig, Environment};
pub use launcher::{Launcher, LauncherEventStream};
pub use network::DockerNetwork;
pub use registry::{Registry, RegistryError, RegistryEventStream};

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::BoxError;

// ============================================================================
// Services
// ============================================================================

/// An exposed endpoint of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Daemon name the service belongs to; groups services of one repo.
    pub namespace: String,
    /// Unique within the namespace.
    pub name: String,
    /// Explicit routing key. When absent the registry derives
    /// `name.namespace` and appends the root domain.
    pub domain: Option<String>,
    /// `host:port` upstreams; more than one for scaled workloads.
    pub addresses: Vec<String>,
}

impl Service {
    /// Human-readable `name@namespace` label for logs.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.namespace)
    }
}

// ============================================================================
// Launcher events
// ============================================================================

/// Lifecycle event of a supervised daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LauncherEvent {
    Scheduled = 0,
    Created = 1,
    CreateFailed = 2,
    Ready = 3,
    RunFailed = 4,
    Stopped = 5,
    Removed = 6,
    RemoveFailed = 7,
}

impl LauncherEvent {
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Created => "created",
            Self::CreateFailed => "create-failed",
            Self::Ready => "ready",
            Self::RunFailed => "run-failed",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
            Self::RemoveFailed => "remove-failed",
        }
    }
}

impl fmt::Display for LauncherEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of [`LauncherEvent`]s, built with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const fn contains(self, event: LauncherEvent) -> bool {
        self.0 & event.bit() != 0
    }
}

impl From<LauncherEvent> for EventMask {
    fn from(event: LauncherEvent) -> Self {
        Self(event.bit())
    }
}

impl BitOr for LauncherEvent {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

impl BitOr<LauncherEvent> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: LauncherEvent) -> EventMask {
        EventMask(self.0 | rhs.bit())
    }
}

/// Launcher event together with the daemon it happened to.
#[derive(Debug, Clone)]
pub struct LauncherEventMessage {
    pub event: LauncherEvent,
    pub daemon: String,
    /// Set for the `*Failed` events.
    pub error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl LauncherEventMessage {
    pub(crate) fn new(event: LauncherEvent, daemon: impl Into<String>) -> Self {
        Self {
            event,
            daemon: daemon.into(),
            error: None,
        }
    }

    pub(crate) fn failed(
        event: LauncherEvent,
        daemon: impl Into<String>,
        error: BoxError,
    ) -> Self {
        Self {
            event,
            daemon: daemon.into(),
            error: Some(Arc::from(error)),
        }
    }
}

/// Waits on `stream` for the first event of `daemon` matching `mask`.
///
/// Returns `None` when the context is cancelled or the stream closes
/// before a matching event arrives.
pub async fn wait_for_launcher_event(
    ctx: &CancellationToken,
    stream: &mut LauncherEventStream,
    daemon: &str,
    mask: EventMask,
) -> Option<LauncherEventMessage> {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return None,
            item = stream.recv() => {
                let message = item?;
                if mask.contains(message.event) && message.daemon == daemon {
                    return Some(message);
                }
            }
        }
    }
}

// ============================================================================
// Registry events
// ============================================================================

/// Kind of a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered,
    Unregistered,
}

/// Registry mutation together with the affected service.
#[derive(Debug, Clone)]
pub struct RegistryEventMessage {
    pub event: RegistryEvent,
    pub service: Service,
}

// ============================================================================
// Daemons
// ============================================================================

/// A long-lived managed task.
///
/// The launcher calls the three phases strictly sequentially per
/// instance: `create`, then `run` (which blocks until cancellation or a
/// terminal failure), then `remove` (always invoked after a successful
/// create, under a bounded cleanup deadline).
#[async_trait]
pub trait Daemon: Send + 'static {
    /// Allocates the resources the daemon needs.
    async fn create(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError>;

    /// Runs until `ctx` is cancelled or a terminal failure occurs.
    async fn run(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError>;

    /// Releases resources; invoked with a fresh deadline-bounded context.
    async fn remove(
        &mut self,
        ctx: &CancellationToken,
        env: &DaemonEnvironment,
    ) -> Result<(), BoxError>;
}

/// Descriptor of a daemon to launch. Names are unique within the launcher.
pub struct Descriptor {
    pub name: String,
    pub daemon: Box<dyn Daemon>,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, daemon: impl Daemon) -> Self {
        Self {
            name: name.into(),
            daemon: Box::new(daemon),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor").field("name", &self.name).finish()
    }
}

/// Per-daemon view of the world handed to every phase.
#[derive(Clone)]
pub struct DaemonEnvironment {
    name: String,
    global: Arc<Environment>,
    ready: ReadySignal,
}

impl DaemonEnvironment {
    pub(crate) fn new(
        name: String,
        global: Arc<Environment>,
        events: mpsc::Sender<LauncherEventMessage>,
    ) -> Self {
        let ready = ReadySignal {
            daemon: name.clone(),
            events,
            fired: Arc::new(AtomicBool::new(false)),
        };
        Self {
            name,
            global,
            ready,
        }
    }

    /// The daemon's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared environment with all singletons.
    pub fn global(&self) -> &Arc<Environment> {
        &self.global
    }

    /// Signals readiness. Idempotent; emits [`LauncherEvent::Ready`] once.
    pub async fn ready(&self) {
        self.ready.fire().await;
    }
}

#[derive(Clone)]
struct ReadySignal {
    daemon: String,
    events: mpsc::Sender<LauncherEventMessage>,
    fired: Arc<AtomicBool>,
}

impl ReadySignal {
    async fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = LauncherEventMessage::new(LauncherEvent::Ready, self.daemon.clone());
        if self.events.send(message).await.is_err() {
            warn!(daemon = %self.daemon, "launcher is gone, ready signal dropped");
        }
    }
}

// ============================================================================
// Daemon adapters
// ============================================================================

/// Wraps a single async function as a daemon with no-op create/remove.
pub struct FuncDaemon<F> {
    handler: F,
}

/// Returns a daemon running `handler` once per launch attempt.
pub fn func_daemon<F, Fut>(handler: F) -> FuncDaemon<F>
where
    F: FnMut(CancellationToken, DaemonEnvironment) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send,
{
    FuncDaemon { handler }
}

#[async_trait]
impl<F, Fut> Daemon for FuncDaemon<F>
where
    F: FnMut(CancellationToken, DaemonEnvironment) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send,
{
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
        (self.handler)(ctx.clone(), env.clone()).await
    }

    async fn remove(
        &mut self,
        _ctx: &CancellationToken,
        _env: &DaemonEnvironment,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask_contains() {
        let mask = LauncherEvent::Removed | LauncherEvent::RemoveFailed;
        assert!(mask.contains(LauncherEvent::Removed));
        assert!(mask.contains(LauncherEvent::RemoveFailed));
        assert!(!mask.contains(LauncherEvent::Ready));
    }

    #[test]
    fn test_event_mask_chained() {
        let mask = LauncherEvent::Ready | LauncherEvent::RunFailed | LauncherEvent::CreateFailed;
        assert!(mask.contains(LauncherEvent::CreateFailed));
        assert!(!mask.contains(LauncherEvent::Scheduled));
    }

    #[test]
    fn test_service_label() {
        let service = Service {
            namespace: "my-app".to_string(),
            name: "80".to_string(),
            domain: None,
            addresses: vec!["10.0.0.2:80".to_string()],
        };
        assert_eq!(service.label(), "80@my-app");
    }

    #[test]
    fn test_event_display() {
        assert_eq!(LauncherEvent::CreateFailed.to_string(), "create-failed");
        assert_eq!(LauncherEvent::Ready.to_string(), "ready");
    }
}
