//! Daemon supervisor.
//!
//! A single supervisor task owns all mutable launcher state. The public
//! methods talk to it over bounded command channels, which serialises
//! every state update without locks. Each daemon gets a dedicated task
//! driving its create/run/remove lifecycle with retries.
//!
//! ```text
//!            ┌─────────────┐  create ok   ┌─────────┐  run returns  ┌──────────┐
//! scheduled →│  creating   │─────────────►│ running │──────────────►│ removing │─► removed
//!            └──────┬──────┘              └────┬────┘               └────┬─────┘
//!             create-failed               run-failed              remove-failed
//!                   │                          │                         │
//!                   └──── wait retry interval ─┴──── re-enter creating ◄─┘
//! ```
//!
//! The retry loop terminates when the daemon's context is cancelled.
//! Shutdown cancels every live daemon, waits for each lifecycle task to
//! finish, then closes all subscriber streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::environment::Environment;
use super::{Daemon, DaemonEnvironment, Descriptor, LauncherEvent, LauncherEventMessage};
use crate::BoxError;

/// Errors returned by the launcher's public methods.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// The caller's context was cancelled while the command was pending.
    #[error("launcher command cancelled")]
    Cancelled,

    /// The supervisor loop has shut down.
    #[error("launcher stopped")]
    Stopped,
}

/// Subscription stream of launcher events.
///
/// Each stream holds its own bounded buffer; when the buffer is full the
/// supervisor drops the event for this subscriber rather than blocking.
pub struct LauncherEventStream {
    id: u64,
    rx: mpsc::Receiver<LauncherEventMessage>,
}

impl LauncherEventStream {
    /// Receives the next event; `None` once the launcher closed the stream.
    pub async fn recv(&mut self) -> Option<LauncherEventMessage> {
        self.rx.recv().await
    }
}

struct SubscribeRequest {
    buffer: usize,
    replay: bool,
    respond: oneshot::Sender<LauncherEventStream>,
}

struct Channels {
    launch_rx: mpsc::Receiver<Descriptor>,
    remove_rx: mpsc::Receiver<String>,
    subscribe_rx: mpsc::Receiver<SubscribeRequest>,
    unsubscribe_rx: mpsc::Receiver<u64>,
    events_rx: mpsc::Receiver<LauncherEventMessage>,
    finished_rx: mpsc::Receiver<String>,
    finished_tx: mpsc::Sender<String>,
}

/// Lifecycle supervisor for named daemons.
pub struct Launcher {
    to_launch: mpsc::Sender<Descriptor>,
    to_remove: mpsc::Sender<String>,
    to_subscribe: mpsc::Sender<SubscribeRequest>,
    to_unsubscribe: mpsc::Sender<u64>,
    events: mpsc::Sender<LauncherEventMessage>,
    channels: Mutex<Option<Channels>>,
    retry_interval: Duration,
    graceful_timeout: Duration,
    running: AtomicBool,
}

impl Launcher {
    /// Creates a launcher; [`Launcher::run`] must be driven for commands
    /// to make progress.
    pub fn new(retry_interval: Duration, graceful_timeout: Duration) -> Self {
        let (to_launch, launch_rx) = mpsc::channel(1);
        let (to_remove, remove_rx) = mpsc::channel(1);
        let (to_subscribe, subscribe_rx) = mpsc::channel(1);
        let (to_unsubscribe, unsubscribe_rx) = mpsc::channel(1);
        let (events, events_rx) = mpsc::channel(1);
        let (finished_tx, finished_rx) = mpsc::channel(1);
        Self {
            to_launch,
            to_remove,
            to_subscribe,
            to_unsubscribe,
            events,
            channels: Mutex::new(Some(Channels {
                launch_rx,
                remove_rx,
                subscribe_rx,
                unsubscribe_rx,
                events_rx,
                finished_rx,
                finished_tx,
            })),
            retry_interval,
            graceful_timeout,
            running: AtomicBool::new(false),
        }
    }

    /// Schedules a daemon. Returns once the descriptor is accepted; the
    /// daemon runs in the background. A live daemon with the same name
    /// makes this a silent no-op; a daemon currently shutting down has
    /// the descriptor queued and started once the old one is gone.
    pub async fn launch(
        &self,
        ctx: &CancellationToken,
        descriptor: Descriptor,
    ) -> Result<(), LauncherError> {
        tokio::select! {
            sent = self.to_launch.send(descriptor) => sent.map_err(|_| LauncherError::Stopped),
            _ = ctx.cancelled() => Err(LauncherError::Cancelled),
        }
    }

    /// Requests cancellation of a daemon. Returns once accepted; removal
    /// completes in the background and is observable via events.
    pub async fn remove(
        &self,
        ctx: &CancellationToken,
        daemon: &str,
    ) -> Result<(), LauncherError> {
        tokio::select! {
            sent = self.to_remove.send(daemon.to_string()) => {
                sent.map_err(|_| LauncherError::Stopped)
            }
            _ = ctx.cancelled() => Err(LauncherError::Cancelled),
        }
    }

    /// Opens an event stream with the given buffer.
    ///
    /// With `replay` the last event of every currently-live daemon is
    /// delivered first. Call [`Launcher::unsubscribe`] to free resources.
    pub async fn subscribe(
        &self,
        ctx: &CancellationToken,
        buffer: usize,
        replay: bool,
    ) -> Result<LauncherEventStream, LauncherError> {
        let (respond, response) = oneshot::channel();
        let request = SubscribeRequest {
            buffer,
            replay,
            respond,
        };
        tokio::select! {
            sent = self.to_subscribe.send(request) => {
                sent.map_err(|_| LauncherError::Stopped)?;
            }
            _ = ctx.cancelled() => return Err(LauncherError::Cancelled),
        }
        tokio::select! {
            stream = response => stream.map_err(|_| LauncherError::Stopped),
            _ = ctx.cancelled() => Err(LauncherError::Cancelled),
        }
    }

    /// Closes an event stream.
    pub async fn unsubscribe(
        &self,
        ctx: &CancellationToken,
        stream: LauncherEventStream,
    ) -> Result<(), LauncherError> {
        tokio::select! {
            sent = self.to_unsubscribe.send(stream.id) => {
                sent.map_err(|_| LauncherError::Stopped)
            }
            _ = ctx.cancelled() => Err(LauncherError::Cancelled),
        }
    }

    /// Executes the supervisor loop until `ctx` is cancelled.
    ///
    /// Idempotent: a second concurrent invocation returns immediately.
    pub async fn run(&self, ctx: &CancellationToken, env: Arc<Environment>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut channels) = self.channels.lock().expect("launcher lock").take() else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let mut state = Supervisor {
            entries: HashMap::new(),
            pending: HashMap::new(),
            subscribers: HashMap::new(),
            next_stream_id: 0,
        };

        info!("launcher started");
        loop {
            tokio::select! {
                biased;

                _ = ctx.cancelled() => break,
                Some(descriptor) = channels.launch_rx.recv() => {
                    self.spawn(ctx, descriptor, &env, &channels.finished_tx, &mut state);
                }
                Some(name) = channels.remove_rx.recv() => {
                    if let Some(entry) = state.entries.get(&name) {
                        entry.cancel.cancel();
                    }
                }
                Some(name) = channels.finished_rx.recv() => {
                    state.entries.remove(&name);
                    if let Some(descriptor) = state.pending.remove(&name) {
                        self.spawn(ctx, descriptor, &env, &channels.finished_tx, &mut state);
                    }
                }
                Some(event) = channels.events_rx.recv() => {
                    state.distribute(event);
                }
                Some(request) = channels.subscribe_rx.recv() => {
                    state.subscribe(request);
                }
                Some(id) = channels.unsubscribe_rx.recv() => {
                    state.subscribers.remove(&id);
                }
            }
        }

        // Request every live daemon to finish, then keep serving only the
        // channels required for them to drain. Queued relaunches are
        // abandoned.
        state.pending.clear();
        for entry in state.entries.values() {
            entry.cancel.cancel();
        }
        while !state.entries.is_empty() {
            tokio::select! {
                Some(name) = channels.finished_rx.recv() => {
                    state.entries.remove(&name);
                }
                Some(event) = channels.events_rx.recv() => {
                    state.distribute(event);
                }
                Some(id) = channels.unsubscribe_rx.recv() => {
                    state.subscribers.remove(&id);
                }
            }
        }

        state.subscribers.clear();
        *self.channels.lock().expect("launcher lock") = Some(channels);
        self.running.store(false, Ordering::SeqCst);
        info!("launcher stopped");
    }

    fn spawn(
        &self,
        ctx: &CancellationToken,
        descriptor: Descriptor,
        env: &Arc<Environment>,
        finished: &mpsc::Sender<String>,
        state: &mut Supervisor,
    ) {
        if let Some(entry) = state.entries.get(&descriptor.name) {
            if entry.cancel.is_cancelled() {
                debug!(daemon = %descriptor.name, "daemon finishing, queueing relaunch");
                state.pending.insert(descriptor.name.clone(), descriptor);
            } else {
                debug!(daemon = %descriptor.name, "daemon already scheduled, ignoring");
            }
            return;
        }
        let cancel = ctx.child_token();
        let name = descriptor.name.clone();

        state.entries.insert(
            name.clone(),
            Entry {
                cancel: cancel.clone(),
                last_event: None,
            },
        );
        state.distribute(LauncherEventMessage::new(LauncherEvent::Scheduled, &name));

        let lifecycle = DaemonLifecycle {
            name,
            env: Arc::clone(env),
            events: self.events.clone(),
            finished: finished.clone(),
            retry_interval: self.retry_interval,
            graceful_timeout: self.graceful_timeout,
        };
        tokio::spawn(lifecycle.run(cancel, descriptor.daemon));
    }
}

struct Entry {
    cancel: CancellationToken,
    last_event: Option<LauncherEventMessage>,
}

struct Supervisor {
    entries: HashMap<String, Entry>,
    /// Descriptors waiting for a same-named daemon to finish shutting
    /// down; started from the finished handler.
    pending: HashMap<String, Descriptor>,
    subscribers: HashMap<u64, mpsc::Sender<LauncherEventMessage>>,
    next_stream_id: u64,
}

impl Supervisor {
    fn distribute(&mut self, event: LauncherEventMessage) {
        if let Some(entry) = self.entries.get_mut(&event.daemon) {
            entry.last_event = Some(event.clone());
        }
        for sender in self.subscribers.values() {
            if sender.try_send(event.clone()).is_err() {
                warn!(
                    daemon = %event.daemon,
                    event = %event.event,
                    "event stream overflow, event dropped"
                );
            }
        }
    }

    fn subscribe(&mut self, request: SubscribeRequest) {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        let (tx, rx) = mpsc::channel(request.buffer.max(1));
        if request.replay {
            for entry in self.entries.values() {
                if let Some(event) = &entry.last_event {
                    if tx.try_send(event.clone()).is_err() {
                        break;
                    }
                }
            }
        }
        self.subscribers.insert(id, tx);
        let _ = request.respond.send(LauncherEventStream { id, rx });
    }
}

/// Drives one daemon through its lifecycle, retrying on failure.
struct DaemonLifecycle {
    name: String,
    env: Arc<Environment>,
    events: mpsc::Sender<LauncherEventMessage>,
    finished: mpsc::Sender<String>,
    retry_interval: Duration,
    graceful_timeout: Duration,
}

impl DaemonLifecycle {
    async fn run(self, ctx: CancellationToken, mut daemon: Box<dyn Daemon>) {
        loop {
            // Fresh per-attempt environment so the ready signal re-arms.
            let denv = DaemonEnvironment::new(
                self.name.clone(),
                Arc::clone(&self.env),
                self.events.clone(),
            );
            let cleaned_up = self.attempt(&ctx, daemon.as_mut(), &denv).await;

            tokio::select! {
                biased;

                _ = ctx.cancelled() => {
                    // An attempt that never got past create has nothing
                    // to clean up, but waiters still need the terminal
                    // removal event.
                    if !cleaned_up {
                        self.notify(LauncherEvent::Removed, None).await;
                    }
                    break;
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        let _ = self.finished.send(self.name.clone()).await;
    }

    /// Runs one create/run/remove cycle. Returns whether the remove
    /// phase ran (and therefore emitted its own terminal event).
    async fn attempt(
        &self,
        ctx: &CancellationToken,
        daemon: &mut dyn Daemon,
        denv: &DaemonEnvironment,
    ) -> bool {
        match daemon.create(ctx, denv).await {
            Ok(()) => self.notify(LauncherEvent::Created, None).await,
            Err(error) => {
                self.notify(LauncherEvent::CreateFailed, Some(error)).await;
                return false;
            }
        }

        match daemon.run(ctx, denv).await {
            Ok(()) => self.notify(LauncherEvent::Stopped, None).await,
            Err(error) if ctx.is_cancelled() => {
                debug!(daemon = %self.name, error = %error, "run ended during shutdown");
                self.notify(LauncherEvent::Stopped, None).await;
            }
            Err(error) => self.notify(LauncherEvent::RunFailed, Some(error)).await,
        }

        // Cleanup gets a fresh context bounded by the graceful timeout so
        // it proceeds even when the daemon context is already cancelled.
        let cleanup = CancellationToken::new();
        match tokio::time::timeout(self.graceful_timeout, daemon.remove(&cleanup, denv)).await {
            Ok(Ok(())) => self.notify(LauncherEvent::Removed, None).await,
            Ok(Err(error)) => self.notify(LauncherEvent::RemoveFailed, Some(error)).await,
            Err(_) => {
                cleanup.cancel();
                self.notify(
                    LauncherEvent::RemoveFailed,
                    Some("graceful cleanup deadline exceeded".into()),
                )
                .await;
            }
        }
        true
    }

    async fn notify(&self, event: LauncherEvent, error: Option<BoxError>) {
        let message = match error {
            Some(error) => {
                warn!(daemon = %self.name, event = %event, error = %error, "daemon failure");
                LauncherEventMessage::failed(event, self.name.clone(), error)
            }
            None => LauncherEventMessage::new(event, self.name.clone()),
        };
        let _ = self.events.send(message).await;
    }
}
