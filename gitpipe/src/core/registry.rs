//! Authoritative map of live services.
//!
//! Services are indexed by `(namespace, name)` and by fully-qualified
//! domain. Every mutation emits an event to all subscribers before the
//! call returns; slow subscribers lose events instead of blocking the
//! writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use super::{RegistryEvent, RegistryEventMessage, Service};

/// Registration failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another service already owns the domain.
    #[error("service domain {0} already used")]
    DomainInUse(String),

    /// The `(namespace, name)` pair already exists.
    #[error("service {name} already registered in namespace {namespace}")]
    NameInUse { namespace: String, name: String },

    /// Lookup target does not exist.
    #[error("service not registered")]
    NotRegistered,
}

/// Subscription stream of registry events.
pub struct RegistryEventStream {
    id: u64,
    rx: mpsc::Receiver<RegistryEventMessage>,
}

impl RegistryEventStream {
    /// Receives the next event; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<RegistryEventMessage> {
        self.rx.recv().await
    }
}

struct Namespace {
    services: HashMap<String, Service>,
}

struct State {
    namespaces: HashMap<String, Namespace>,
    by_domain: HashMap<String, Service>,
    listeners: HashMap<u64, mpsc::Sender<RegistryEventMessage>>,
}

/// Service registry with domain normalisation against a root domain.
pub struct Registry {
    root_domain: String,
    state: RwLock<State>,
    next_stream_id: AtomicU64,
}

impl Registry {
    /// Creates an empty registry. `root_domain` may be empty, in which
    /// case domains are used exactly as published.
    pub fn new(root_domain: impl Into<String>) -> Self {
        Self {
            root_domain: root_domain.into(),
            state: RwLock::new(State {
                namespaces: HashMap::new(),
                by_domain: HashMap::new(),
                listeners: HashMap::new(),
            }),
            next_stream_id: AtomicU64::new(0),
        }
    }

    /// Root domain appended to unqualified service domains.
    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    /// Registers a service, stamping its canonical domain.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DomainInUse`] when the domain already maps,
    /// [`RegistryError::NameInUse`] when the name exists in the namespace.
    pub fn register(&self, mut service: Service) -> Result<Service, RegistryError> {
        let mut state = self.state.write().expect("registry lock");
        let domain = self.canonical_domain(&service);

        if state.by_domain.contains_key(&domain) {
            return Err(RegistryError::DomainInUse(domain));
        }

        let namespace = state
            .namespaces
            .entry(service.namespace.clone())
            .or_insert_with(|| Namespace {
                services: HashMap::new(),
            });
        if namespace.services.contains_key(&service.name) {
            return Err(RegistryError::NameInUse {
                namespace: service.namespace.clone(),
                name: service.name.clone(),
            });
        }

        service.domain = Some(domain.clone());
        namespace
            .services
            .insert(service.name.clone(), service.clone());
        state.by_domain.insert(domain, service.clone());
        Self::notify(&state, RegistryEvent::Registered, service.clone());
        Ok(service)
    }

    /// Removes a service; unknown names are a no-op.
    pub fn unregister(&self, namespace: &str, name: &str) {
        let mut state = self.state.write().expect("registry lock");
        let Some(ns) = state.namespaces.get_mut(namespace) else {
            return;
        };
        let Some(service) = ns.services.remove(name) else {
            return;
        };
        let domain = self.canonical_domain(&service);
        state.by_domain.remove(&domain);
        Self::notify(&state, RegistryEvent::Unregistered, service);
    }

    /// Exact lookup by `(namespace, name)`.
    pub fn find(&self, namespace: &str, name: &str) -> Result<Service, RegistryError> {
        let state = self.state.read().expect("registry lock");
        state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.services.get(name))
            .cloned()
            .ok_or(RegistryError::NotRegistered)
    }

    /// Lookup by domain, after root-domain normalisation.
    pub fn lookup(&self, domain: &str) -> Result<Service, RegistryError> {
        let domain = self.normalize_domain(domain.to_string());
        let state = self.state.read().expect("registry lock");
        state
            .by_domain
            .get(&domain)
            .cloned()
            .ok_or(RegistryError::NotRegistered)
    }

    /// Snapshot of all registered services.
    pub fn all(&self) -> Vec<Service> {
        let state = self.state.read().expect("registry lock");
        state.by_domain.values().cloned().collect()
    }

    /// Opens an event stream; with `replay` a `Registered` event is
    /// delivered up-front for every live service, in arbitrary order.
    pub fn subscribe(&self, buffer: usize, replay: bool) -> RegistryEventStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut state = self.state.write().expect("registry lock");
        if replay {
            for service in state.by_domain.values() {
                let message = RegistryEventMessage {
                    event: RegistryEvent::Registered,
                    service: service.clone(),
                };
                if tx.try_send(message).is_err() {
                    break;
                }
            }
        }
        state.listeners.insert(id, tx);
        RegistryEventStream { id, rx }
    }

    /// Closes an event stream.
    pub fn unsubscribe(&self, stream: RegistryEventStream) {
        let mut state = self.state.write().expect("registry lock");
        state.listeners.remove(&stream.id);
    }

    fn notify(state: &State, event: RegistryEvent, service: Service) {
        let message = RegistryEventMessage { event, service };
        for listener in state.listeners.values() {
            if listener.try_send(message.clone()).is_err() {
                warn!(domain = ?message.service.domain, "registry event stream overflow");
            }
        }
    }

    fn canonical_domain(&self, service: &Service) -> String {
        let zone = match &service.domain {
            Some(domain) if !domain.is_empty() => domain.clone(),
            _ => format!("{}.{}", service.name, service.namespace),
        };
        self.normalize_domain(zone)
    }

    fn normalize_domain(&self, domain: String) -> String {
        if self.root_domain.is_empty()
            || domain == self.root_domain
            || domain.ends_with(&format!(".{}", self.root_domain))
        {
            return domain;
        }
        format!("{domain}.{}", self.root_domain)
    }
}
