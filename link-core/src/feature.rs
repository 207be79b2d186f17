//! Feature registry and per-feature sinks.
//!
//! A `Feature` is a named subsystem (the crate ships one concrete feature,
//! `network`, in the sibling `link-feature-network` crate) that emits its
//! own envelope-wrapped records and answers host commands. The registry is
//! a single process-wide store owned by the `Server`; sinks are handed to
//! features once and bind to that feature id for the lifetime of the
//! server.

use crate::session::SessionHandle;
use link_protocol::Record;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

/// Which session(s) a `Sink::send` call should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientId {
    All,
    Specific(u64),
}

/// Delivery priority for a record enqueued onto a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// A named subsystem that publishes its own records and handles host
/// commands. Implementors must be cheap to call from the session reader
/// loop and from arbitrary instrumentation call sites — `on_feature_opened`
/// and `on_feature_command` should hand off to a background task for any
/// real work rather than blocking the caller.
pub trait Feature: Send + Sync {
    /// Stable identifier used as the `feature` discriminator on the wire.
    fn feature_id(&self) -> &str;

    /// Called exactly once per feature per server lifetime, with a `Sink`
    /// bound to this feature's id.
    fn on_link_available(&self, sink: Sink);

    /// Called at most once per (session, feature) when the client signals
    /// `FeatureOpened`.
    fn on_feature_opened(&self, client: u64);

    /// Called for a `FeatureCommand` addressed to this feature.
    fn on_feature_command(&self, client: u64, payload: serde_json::Value);

    /// Called exactly once when a session that had this feature attached
    /// closes.
    fn on_client_disconnected(&self, client: u64);
}

/// Handle a feature uses to broadcast or target records at connected
/// sessions. Holds only a back-reference to the server's session table,
/// never extending any session's lifetime.
#[derive(Clone)]
pub struct Sink {
    feature_id: Arc<str>,
    sessions: Weak<StdMutex<HashMap<u64, SessionHandle>>>,
}

impl Sink {
    pub(crate) fn new(feature_id: Arc<str>, sessions: Weak<StdMutex<HashMap<u64, SessionHandle>>>) -> Self {
        Self { feature_id, sessions }
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    /// Enqueue `record` for delivery. For `ClientId::All`, iterates a
    /// snapshot of sessions, skipping any that aren't `Active` or haven't
    /// opened this feature. Non-suspending in the common case: the only
    /// suspension point is a full high-priority queue.
    pub async fn send(&self, record: Record, client: ClientId, priority: Priority) {
        let Some(sessions) = self.sessions.upgrade() else {
            return;
        };
        let targets: Vec<SessionHandle> = {
            let guard = sessions.lock().unwrap();
            match client {
                ClientId::All => guard
                    .values()
                    .filter(|s| s.is_active() && s.has_opened(&self.feature_id))
                    .cloned()
                    .collect(),
                ClientId::Specific(id) => guard
                    .get(&id)
                    .filter(|s| s.is_active() && s.has_opened(&self.feature_id))
                    .cloned()
                    .into_iter()
                    .collect(),
            }
        };

        for session in targets {
            match priority {
                Priority::High => session.enqueue_high(record.clone()).await,
                Priority::Low => session.enqueue_low(record.clone()),
            }
        }
    }
}

struct RegistryInner {
    order: Vec<Arc<str>>,
    features: HashMap<Arc<str>, Arc<dyn Feature>>,
    started: bool,
}

/// Process-wide store of registered features. First registration for a
/// given `featureId` wins; later registrations under the same id are
/// ignored. `start()` is called once by the `Server` and fires
/// `on_link_available` for every feature registered so far; any feature
/// registered afterwards receives `on_link_available` immediately.
pub struct FeatureRegistry {
    inner: StdMutex<RegistryInner>,
    sessions: Arc<StdMutex<HashMap<u64, SessionHandle>>>,
}

impl FeatureRegistry {
    pub fn new(sessions: Arc<StdMutex<HashMap<u64, SessionHandle>>>) -> Self {
        Self {
            inner: StdMutex::new(RegistryInner {
                order: Vec::new(),
                features: HashMap::new(),
                started: false,
            }),
            sessions,
        }
    }

    /// Register `feature`. No-op if a feature with this id is already
    /// registered. If the registry has already started, `on_link_available`
    /// is called on `feature` immediately with a freshly bound sink.
    pub fn register(&self, feature: Arc<dyn Feature>) {
        let id: Arc<str> = Arc::from(feature.feature_id());
        let started = {
            let mut inner = self.inner.lock().unwrap();
            if inner.features.contains_key(&id) {
                return;
            }
            inner.order.push(id.clone());
            inner.features.insert(id.clone(), feature.clone());
            inner.started
        };
        if started {
            feature.on_link_available(Sink::new(id, Arc::downgrade(&self.sessions)));
        }
    }

    /// Fire `on_link_available` for every feature registered so far. Only
    /// the first call has any effect; later calls are no-ops, matching the
    /// "bind sinks once per feature per server lifetime" contract.
    pub fn start(&self) {
        let pending: Vec<(Arc<str>, Arc<dyn Feature>)> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.started {
                return;
            }
            inner.started = true;
            inner
                .order
                .iter()
                .map(|id| (id.clone(), inner.features[id].clone()))
                .collect()
        };
        for (id, feature) in pending {
            feature.on_link_available(Sink::new(id, Arc::downgrade(&self.sessions)));
        }
    }

    pub fn get(&self, feature_id: &str) -> Option<Arc<dyn Feature>> {
        self.inner.lock().unwrap().features.get(feature_id).cloned()
    }

    pub fn is_registered(&self, feature_id: &str) -> bool {
        self.inner.lock().unwrap().features.contains_key(feature_id)
    }

    /// All feature ids registered at the moment this is called. A session
    /// snapshots this exactly once, at handshake time.
    pub fn attached_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.order.iter().map(|id| id.to_string()).collect()
    }

    /// The session table this registry's sinks target. `Server` reuses this
    /// exact map rather than keeping a second one of its own, since a
    /// `Sink` only ever resolves sessions through the map it was built with.
    pub(crate) fn sessions(&self) -> Arc<StdMutex<HashMap<u64, SessionHandle>>> {
        self.sessions.clone()
    }
}
