//! Lifecycle event bus.
//!
//! Listeners register per event kind and get a [`SubscriptionId`] back for
//! unregistering. Started and ended events are additionally broadcast as
//! [`LifecycleEvent`]s for async listeners (see [`EventBus::subscribe`]).
//!
//! Handlers run synchronously on the posting thread, outside the registry lock.

use crate::acquisition::settings::AcquisitionSettings;
use crate::data::datastore::Datastore;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default capacity of the broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// A sub-acquisition started.
#[derive(Clone)]
pub struct AcquisitionStarted {
    /// Run this sub-acquisition belongs to.
    pub run_id: Uuid,
    /// Index of the sub-acquisition.
    pub acq_index: usize,
    /// Store receiving its images.
    pub store: Arc<dyn Datastore>,
    /// Settings the sub-acquisition runs with.
    pub settings: AcquisitionSettings,
}

/// A sub-acquisition ended (normally or not).
#[derive(Clone)]
pub struct AcquisitionEnded {
    /// Run this sub-acquisition belongs to.
    pub run_id: Uuid,
    /// Index of the sub-acquisition.
    pub acq_index: usize,
    /// Store that received its images.
    pub store: Arc<dyn Datastore>,
}

impl fmt::Debug for AcquisitionStarted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionStarted")
            .field("run_id", &self.run_id)
            .field("acq_index", &self.acq_index)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for AcquisitionEnded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionEnded")
            .field("run_id", &self.run_id)
            .field("acq_index", &self.acq_index)
            .field("store", &self.store.name())
            .finish()
    }
}

/// The application is about to shut down. Any listener may veto.
#[derive(Debug, Default)]
pub struct ShutdownCommencing {
    cancelled: AtomicBool,
}

impl ShutdownCommencing {
    /// New, not yet cancelled request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Veto the shutdown.
    pub fn cancel_shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether some listener vetoed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Started/ended events as seen by broadcast subscribers.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Started(AcquisitionStarted),
    Ended(AcquisitionEnded),
}

/// Handle for unregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    started: Vec<(SubscriptionId, Handler<AcquisitionStarted>)>,
    ended: Vec<(SubscriptionId, Handler<AcquisitionEnded>)>,
    shutdown: Vec<(SubscriptionId, Handler<ShutdownCommencing>)>,
}

/// Typed publish/subscribe hub for acquisition lifecycle events.
pub struct EventBus {
    handlers: RwLock<Handlers>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl EventBus {
    /// Bus whose broadcast channel buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Handlers::default()),
            next_id: AtomicU64::new(1),
            broadcast,
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Listen for started sub-acquisitions.
    pub fn on_started<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AcquisitionStarted) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.handlers.write().started.push((id, Arc::new(handler)));
        id
    }

    /// Listen for ended sub-acquisitions.
    pub fn on_ended<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AcquisitionEnded) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.handlers.write().ended.push((id, Arc::new(handler)));
        id
    }

    /// Listen for shutdown requests.
    pub fn on_shutdown<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ShutdownCommencing) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.handlers.write().shutdown.push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.started.len() + handlers.ended.len() + handlers.shutdown.len();
        handlers.started.retain(|(h, _)| *h != id);
        handlers.ended.retain(|(h, _)| *h != id);
        handlers.shutdown.retain(|(h, _)| *h != id);
        let after = handlers.started.len() + handlers.ended.len() + handlers.shutdown.len();
        before != after
    }

    /// Number of registered listeners across all kinds.
    pub fn handler_count(&self) -> usize {
        let handlers = self.handlers.read();
        handlers.started.len() + handlers.ended.len() + handlers.shutdown.len()
    }

    /// Receive started/ended events asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.broadcast.subscribe()
    }

    /// Notify listeners that a sub-acquisition started.
    pub fn post_started(&self, event: AcquisitionStarted) {
        debug!(run_id = %event.run_id, acq_index = event.acq_index, "Acquisition started");
        let handlers: Vec<_> = self
            .handlers
            .read()
            .started
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
        self.send(LifecycleEvent::Started(event));
    }

    /// Notify listeners that a sub-acquisition ended.
    pub fn post_ended(&self, event: AcquisitionEnded) {
        debug!(run_id = %event.run_id, acq_index = event.acq_index, "Acquisition ended");
        let handlers: Vec<_> = self
            .handlers
            .read()
            .ended
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
        self.send(LifecycleEvent::Ended(event));
    }

    /// Ask listeners whether shutdown may proceed.
    pub fn post_shutdown(&self, request: &ShutdownCommencing) {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .shutdown
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(request);
        }
    }

    fn send(&self, event: LifecycleEvent) {
        // No receivers is fine.
        if self.broadcast.send(event).is_err() {
            trace!("No broadcast subscribers for lifecycle event");
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
