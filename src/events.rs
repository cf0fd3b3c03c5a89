use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::lock;
use crate::models::Mutation;

/// Lifecycle notifications for UI observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    SyncStart,
    SyncComplete {
        success_count: usize,
        failure_count: usize,
    },
    MutationSynced {
        mutation: Mutation,
    },
    MutationFailed {
        mutation: Mutation,
    },
    /// The mutation log could not be read or written.
    SyncUnavailable {
        reason: String,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart => "sync-start",
            SyncEvent::SyncComplete { .. } => "sync-complete",
            SyncEvent::MutationSynced { .. } => "mutation-synced",
            SyncEvent::MutationFailed { .. } => "mutation-failed",
            SyncEvent::SyncUnavailable { .. } => "sync-unavailable",
        }
    }
}

pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// Fan-out of [`SyncEvent`]s to registered listeners.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Registry>,
}

/// Handle returned by [`EventBus::add_listener`].
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.listeners).push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver to every listener registered at the time of the call. A
    /// panicking listener is logged and skipped.
    pub fn emit(&self, event: SyncEvent) {
        let listeners: Vec<Listener> = lock(&self.registry.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        tracing::debug!("Emitting {} to {} listeners", event.name(), listeners.len());

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!("Sync listener panicked while handling {}", event.name());
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry.listeners).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
