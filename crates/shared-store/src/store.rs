//! Shared store - the state container applications dispatch into

use crate::error::ReplicationError;
use crate::middleware::{ActionFilter, ReplicationMiddleware, Route};
use crate::tracker::{AppState, Reducer, SharedStateTracker};
use crate::types::{
    Action, ReplicationConfig, ReplicationStats, ReplicationStatus, ReplicatorRole,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// An action folded into the local replica, with the resulting state
#[derive(Debug, Clone)]
pub struct StoreEvent<S> {
    pub action: Action,
    pub state: S,
}

pub(crate) struct StoreCore<S> {
    tracker: SharedStateTracker<S>,
    middleware: ReplicationMiddleware<S>,
    events: broadcast::Sender<StoreEvent<S>>,
    stats: RwLock<ReplicationStats>,
    config: ReplicationConfig,
}

impl<S: AppState> StoreCore<S> {
    /// Run an action through the middleware
    fn dispatch(&self, action: Action) -> Result<(), ReplicationError> {
        match self.middleware.route(&action) {
            Route::Apply => {
                self.apply(action);
                Ok(())
            }
            Route::Host(host) => host.handle(action),
            Route::Guest(guest) => guest.handle(action),
        }
    }

    /// Fold an action into the replica and notify subscribers
    fn apply(&self, action: Action) {
        let state = self.tracker.apply(&action);
        self.stats.write().actions_applied += 1;
        tracing::trace!("Applied {} (sequence {:?})", action.kind, action.sequence_id);
        // No receivers is fine
        let _ = self.events.send(StoreEvent { action, state });
    }
}

/// Handle replicators use to reach the store without keeping it alive
pub(crate) struct Dispatcher<S> {
    core: Weak<StoreCore<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<S: AppState> Dispatcher<S> {
    fn core(&self) -> Result<Arc<StoreCore<S>>, ReplicationError> {
        self.core.upgrade().ok_or(ReplicationError::StoreDropped)
    }

    /// Full pipeline, as if the application dispatched
    pub(crate) fn dispatch(&self, action: Action) -> Result<(), ReplicationError> {
        self.core()?.dispatch(action)
    }

    /// Skip the middleware and fold directly
    pub(crate) fn apply(&self, action: Action) -> Result<(), ReplicationError> {
        self.core()?.apply(action);
        Ok(())
    }

    /// Whether the store's middleware sends `action` through replication
    pub(crate) fn is_replicated(&self, action: &Action) -> bool {
        self.core
            .upgrade()
            .map(|core| core.middleware.is_replicated(action))
            .unwrap_or(false)
    }

    pub(crate) fn latest_state(&self) -> Result<Value, ReplicationError> {
        let state = self.core()?.tracker.latest();
        Ok(serde_json::to_value(state)?)
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut ReplicationStats)) {
        if let Some(core) = self.core.upgrade() {
            update(&mut *core.stats.write());
        }
    }
}

/// Replicated state container
///
/// With no active session every dispatch folds straight into the local state.
/// While hosting or attached as guest, dispatches go through the replication
/// protocol and subscribers observe actions in the host's total order.
pub struct SharedStore<S> {
    core: Arc<StoreCore<S>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<S: AppState> SharedStore<S> {
    pub fn builder(reducer: impl Reducer<S> + 'static, initial: S) -> SharedStoreBuilder<S> {
        SharedStoreBuilder::new(reducer, initial)
    }

    /// Dispatch an action
    ///
    /// Never waits on the network. A guest's own actions show up in the state
    /// only once the host has ordered them.
    pub fn dispatch(&self, action: Action) -> Result<(), ReplicationError> {
        self.core.dispatch(action)
    }

    /// Current local state
    pub fn state(&self) -> S {
        self.core.tracker.latest()
    }

    /// Subscribe to applied actions
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<S>> {
        self.core.events.subscribe()
    }

    pub fn role(&self) -> ReplicatorRole {
        self.core.middleware.role()
    }

    pub fn status(&self) -> ReplicationStatus {
        self.core.middleware.status()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.core.config
    }

    /// Get current stats
    pub fn stats(&self) -> ReplicationStats {
        let mut stats = self.core.stats.read().clone();
        stats.role = self.role();
        stats.status = self.status();
        let (next_sequence_id, pending_actions) = self.core.middleware.sequence_position();
        stats.next_sequence_id = next_sequence_id;
        stats.pending_actions = pending_actions;
        stats
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher<S> {
        Dispatcher {
            core: Arc::downgrade(&self.core),
        }
    }

    pub(crate) fn middleware(&self) -> &ReplicationMiddleware<S> {
        &self.core.middleware
    }
}

/// Builder for SharedStore
pub struct SharedStoreBuilder<S> {
    tracker: SharedStateTracker<S>,
    filter: Option<ActionFilter>,
    config: ReplicationConfig,
}

impl<S: AppState> SharedStoreBuilder<S> {
    pub fn new(reducer: impl Reducer<S> + 'static, initial: S) -> Self {
        Self {
            tracker: SharedStateTracker::new(reducer, initial),
            filter: None,
            config: ReplicationConfig::default(),
        }
    }

    /// Only actions accepted by `filter` are replicated; the rest stay local
    pub fn filter(mut self, filter: impl Fn(&Action) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.config.app_id = app_id.to_string();
        self
    }

    pub fn bootstrap_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.bootstrap_timeout_ms = timeout_ms;
        self
    }

    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SharedStore<S> {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        SharedStore {
            core: Arc::new(StoreCore {
                tracker: self.tracker,
                middleware: ReplicationMiddleware::new(self.filter),
                events,
                stats: RwLock::new(ReplicationStats::default()),
                config: self.config,
            }),
        }
    }
}
