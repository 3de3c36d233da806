//! Host replicator - stamps actions and relays them to guests

use crate::bus::ServiceHandle;
use crate::error::{ReplicationError, TransportError};
use crate::store::Dispatcher;
use crate::tracker::AppState;
use crate::types::{Action, SequenceId, StateSnapshot, DISPATCH_NOTIFICATION, GET_STATE_REQUEST};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Host side of a replication session
///
/// Answers bootstrap requests, linearizes guest proposals through the local
/// pipeline and relays every stamped action to all guests.
pub struct HostReplicator<S> {
    /// Shared service guests attach to
    service: Arc<dyn ServiceHandle>,
    /// Local pipeline
    dispatcher: Dispatcher<S>,
    /// Next id to stamp; held while stamping and folding
    next_sequence_id: Mutex<SequenceId>,
    active: AtomicBool,
}

impl<S: AppState> HostReplicator<S> {
    /// Create the host and register its handlers on the shared service
    pub(crate) fn start(service: Arc<dyn ServiceHandle>, dispatcher: Dispatcher<S>) -> Arc<Self> {
        let host = Arc::new(Self {
            service: service.clone(),
            dispatcher,
            next_sequence_id: Mutex::new(0),
            active: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&host);
        service.on_request(
            GET_STATE_REQUEST,
            Arc::new(move |_args: Value| -> Result<Value, TransportError> {
                let host = weak.upgrade().ok_or(TransportError::Closed)?;
                let snapshot = host
                    .snapshot()
                    .map_err(|e| TransportError::Remote(e.to_string()))?;
                tracing::info!(
                    "Serving snapshot to guest at sequence {}",
                    snapshot.next_sequence_id
                );
                Ok(serde_json::to_value(snapshot)?)
            }),
        );

        let weak = Arc::downgrade(&host);
        service.on_notify(
            DISPATCH_NOTIFICATION,
            Arc::new(move |args: Value| {
                if let Some(host) = weak.upgrade() {
                    host.accept_remote(args);
                }
            }),
        );

        tracing::info!("Hosting shared state on service {}", service.name());
        host
    }

    /// Current state with the id that will be stamped next
    ///
    /// Taken under the stamping lock, so `next_sequence_id` always equals the
    /// number of stamped actions folded into `state`.
    pub fn snapshot(&self) -> Result<StateSnapshot, ReplicationError> {
        let next = self.next_sequence_id.lock();
        let state = self.dispatcher.latest_state()?;
        Ok(StateSnapshot {
            state,
            next_sequence_id: *next,
        })
    }

    /// Stamp an action, fold it locally, then relay it to guests
    pub fn handle(&self, mut action: Action) -> Result<(), ReplicationError> {
        if !self.is_active() {
            return Err(ReplicationError::SessionEnded);
        }

        let stamped = {
            let mut next = self.next_sequence_id.lock();
            let sequence_id = *next;
            action.sequence_id = Some(sequence_id);
            self.dispatcher.apply(action.clone())?;
            *next = sequence_id + 1;
            action
        };

        self.dispatcher.record(|stats| stats.actions_stamped += 1);
        // Already folded here, so a failed relay must not fail the dispatch
        match self.service.notify(DISPATCH_NOTIFICATION, stamped.to_value()?) {
            Ok(()) => {
                self.dispatcher.record(|stats| stats.actions_relayed += 1);
                tracing::debug!(
                    "Relayed {} as sequence {:?}",
                    stamped.kind,
                    stamped.sequence_id
                );
            }
            Err(e) => tracing::error!(
                "Failed to relay sequence {:?}: {}",
                stamped.sequence_id,
                e
            ),
        }
        Ok(())
    }

    /// A guest proposal; replicated kinds go through the local pipeline like any action
    fn accept_remote(&self, args: Value) {
        if !self.is_active() {
            return;
        }
        match Action::from_value(args) {
            Ok(action) if !self.dispatcher.is_replicated(&action) => {
                // Applying it here alone would fork the host from its guests
                tracing::warn!("Dropping non-replicated action {} from guest", action.kind);
                self.dispatcher.record(|stats| stats.actions_dropped += 1);
            }
            Ok(mut action) => {
                // Guests never order actions themselves
                action.sequence_id = None;
                if let Err(e) = self.dispatcher.dispatch(action) {
                    tracing::warn!("Failed to dispatch guest action: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("Dropping malformed action from guest: {}", e);
                self.dispatcher.record(|stats| stats.actions_dropped += 1);
            }
        }
    }

    /// Stop serving; later requests and notifications are ignored
    pub fn teardown(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.service.close();
            tracing::info!(
                "Stopped hosting after {} actions",
                self.next_sequence_id()
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn next_sequence_id(&self) -> SequenceId {
        *self.next_sequence_id.lock()
    }
}
