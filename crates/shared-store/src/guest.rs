//! Guest replicator - mirrors the host and applies actions in host order

use crate::bus::ServiceHandle;
use crate::error::ReplicationError;
use crate::store::Dispatcher;
use crate::tracker::AppState;
use crate::types::{
    Action, ReplicationStatus, SequenceId, StateSnapshot, DISPATCH_NOTIFICATION,
    GET_STATE_REQUEST,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Attaching,
    Ready,
    NotReady,
}

struct GuestOrdering {
    phase: Phase,
    /// Next sequence id this replica may apply
    expected: SequenceId,
    /// Parked actions by sequence id; dropping a sender discards its action
    pending: HashMap<SequenceId, oneshot::Sender<()>>,
}

/// Guest side of a replication session
///
/// Local actions go to the host unapplied. Stamped actions from the host are
/// applied strictly in sequence order; an action whose predecessor has not
/// arrived yet is parked on a spawned task until the gap closes.
pub struct GuestReplicator<S> {
    /// Proxy to the host's service
    service: Arc<dyn ServiceHandle>,
    /// Local pipeline
    dispatcher: Dispatcher<S>,
    ordering: Mutex<GuestOrdering>,
    active: AtomicBool,
    runtime: Handle,
}

impl<S: AppState> GuestReplicator<S> {
    /// Create the guest and start listening for host actions
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn start(service: Arc<dyn ServiceHandle>, dispatcher: Dispatcher<S>) -> Arc<Self> {
        let guest = Arc::new(Self {
            service: service.clone(),
            dispatcher,
            ordering: Mutex::new(GuestOrdering {
                phase: Phase::Attaching,
                expected: 0,
                pending: HashMap::new(),
            }),
            active: AtomicBool::new(true),
            runtime: Handle::current(),
        });

        let weak = Arc::downgrade(&guest);
        service.on_notify(
            DISPATCH_NOTIFICATION,
            Arc::new(move |args: Value| {
                if let Some(guest) = weak.upgrade() {
                    guest.receive_remote(args);
                }
            }),
        );

        guest
    }

    /// Fetch the host snapshot and reset the replica to it
    ///
    /// On failure the replica stays `NotReady` and local dispatches are refused.
    pub async fn attach(&self, timeout: Duration) -> Result<(), ReplicationError> {
        tracing::info!("Requesting state from host on service {}", self.service.name());

        let response =
            tokio::time::timeout(timeout, self.service.request(GET_STATE_REQUEST, Value::Null))
                .await;
        let snapshot = match response {
            Err(_) => Err(ReplicationError::BootstrapTimeout(timeout.as_millis() as u64)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(value)) => serde_json::from_value::<StateSnapshot>(value).map_err(Into::into),
        };
        let snapshot = snapshot.and_then(|snapshot| {
            // The reset must decode into the application state
            serde_json::from_value::<S>(snapshot.state.clone())
                .map_err(ReplicationError::InvalidSnapshot)?;
            Ok(snapshot)
        });

        match snapshot {
            Ok(snapshot) => self.complete_attach(snapshot),
            Err(e) => {
                let mut ordering = self.ordering.lock();
                if ordering.phase == Phase::Attaching {
                    ordering.phase = Phase::NotReady;
                    self.discard_pending(&mut ordering, "bootstrap failed");
                }
                tracing::error!("Bootstrap from host failed, replica not ready: {}", e);
                Err(e)
            }
        }
    }

    fn complete_attach(&self, snapshot: StateSnapshot) -> Result<(), ReplicationError> {
        let mut ordering = self.ordering.lock();
        if !self.is_active() {
            return Err(ReplicationError::SessionEnded);
        }

        self.dispatcher
            .apply(Action::set_initial_state(snapshot.state))?;
        ordering.expected = snapshot.next_sequence_id;
        ordering.phase = Phase::Ready;

        // Actions relayed before the snapshot was taken are already in it
        let expected = ordering.expected;
        let stale: Vec<SequenceId> = ordering
            .pending
            .keys()
            .copied()
            .filter(|id| *id < expected)
            .collect();
        for id in &stale {
            ordering.pending.remove(id);
        }
        if !stale.is_empty() {
            tracing::debug!("Discarded {} actions contained in the snapshot", stale.len());
        }
        if let Some(resume) = ordering.pending.remove(&expected) {
            let _ = resume.send(());
        }

        tracing::info!("Attached to host at sequence {}", expected);
        Ok(())
    }

    /// Handle an action routed here by the middleware
    pub fn handle(self: &Arc<Self>, action: Action) -> Result<(), ReplicationError> {
        if !self.is_active() {
            return Err(ReplicationError::SessionEnded);
        }
        match action.sequence_id {
            Some(sequence_id) => self.receive(action, sequence_id),
            None => self.forward(action),
        }
    }

    /// Send a local action to the host; it applies once it comes back stamped
    fn forward(&self, action: Action) -> Result<(), ReplicationError> {
        if self.ordering.lock().phase == Phase::NotReady {
            return Err(ReplicationError::NotReady);
        }
        self.service
            .notify(DISPATCH_NOTIFICATION, action.to_value()?)?;
        self.dispatcher.record(|stats| stats.actions_forwarded += 1);
        tracing::debug!("Forwarded {} to host", action.kind);
        Ok(())
    }

    fn receive_remote(&self, args: Value) {
        match Action::from_value(args) {
            Ok(action) if action.is_stamped() => {
                if let Err(e) = self.dispatcher.dispatch(action) {
                    tracing::warn!("Failed to dispatch host action: {}", e);
                }
            }
            Ok(action) => {
                tracing::warn!("Dropping unstamped action {} from host", action.kind);
                self.dispatcher.record(|stats| stats.actions_dropped += 1);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed action from host: {}", e);
                self.dispatcher.record(|stats| stats.actions_dropped += 1);
            }
        }
    }

    fn receive(self: &Arc<Self>, action: Action, sequence_id: SequenceId) -> Result<(), ReplicationError> {
        let mut ordering = self.ordering.lock();
        match ordering.phase {
            Phase::NotReady => {
                tracing::debug!("Replica not ready, dropping sequence {}", sequence_id);
                self.dispatcher.record(|stats| stats.actions_dropped += 1);
                return Ok(());
            }
            Phase::Attaching => {
                self.park(&mut ordering, action, sequence_id);
                return Ok(());
            }
            Phase::Ready => {}
        }

        if sequence_id == ordering.expected {
            self.apply_next(&mut ordering, action)
        } else if sequence_id > ordering.expected {
            self.park(&mut ordering, action, sequence_id);
            Ok(())
        } else {
            // The host never stamps an id twice; nothing safe to do but drop it
            tracing::warn!(
                "Protocol violation: sequence {} already applied (expecting {}), dropping",
                sequence_id,
                ordering.expected
            );
            self.dispatcher.record(|stats| stats.actions_dropped += 1);
            Ok(())
        }
    }

    /// Apply the expected action and wake its successor if parked
    fn apply_next(&self, ordering: &mut GuestOrdering, action: Action) -> Result<(), ReplicationError> {
        self.dispatcher.apply(action)?;
        ordering.expected += 1;
        if let Some(resume) = ordering.pending.remove(&ordering.expected) {
            let _ = resume.send(());
        }
        Ok(())
    }

    fn park(self: &Arc<Self>, ordering: &mut GuestOrdering, action: Action, sequence_id: SequenceId) {
        if ordering.pending.contains_key(&sequence_id) {
            tracing::warn!("Sequence {} already parked, dropping duplicate", sequence_id);
            self.dispatcher.record(|stats| stats.actions_dropped += 1);
            return;
        }

        let (resume_tx, resume_rx) = oneshot::channel();
        ordering.pending.insert(sequence_id, resume_tx);
        self.dispatcher.record(|stats| stats.actions_parked += 1);
        tracing::debug!(
            "Parked sequence {} until {} arrives",
            sequence_id,
            ordering.expected
        );

        let guest: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            match resume_rx.await {
                Ok(()) => {
                    if let Some(guest) = guest.upgrade() {
                        guest.resume(action, sequence_id);
                    }
                }
                Err(_) => tracing::debug!("Parked sequence {} discarded", sequence_id),
            }
        });
    }

    fn resume(&self, action: Action, sequence_id: SequenceId) {
        let mut ordering = self.ordering.lock();
        if !self.is_active() {
            return;
        }
        if sequence_id != ordering.expected {
            tracing::warn!(
                "Resumed sequence {} but expecting {}, dropping",
                sequence_id,
                ordering.expected
            );
            self.dispatcher.record(|stats| stats.actions_dropped += 1);
            return;
        }
        if let Err(e) = self.apply_next(&mut ordering, action) {
            tracing::warn!("Failed to apply sequence {}: {}", sequence_id, e);
        }
    }

    fn discard_pending(&self, ordering: &mut GuestOrdering, reason: &str) {
        let parked = std::mem::take(&mut ordering.pending);
        if !parked.is_empty() {
            tracing::warn!("Rejecting {} parked actions: {}", parked.len(), reason);
            let count = parked.len() as u64;
            self.dispatcher.record(|stats| stats.actions_dropped += count);
        }
    }

    /// Leave the session, rejecting every parked action
    pub fn teardown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut ordering = self.ordering.lock();
            self.discard_pending(&mut ordering, "session ended");
        }
        self.service.close();
        tracing::info!("Detached from host");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ReplicationStatus {
        match self.ordering.lock().phase {
            Phase::Attaching => ReplicationStatus::Attaching,
            Phase::Ready => ReplicationStatus::Ready,
            Phase::NotReady => ReplicationStatus::NotReady,
        }
    }

    /// Next sequence id this replica will apply
    pub fn expected_sequence_id(&self) -> SequenceId {
        self.ordering.lock().expected
    }

    /// Number of parked actions
    pub fn pending_len(&self) -> usize {
        self.ordering.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HandlerTable, NotifyHandler, RequestHandler};
    use crate::error::TransportError;
    use crate::middleware::ActiveReplicator;
    use crate::store::{SharedStore, StoreEvent};
    use crate::tests::{counter, Counter};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast;

    /// Proxy answering `getState` with a fixed snapshot and recording notifies
    struct FakeHost {
        handlers: HandlerTable,
        snapshot: Option<Value>,
        forwarded: parking_lot::Mutex<Vec<Value>>,
    }

    impl FakeHost {
        fn new(snapshot: Option<Value>) -> Arc<Self> {
            Arc::new(Self {
                handlers: HandlerTable::new(),
                snapshot,
                forwarded: parking_lot::Mutex::new(Vec::new()),
            })
        }

        /// Deliver a host-relayed action to the guest
        fn relay(&self, kind: &str, sequence_id: u64) {
            let action = Action::new(kind).stamped(sequence_id);
            self.handlers
                .handle_notify(DISPATCH_NOTIFICATION, action.to_value().unwrap());
        }
    }

    #[async_trait]
    impl ServiceHandle for FakeHost {
        fn name(&self) -> &str {
            "test.shared-store"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn on_request(&self, request: &str, handler: RequestHandler) {
            self.handlers.set_request(request, handler);
        }

        fn on_notify(&self, notification: &str, handler: NotifyHandler) {
            self.handlers.set_notify(notification, handler);
        }

        async fn request(&self, _request: &str, _args: Value) -> Result<Value, TransportError> {
            match &self.snapshot {
                Some(snapshot) => Ok(snapshot.clone()),
                None => std::future::pending().await,
            }
        }

        fn notify(&self, _notification: &str, args: Value) -> Result<(), TransportError> {
            self.forwarded.lock().push(args);
            Ok(())
        }

        fn close(&self) {
            self.handlers.clear();
        }
    }

    async fn attached_guest(
        next_sequence_id: u64,
    ) -> (SharedStore<Counter>, Arc<GuestReplicator<Counter>>, Arc<FakeHost>) {
        let store = SharedStore::builder(counter, Counter::default()).build();
        let host = FakeHost::new(Some(json!({
            "state": { "counter": 10 },
            "nextSequenceId": next_sequence_id,
        })));
        let guest = GuestReplicator::start(host.clone(), store.dispatcher());
        store
            .middleware()
            .replace(ActiveReplicator::Guest(guest.clone()));
        guest.attach(Duration::from_secs(1)).await.unwrap();
        (store, guest, host)
    }

    async fn next_ids(events: &mut broadcast::Receiver<StoreEvent<Counter>>, n: usize) -> Vec<u64> {
        let mut ids = Vec::new();
        for _ in 0..n {
            let event = events.recv().await.unwrap();
            ids.push(event.action.sequence_id.unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn test_attach_resets_to_snapshot() {
        let (store, guest, _host) = attached_guest(5).await;

        assert_eq!(store.state(), Counter { counter: 10 });
        assert_eq!(guest.expected_sequence_id(), 5);
        assert_eq!(store.status(), ReplicationStatus::Ready);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let (store, guest, host) = attached_guest(0).await;
        let mut events = store.subscribe();

        host.relay("INCREMENT", 0);
        host.relay("DECREMENT", 2);
        assert_eq!(guest.pending_len(), 1);
        host.relay("INCREMENT", 1);

        assert_eq!(next_ids(&mut events, 3).await, vec![0, 1, 2]);
        assert_eq!(store.state(), Counter { counter: 11 });
        assert_eq!(guest.pending_len(), 0);
        assert_eq!(guest.expected_sequence_id(), 3);
    }

    #[tokio::test]
    async fn test_local_action_waits_for_host_order() {
        let (store, _guest, host) = attached_guest(3).await;
        let mut events = store.subscribe();

        store.dispatch(Action::new("INCREMENT")).unwrap();
        assert_eq!(store.state(), Counter { counter: 10 });
        assert_eq!(host.forwarded.lock().len(), 1);
        assert!(host.forwarded.lock()[0].get("sequenceId").is_none());

        // Our action comes back as 4 before another guest's 3 arrives
        host.relay("INCREMENT", 4);
        host.relay("DECREMENT", 3);

        assert_eq!(next_ids(&mut events, 2).await, vec![3, 4]);
        assert_eq!(store.state(), Counter { counter: 10 });
    }

    #[tokio::test]
    async fn test_stale_sequence_dropped() {
        let (store, guest, host) = attached_guest(2).await;

        host.relay("INCREMENT", 2);
        host.relay("INCREMENT", 1);
        host.relay("INCREMENT", 2);

        assert_eq!(store.state(), Counter { counter: 11 });
        assert_eq!(guest.expected_sequence_id(), 3);
        assert_eq!(store.stats().actions_dropped, 2);
    }

    #[tokio::test]
    async fn test_teardown_rejects_parked_actions() {
        let (store, guest, host) = attached_guest(0).await;

        host.relay("INCREMENT", 3);
        host.relay("INCREMENT", 5);
        assert_eq!(guest.pending_len(), 2);

        store.middleware().replace(ActiveReplicator::Inactive).teardown();
        assert_eq!(guest.pending_len(), 0);
        assert_eq!(store.stats().actions_dropped, 2);

        // Nothing applies once the parked tasks observe the rejection
        tokio::task::yield_now().await;
        assert_eq!(store.state(), Counter { counter: 10 });
        assert!(matches!(
            guest.handle(Action::new("INCREMENT")),
            Err(ReplicationError::SessionEnded)
        ));
    }

    #[tokio::test]
    async fn test_actions_before_snapshot() {
        let store = SharedStore::builder(counter, Counter::default()).build();
        let host = FakeHost::new(Some(json!({
            "state": { "counter": 1 },
            "nextSequenceId": 6,
        })));
        let guest = GuestReplicator::start(host.clone(), store.dispatcher());
        store
            .middleware()
            .replace(ActiveReplicator::Guest(guest.clone()));
        let mut events = store.subscribe();

        // Relayed while the snapshot request is in flight
        host.relay("INCREMENT", 5);
        host.relay("INCREMENT", 6);
        assert_eq!(store.status(), ReplicationStatus::Attaching);
        assert_eq!(store.state(), Counter::default());

        guest.attach(Duration::from_secs(1)).await.unwrap();

        let reset = events.recv().await.unwrap();
        assert!(reset.action.is_set_initial_state());
        assert_eq!(next_ids(&mut events, 1).await, vec![6]);
        assert_eq!(store.state(), Counter { counter: 2 });
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_not_ready() {
        let store = SharedStore::builder(counter, Counter { counter: 4 }).build();
        let host = FakeHost::new(None);
        let guest = GuestReplicator::start(host.clone(), store.dispatcher());
        store
            .middleware()
            .replace(ActiveReplicator::Guest(guest.clone()));

        let err = guest.attach(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::BootstrapTimeout(20)));
        assert_eq!(store.status(), ReplicationStatus::NotReady);
        assert!(matches!(
            store.dispatch(Action::new("INCREMENT")),
            Err(ReplicationError::NotReady)
        ));
        host.relay("INCREMENT", 0);
        assert_eq!(store.state(), Counter { counter: 4 });
    }

    #[tokio::test]
    async fn test_invalid_snapshot_not_ready() {
        let store = SharedStore::builder(counter, Counter::default()).build();
        let host = FakeHost::new(Some(json!({ "state": "garbage", "nextSequenceId": 0 })));
        let guest = GuestReplicator::start(host.clone(), store.dispatcher());
        store
            .middleware()
            .replace(ActiveReplicator::Guest(guest.clone()));

        let err = guest.attach(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidSnapshot(_)));
        assert_eq!(guest.status(), ReplicationStatus::NotReady);
    }
}
