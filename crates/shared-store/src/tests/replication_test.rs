//! Replication Scenario Tests
//!
//! Peers in one process connected through the loopback network:
//! - Host ordering and guest convergence
//! - Late guests bootstrapping from the host snapshot
//! - Session lifecycle driven by role changes
//! - Local-only actions and degraded sessions
//! - The same protocol over the WebSocket transport

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::{counter, Counter};
use crate::{
    broadcast::{WsGuestBus, WsHostBus},
    bus::{ActionBus, ServiceHandle},
    loopback::{LoopbackNetwork, LoopbackPeer},
    session::SessionDriver,
    store::{SharedStore, StoreEvent},
    types::{Action, ReplicationStatus, ReplicatorRole},
};

const SERVICE: &str = "counter.shared-store";

/// Helper to build a counter store for the test application
fn counter_store() -> SharedStore<Counter> {
    SharedStore::builder(counter, Counter::default())
        .app_id("counter")
        .bootstrap_timeout_ms(500)
        .build()
}

/// Helper to bind a fresh store to a new peer on `network`
fn join_network(network: &LoopbackNetwork) -> (SessionDriver<Counter>, LoopbackPeer) {
    let peer = network.peer();
    let bus: Arc<dyn ActionBus> = Arc::new(peer.clone());
    (SessionDriver::new(counter_store(), bus), peer)
}

/// Helper to collect the sequence ids of already applied actions
fn drain_ids(events: &mut tokio::sync::broadcast::Receiver<StoreEvent<Counter>>) -> Vec<Option<u64>> {
    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        ids.push(event.action.sequence_id);
    }
    ids
}

/// Helper to wait until `check` holds
async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_guests_converge_on_host_order() {
    let network = LoopbackNetwork::new();
    let (host, _) = join_network(&network);
    let (alice, _) = join_network(&network);
    let (bob, _) = join_network(&network);

    host.transition(ReplicatorRole::Host).await.unwrap();
    alice.transition(ReplicatorRole::Guest).await.unwrap();
    bob.transition(ReplicatorRole::Guest).await.unwrap();
    assert_eq!(network.guest_count(SERVICE), 2);

    let mut host_events = host.store().subscribe();
    let mut alice_events = alice.store().subscribe();
    let mut bob_events = bob.store().subscribe();

    host.store().dispatch(Action::new("INCREMENT")).unwrap();
    alice.store().dispatch(Action::new("INCREMENT")).unwrap();
    bob.store().dispatch(Action::new("DECREMENT")).unwrap();
    alice.store().dispatch(Action::new("INCREMENT")).unwrap();

    let expected = vec![Some(0), Some(1), Some(2), Some(3)];
    assert_eq!(drain_ids(&mut host_events), expected);
    assert_eq!(drain_ids(&mut alice_events), expected);
    assert_eq!(drain_ids(&mut bob_events), expected);

    for store in [host.store(), alice.store(), bob.store()] {
        assert_eq!(store.state(), Counter { counter: 2 });
    }
    assert_eq!(host.store().stats().next_sequence_id, 4);
    assert_eq!(alice.store().stats().next_sequence_id, 4);
    assert_eq!(alice.store().stats().actions_forwarded, 2);
}

#[tokio::test]
async fn test_late_guest_bootstraps_from_snapshot() {
    let network = LoopbackNetwork::new();
    let (host, _) = join_network(&network);
    let (guest, _) = join_network(&network);

    host.transition(ReplicatorRole::Host).await.unwrap();
    for _ in 0..3 {
        host.store().dispatch(Action::new("INCREMENT")).unwrap();
    }

    let mut events = guest.store().subscribe();
    guest.transition(ReplicatorRole::Guest).await.unwrap();

    assert_eq!(guest.store().state(), Counter { counter: 3 });
    assert_eq!(guest.store().status(), ReplicationStatus::Ready);
    let reset = events.try_recv().unwrap();
    assert!(reset.action.is_set_initial_state());

    host.store().dispatch(Action::new("INCREMENT")).unwrap();
    assert_eq!(drain_ids(&mut events), vec![Some(3)]);
    assert_eq!(guest.store().state(), Counter { counter: 4 });
}

#[tokio::test]
async fn test_guest_only_sees_own_action_after_host_orders_it() {
    let network = LoopbackNetwork::new();
    let (host, _) = join_network(&network);
    let (guest, _) = join_network(&network);
    host.transition(ReplicatorRole::Host).await.unwrap();
    guest.transition(ReplicatorRole::Guest).await.unwrap();

    let mut events = guest.store().subscribe();
    guest.store().dispatch(Action::new("INCREMENT")).unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event.action.sequence_id, Some(0));
    assert_eq!(event.state, Counter { counter: 1 });
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reset_action_is_never_replicated() {
    let network = LoopbackNetwork::new();
    let (host, _) = join_network(&network);
    let (guest, _) = join_network(&network);
    host.transition(ReplicatorRole::Host).await.unwrap();
    guest.transition(ReplicatorRole::Guest).await.unwrap();

    host.store()
        .dispatch(Action::set_initial_state(json!({ "counter": 7 })))
        .unwrap();

    assert_eq!(host.store().state(), Counter { counter: 7 });
    assert_eq!(guest.store().state(), Counter::default());
    assert_eq!(host.store().stats().next_sequence_id, 0);
}

#[tokio::test]
async fn test_remote_reset_cannot_fork_host() {
    let network = LoopbackNetwork::new();
    let (host, _) = join_network(&network);
    let (guest, _) = join_network(&network);
    host.transition(ReplicatorRole::Host).await.unwrap();
    guest.transition(ReplicatorRole::Guest).await.unwrap();
    host.store().dispatch(Action::new("INCREMENT")).unwrap();

    // A peer talking to the service directly instead of through a store
    let rogue = network.peer().get_service_proxy(SERVICE).await.unwrap();
    rogue
        .notify(
            "dispatch",
            json!({ "kind": "setInitialState", "payload": { "counter": 99 } }),
        )
        .unwrap();

    assert_eq!(host.store().state(), guest.store().state());
    assert_eq!(host.store().state(), Counter { counter: 1 });
    assert_eq!(host.store().stats().next_sequence_id, 1);

    let (late, _) = join_network(&network);
    late.transition(ReplicatorRole::Guest).await.unwrap();
    assert_eq!(late.store().state(), Counter { counter: 1 });
}

#[tokio::test]
async fn test_filtered_actions_stay_local() {
    let network = LoopbackNetwork::new();
    let build = |network: &LoopbackNetwork| {
        let store = SharedStore::builder(
            |state: &Counter, action: &Action| match action.kind.as_str() {
                "LOCAL_INCREMENT" => Counter {
                    counter: state.counter + 1,
                },
                _ => counter(state, action),
            },
            Counter::default(),
        )
        .app_id("counter")
        .filter(|action| !action.kind.starts_with("LOCAL_"))
        .build();
        let bus: Arc<dyn ActionBus> = Arc::new(network.peer());
        SessionDriver::new(store, bus)
    };
    let host = build(&network);
    let guest = build(&network);
    host.transition(ReplicatorRole::Host).await.unwrap();
    guest.transition(ReplicatorRole::Guest).await.unwrap();

    host.store().dispatch(Action::new("LOCAL_INCREMENT")).unwrap();
    guest.store().dispatch(Action::new("LOCAL_INCREMENT")).unwrap();
    guest.store().dispatch(Action::new("LOCAL_INCREMENT")).unwrap();

    assert_eq!(host.store().state(), Counter { counter: 1 });
    assert_eq!(guest.store().state(), Counter { counter: 2 });
    assert_eq!(host.store().stats().next_sequence_id, 0);

    guest.store().dispatch(Action::new("INCREMENT")).unwrap();
    assert_eq!(host.store().state(), Counter { counter: 2 });
    assert_eq!(guest.store().state(), Counter { counter: 3 });
}

#[tokio::test]
async fn test_guest_without_host_service_degrades() {
    let network = LoopbackNetwork::new();
    let (guest, _) = join_network(&network);

    guest.transition(ReplicatorRole::Guest).await.unwrap();

    assert_eq!(guest.store().role(), ReplicatorRole::Guest);
    assert_eq!(guest.store().status(), ReplicationStatus::Degraded);
    guest.store().dispatch(Action::new("INCREMENT")).unwrap();
    assert_eq!(guest.store().state(), Counter { counter: 1 });
}

#[tokio::test]
async fn test_session_end_returns_to_local_mode() {
    let network = LoopbackNetwork::new();
    let (host, _) = join_network(&network);
    let (guest, _) = join_network(&network);
    host.transition(ReplicatorRole::Host).await.unwrap();
    guest.transition(ReplicatorRole::Guest).await.unwrap();
    host.store().dispatch(Action::new("INCREMENT")).unwrap();

    guest.transition(ReplicatorRole::None).await.unwrap();
    assert_eq!(guest.store().status(), ReplicationStatus::Inactive);
    assert_eq!(network.guest_count(SERVICE), 0);

    // Both sides keep their state and continue alone
    host.store().dispatch(Action::new("INCREMENT")).unwrap();
    guest.store().dispatch(Action::new("DECREMENT")).unwrap();
    assert_eq!(host.store().state(), Counter { counter: 2 });
    assert_eq!(guest.store().state(), Counter { counter: 0 });

    // A guest joining after the host left finds no service
    host.transition(ReplicatorRole::None).await.unwrap();
    let (late, _) = join_network(&network);
    late.transition(ReplicatorRole::Guest).await.unwrap();
    assert_eq!(late.store().status(), ReplicationStatus::Degraded);
}

#[tokio::test]
async fn test_driver_follows_role_changes() {
    let network = LoopbackNetwork::new();
    let (first, first_peer) = join_network(&network);
    let (second, second_peer) = join_network(&network);
    let first_store = first.store().clone();
    let second_store = second.store().clone();
    let first_task = first.spawn();
    let second_task = second.spawn();

    first_peer.set_role(ReplicatorRole::Host);
    wait_for(|| first_store.status() == ReplicationStatus::Hosting).await;
    second_peer.set_role(ReplicatorRole::Guest);
    wait_for(|| second_store.status() == ReplicationStatus::Ready).await;

    second_store.dispatch(Action::new("INCREMENT")).unwrap();
    assert_eq!(first_store.state(), Counter { counter: 1 });

    // Roles swap without an explicit session end in between
    first_peer.set_role(ReplicatorRole::None);
    wait_for(|| first_store.status() == ReplicationStatus::Inactive).await;
    second_peer.set_role(ReplicatorRole::Host);
    wait_for(|| second_store.status() == ReplicationStatus::Hosting).await;
    first_peer.set_role(ReplicatorRole::Guest);
    wait_for(|| first_store.status() == ReplicationStatus::Ready).await;

    first_store.dispatch(Action::new("INCREMENT")).unwrap();
    assert_eq!(first_store.state(), Counter { counter: 2 });
    assert_eq!(second_store.state(), Counter { counter: 2 });
    assert_eq!(second_store.stats().next_sequence_id, 1);

    first_task.abort();
    second_task.abort();
}

#[tokio::test]
async fn test_replication_over_websocket() {
    let host_bus = Arc::new(WsHostBus::new());
    let addr = host_bus.start("127.0.0.1:0").await.unwrap();
    let host_store = counter_store();
    let host_task = SessionDriver::new(host_store.clone(), host_bus.clone()).spawn();
    wait_for(|| host_store.status() == ReplicationStatus::Hosting).await;
    host_store.dispatch(Action::new("INCREMENT")).unwrap();

    let guest_bus = Arc::new(WsGuestBus::connect(&addr.to_string()).await.unwrap());
    let guest_store = counter_store();
    let guest_task = SessionDriver::new(guest_store.clone(), guest_bus).spawn();
    wait_for(|| guest_store.status() == ReplicationStatus::Ready).await;
    assert_eq!(guest_store.state(), Counter { counter: 1 });

    guest_store.dispatch(Action::new("INCREMENT")).unwrap();
    host_store.dispatch(Action::new("DECREMENT")).unwrap();
    guest_store.dispatch(Action::new("INCREMENT")).unwrap();

    wait_for(|| guest_store.stats().next_sequence_id == 4).await;
    assert_eq!(host_store.state(), Counter { counter: 2 });
    assert_eq!(guest_store.state(), Counter { counter: 2 });

    // Host shutdown ends the guest's session
    host_bus.stop();
    wait_for(|| guest_store.status() == ReplicationStatus::Inactive).await;
    guest_store.dispatch(Action::new("INCREMENT")).unwrap();
    assert_eq!(guest_store.state(), Counter { counter: 3 });

    host_task.abort();
    guest_task.abort();
}
