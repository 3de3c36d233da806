//! Shared Store - host/guest replicated state container
//!
//! Architecture:
//! - Each peer runs a store folding actions through a reducer
//! - The session host stamps every action with a sequence id and relays it
//! - Guests bootstrap from the host snapshot, then apply in sequence order
//! - Without a session the store is an ordinary single-peer container

pub mod types;
pub mod error;
pub mod tracker;
pub mod bus;
pub mod middleware;
pub mod store;
pub mod host;
pub mod guest;
pub mod session;
pub mod loopback;
pub mod broadcast;

#[cfg(test)]
mod tests;

pub use types::*;
pub use error::{ReplicationError, TransportError};
pub use tracker::{AppState, Reducer, SharedStateTracker};
pub use bus::{ActionBus, ServiceHandle};
pub use middleware::{ActionFilter, ActiveReplicator, ReplicationMiddleware};
pub use store::{SharedStore, SharedStoreBuilder, StoreEvent};
pub use host::HostReplicator;
pub use guest::GuestReplicator;
pub use session::SessionDriver;
pub use loopback::{LoopbackNetwork, LoopbackPeer};
pub use broadcast::{WsGuestBus, WsHostBus};
