//! Replication middleware - routes each dispatched action
//!
//! 1. The reserved reset action is always applied directly.
//! 2. Actions rejected by the application filter are applied directly.
//! 3. With an active replicator the action enters the protocol.
//! 4. Otherwise (no session, or degraded) the action is applied directly.

use crate::guest::GuestReplicator;
use crate::host::HostReplicator;
use crate::tracker::AppState;
use crate::types::{Action, ReplicationStatus, ReplicatorRole, SequenceId};
use parking_lot::RwLock;
use std::sync::Arc;

/// Predicate selecting which actions are replicated
pub type ActionFilter = Arc<dyn Fn(&Action) -> bool + Send + Sync>;

/// The replicator for the current role; at most one is live
pub enum ActiveReplicator<S> {
    Inactive,
    Host(Arc<HostReplicator<S>>),
    Guest(Arc<GuestReplicator<S>>),
    /// Session role without a usable shared service
    Degraded(ReplicatorRole),
}

impl<S: AppState> ActiveReplicator<S> {
    pub fn role(&self) -> ReplicatorRole {
        match self {
            ActiveReplicator::Inactive => ReplicatorRole::None,
            ActiveReplicator::Host(_) => ReplicatorRole::Host,
            ActiveReplicator::Guest(_) => ReplicatorRole::Guest,
            ActiveReplicator::Degraded(role) => *role,
        }
    }

    /// Make the replicator inert
    pub fn teardown(&self) {
        match self {
            ActiveReplicator::Host(host) => host.teardown(),
            ActiveReplicator::Guest(guest) => guest.teardown(),
            ActiveReplicator::Inactive | ActiveReplicator::Degraded(_) => {}
        }
    }
}

/// Where an action goes next
pub(crate) enum Route<S> {
    Apply,
    Host(Arc<HostReplicator<S>>),
    Guest(Arc<GuestReplicator<S>>),
}

pub struct ReplicationMiddleware<S> {
    filter: Option<ActionFilter>,
    active: RwLock<ActiveReplicator<S>>,
}

impl<S: AppState> ReplicationMiddleware<S> {
    pub fn new(filter: Option<ActionFilter>) -> Self {
        Self {
            filter,
            active: RwLock::new(ActiveReplicator::Inactive),
        }
    }

    /// Whether an action takes part in replication at all
    pub fn is_replicated(&self, action: &Action) -> bool {
        if action.is_set_initial_state() {
            return false;
        }
        match &self.filter {
            Some(filter) => filter(action),
            None => true,
        }
    }

    pub(crate) fn route(&self, action: &Action) -> Route<S> {
        if !self.is_replicated(action) {
            return Route::Apply;
        }
        match &*self.active.read() {
            ActiveReplicator::Host(host) => Route::Host(host.clone()),
            ActiveReplicator::Guest(guest) => Route::Guest(guest.clone()),
            ActiveReplicator::Inactive | ActiveReplicator::Degraded(_) => Route::Apply,
        }
    }

    /// Install a replicator, returning the previous one
    pub(crate) fn replace(&self, replicator: ActiveReplicator<S>) -> ActiveReplicator<S> {
        std::mem::replace(&mut *self.active.write(), replicator)
    }

    pub fn role(&self) -> ReplicatorRole {
        self.active.read().role()
    }

    pub fn status(&self) -> ReplicationStatus {
        match &*self.active.read() {
            ActiveReplicator::Inactive => ReplicationStatus::Inactive,
            ActiveReplicator::Host(_) => ReplicationStatus::Hosting,
            ActiveReplicator::Guest(guest) => guest.status(),
            ActiveReplicator::Degraded(_) => ReplicationStatus::Degraded,
        }
    }

    /// Next sequence id and parked action count of the live replicator
    pub fn sequence_position(&self) -> (SequenceId, usize) {
        match &*self.active.read() {
            ActiveReplicator::Host(host) => (host.next_sequence_id(), 0),
            ActiveReplicator::Guest(guest) => (guest.expected_sequence_id(), guest.pending_len()),
            ActiveReplicator::Inactive | ActiveReplicator::Degraded(_) => (0, 0),
        }
    }
}
