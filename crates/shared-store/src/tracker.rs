//! Shared state tracker - folds actions into the replica

use crate::types::Action;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

/// Bounds for application state carried across peers
pub trait AppState: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> AppState for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Application-supplied pure reducing function
pub trait Reducer<S>: Send + Sync {
    fn reduce(&self, state: &S, action: &Action) -> S;
}

impl<S, F> Reducer<S> for F
where
    F: Fn(&S, &Action) -> S + Send + Sync,
{
    fn reduce(&self, state: &S, action: &Action) -> S {
        self(state, action)
    }
}

/// Wraps the reducer and records the latest state
pub struct SharedStateTracker<S> {
    reducer: Box<dyn Reducer<S>>,
    latest: RwLock<S>,
}

impl<S: AppState> SharedStateTracker<S> {
    pub fn new(reducer: impl Reducer<S> + 'static, initial: S) -> Self {
        Self {
            reducer: Box::new(reducer),
            latest: RwLock::new(initial),
        }
    }

    /// Compute the state after `action`
    ///
    /// The reset action returns its payload verbatim and ignores `current`.
    pub fn fold(&self, current: &S, action: &Action) -> S {
        if action.is_set_initial_state() {
            match serde_json::from_value::<S>(action.payload.clone()) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Ignoring undecodable initial state: {}", e);
                    current.clone()
                }
            }
        } else {
            self.reducer.reduce(current, action)
        }
    }

    /// Fold an action into the recorded state and return the result
    pub fn apply(&self, action: &Action) -> S {
        let mut latest = self.latest.write();
        let next = self.fold(&latest, action);
        *latest = next.clone();
        next
    }

    /// Latest recorded state
    pub fn latest(&self) -> S {
        self.latest.read().clone()
    }
}
