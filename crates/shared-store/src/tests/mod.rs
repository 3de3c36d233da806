//! Shared fixtures for unit and scenario tests

use crate::types::Action;
use serde::{Deserialize, Serialize};

mod replication_test;

/// Counter application state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Counter {
    pub counter: i64,
}

/// Counter reducer; unknown actions leave the state unchanged
pub(crate) fn counter(state: &Counter, action: &Action) -> Counter {
    match action.kind.as_str() {
        "INCREMENT" => Counter {
            counter: state.counter + 1,
        },
        "DECREMENT" => Counter {
            counter: state.counter - 1,
        },
        _ => state.clone(),
    }
}
