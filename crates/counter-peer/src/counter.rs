//! Counter application - state, reducer and console commands

use anyhow::bail;
use serde::{Deserialize, Serialize};
use shared_store::{Action, ReplicationError, SharedStore};
use std::str::FromStr;
use std::time::Duration;

pub const INCREMENT: &str = "INCREMENT";
pub const DECREMENT: &str = "DECREMENT";

/// Delay before `increment-async` dispatches
const ASYNC_DELAY: Duration = Duration::from_secs(1);

/// Replicated counter state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub counter: i64,
}

pub fn reduce(state: &Counter, action: &Action) -> Counter {
    match action.kind.as_str() {
        INCREMENT => Counter {
            counter: state.counter + 1,
        },
        DECREMENT => Counter {
            counter: state.counter - 1,
        },
        _ => state.clone(),
    }
}

/// Console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Increment,
    Decrement,
    /// Increment only when the current value is odd
    IncrementIfOdd,
    /// Increment after a delay
    IncrementAsync,
    Status,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> anyhow::Result<Self> {
        let command = match input.trim().to_ascii_lowercase().as_str() {
            "increment" | "+" => Command::Increment,
            "decrement" | "-" => Command::Decrement,
            "increment-if-odd" | "incrementifodd" => Command::IncrementIfOdd,
            "increment-async" | "incrementasync" => Command::IncrementAsync,
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            other => bail!(
                "Unknown command '{}' (increment, decrement, increment-if-odd, increment-async, status, quit)",
                other
            ),
        };
        Ok(command)
    }
}

/// Dispatch the actions behind a counter command
pub fn execute(store: &SharedStore<Counter>, command: Command) -> Result<(), ReplicationError> {
    match command {
        Command::Increment => store.dispatch(Action::new(INCREMENT)),
        Command::Decrement => store.dispatch(Action::new(DECREMENT)),
        Command::IncrementIfOdd => {
            if store.state().counter % 2 != 0 {
                store.dispatch(Action::new(INCREMENT))
            } else {
                Ok(())
            }
        }
        Command::IncrementAsync => {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ASYNC_DELAY).await;
                if let Err(e) = store.dispatch(Action::new(INCREMENT)) {
                    tracing::warn!("Delayed increment failed: {}", e);
                }
            });
            Ok(())
        }
        Command::Status | Command::Quit => Ok(()),
    }
}
