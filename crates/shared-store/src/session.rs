//! Session driver - follows role changes and swaps replicators
//!
//! Transitions: `None -> Host`, `None -> Guest`, `Host/Guest -> None`.
//! A direct switch between Host and Guest passes through `None`.

use crate::bus::ActionBus;
use crate::error::ReplicationError;
use crate::guest::GuestReplicator;
use crate::host::HostReplicator;
use crate::middleware::ActiveReplicator;
use crate::store::SharedStore;
use crate::tracker::AppState;
use crate::types::ReplicatorRole;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Binds a store to a session transport
pub struct SessionDriver<S> {
    store: SharedStore<S>,
    bus: Arc<dyn ActionBus>,
    service_name: String,
    bootstrap_timeout: Duration,
}

impl<S: AppState> SessionDriver<S> {
    pub fn new(store: SharedStore<S>, bus: Arc<dyn ActionBus>) -> Self {
        let config = store.config();
        let service_name = config.service_name();
        let bootstrap_timeout = Duration::from_millis(config.bootstrap_timeout_ms);
        Self {
            store,
            bus,
            service_name,
            bootstrap_timeout,
        }
    }

    pub fn store(&self) -> &SharedStore<S> {
        &self.store
    }

    /// Move the store to `role`
    ///
    /// Errors leave the store in an observable status: `Degraded` when the
    /// service is unavailable, `NotReady` when a guest bootstrap failed.
    pub async fn transition(&self, role: ReplicatorRole) -> Result<(), ReplicationError> {
        let current = self.store.role();
        if current == role {
            return Ok(());
        }
        if current != ReplicatorRole::None && role != ReplicatorRole::None {
            tracing::warn!(
                "Role changed from {:?} to {:?} without session end, leaving session first",
                current,
                role
            );
        }
        self.leave();

        match role {
            ReplicatorRole::None => Ok(()),
            ReplicatorRole::Host => self.host().await,
            ReplicatorRole::Guest => self.join().await,
        }
    }

    async fn host(&self) -> Result<(), ReplicationError> {
        let service = match self.bus.share_service(&self.service_name).await {
            Ok(service) if service.is_available() => service,
            Ok(_) => {
                tracing::error!(
                    "Failed to share service {}, continuing with local state",
                    self.service_name
                );
                self.degrade(ReplicatorRole::Host);
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Failed to share service {}: {}", self.service_name, e);
                self.degrade(ReplicatorRole::Host);
                return Err(e.into());
            }
        };

        let host = HostReplicator::start(service, self.store.dispatcher());
        self.store
            .middleware()
            .replace(ActiveReplicator::Host(host));
        Ok(())
    }

    async fn join(&self) -> Result<(), ReplicationError> {
        let service = match self.bus.get_service_proxy(&self.service_name).await {
            Ok(service) if service.is_available() => service,
            Ok(service) => {
                // Host does not run this application
                tracing::warn!(
                    "Service {} not available on host, continuing with local state",
                    self.service_name
                );
                service.close();
                self.degrade(ReplicatorRole::Guest);
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Failed to reach service {}: {}", self.service_name, e);
                self.degrade(ReplicatorRole::Guest);
                return Err(e.into());
            }
        };

        let guest = GuestReplicator::start(service, self.store.dispatcher());
        self.store
            .middleware()
            .replace(ActiveReplicator::Guest(guest.clone()));
        guest.attach(self.bootstrap_timeout).await
    }

    fn degrade(&self, role: ReplicatorRole) {
        self.store
            .middleware()
            .replace(ActiveReplicator::Degraded(role));
    }

    /// Tear down whatever replicator is live
    pub fn leave(&self) {
        let previous = self
            .store
            .middleware()
            .replace(ActiveReplicator::Inactive);
        if previous.role() != ReplicatorRole::None {
            tracing::info!("Leaving {:?} session", previous.role());
        }
        previous.teardown();
    }

    /// Follow the transport's role changes until it shuts down
    pub async fn run(self) {
        let mut roles = self.bus.role_changes();

        if let Err(e) = self.transition(self.bus.role()).await {
            tracing::warn!("Initial role transition failed: {}", e);
        }

        loop {
            let role = match roles.recv().await {
                Ok(role) => role,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} role changes, resyncing", n);
                    self.bus.role()
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(e) = self.transition(role).await {
                tracing::warn!("Role transition to {:?} failed: {}", role, e);
            }
        }

        self.leave();
        tracing::info!("Session driver stopped");
    }

    /// Run the driver on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
