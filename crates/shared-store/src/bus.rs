//! Transport boundary - named services with request/response and notify
//!
//! The session layer decides which peer hosts. A host shares a service under
//! the application's service name; guests obtain a proxy to it. Host notifies
//! reach every guest proxy, guest notifies and requests reach the host.

use crate::error::TransportError;
use crate::types::ReplicatorRole;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Handler answering an inbound request
pub type RequestHandler = Arc<dyn Fn(Value) -> Result<Value, TransportError> + Send + Sync>;

/// Handler receiving an inbound notification
pub type NotifyHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// One end of a shared service
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    /// Service name
    fn name(&self) -> &str;

    /// Whether the other side runs this service
    fn is_available(&self) -> bool;

    /// Register the handler for an inbound request, replacing any previous one
    fn on_request(&self, request: &str, handler: RequestHandler);

    /// Register the handler for an inbound notification, replacing any previous one
    fn on_notify(&self, notification: &str, handler: NotifyHandler);

    /// Send a request and wait for its result
    async fn request(&self, request: &str, args: Value) -> Result<Value, TransportError>;

    /// Fire-and-forget notification
    ///
    /// Returns an error only when the notification could not be handed to
    /// the transport; delivery is never confirmed.
    fn notify(&self, notification: &str, args: Value) -> Result<(), TransportError>;

    /// Drop all handlers and stop sharing or observing the service
    fn close(&self);
}

/// Session collaborator providing roles and services
#[async_trait]
pub trait ActionBus: Send + Sync {
    /// Current role of this peer
    fn role(&self) -> ReplicatorRole;

    /// Stream of role changes
    fn role_changes(&self) -> broadcast::Receiver<ReplicatorRole>;

    /// Share a service as host
    async fn share_service(&self, name: &str) -> Result<Arc<dyn ServiceHandle>, TransportError>;

    /// Obtain a proxy to the host's service as guest
    async fn get_service_proxy(&self, name: &str)
        -> Result<Arc<dyn ServiceHandle>, TransportError>;
}

/// Registered request and notify handlers of one service end
#[derive(Default)]
pub struct HandlerTable {
    requests: RwLock<HashMap<String, RequestHandler>>,
    notifies: RwLock<HashMap<String, NotifyHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request(&self, request: &str, handler: RequestHandler) {
        self.requests.write().insert(request.to_string(), handler);
    }

    pub fn set_notify(&self, notification: &str, handler: NotifyHandler) {
        self.notifies.write().insert(notification.to_string(), handler);
    }

    /// Invoke the request handler; the table lock is not held during the call
    pub fn handle_request(&self, request: &str, args: Value) -> Result<Value, TransportError> {
        let handler = self.requests.read().get(request).cloned();
        match handler {
            Some(handler) => handler(args),
            None => Err(TransportError::NoHandler(request.to_string())),
        }
    }

    /// Invoke the notify handler, returning false when none is registered
    pub fn handle_notify(&self, notification: &str, args: Value) -> bool {
        let handler = self.notifies.read().get(notification).cloned();
        match handler {
            Some(handler) => {
                handler(args);
                true
            }
            None => {
                tracing::trace!("No handler for notification {}", notification);
                false
            }
        }
    }

    pub fn clear(&self) {
        self.requests.write().clear();
        self.notifies.write().clear();
    }
}

/// Current role plus change notifications, shared by transports
pub struct RoleCell {
    role: RwLock<ReplicatorRole>,
    changes: broadcast::Sender<ReplicatorRole>,
}

impl RoleCell {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            role: RwLock::new(ReplicatorRole::None),
            changes,
        }
    }

    pub fn get(&self) -> ReplicatorRole {
        *self.role.read()
    }

    /// Update the role and notify listeners if it changed
    pub fn set(&self, role: ReplicatorRole) {
        {
            let mut current = self.role.write();
            if *current == role {
                return;
            }
            *current = role;
        }
        tracing::debug!("Session role changed to {:?}", role);
        let _ = self.changes.send(role);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicatorRole> {
        self.changes.subscribe()
    }
}

impl Default for RoleCell {
    fn default() -> Self {
        Self::new()
    }
}
