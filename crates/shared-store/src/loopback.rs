//! In-process transport connecting peers of one process
//!
//! Delivery is synchronous: a notify runs the receiving handlers before it
//! returns, so multi-peer scenarios are deterministic.

use crate::bus::{ActionBus, HandlerTable, NotifyHandler, RequestHandler, RoleCell, ServiceHandle};
use crate::error::TransportError;
use crate::types::ReplicatorRole;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Hub holding the services shared by the current host
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    services: Arc<RwLock<HashMap<String, Arc<LoopbackService>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a peer attached to this network
    pub fn peer(&self) -> LoopbackPeer {
        LoopbackPeer {
            network: self.clone(),
            role: Arc::new(RoleCell::new()),
        }
    }

    /// Number of guest proxies attached to a service
    pub fn guest_count(&self, name: &str) -> usize {
        self.services
            .read()
            .get(name)
            .map(|service| service.live_proxies().len())
            .unwrap_or(0)
    }
}

/// One peer's view of the network
#[derive(Clone)]
pub struct LoopbackPeer {
    network: LoopbackNetwork,
    role: Arc<RoleCell>,
}

impl LoopbackPeer {
    /// Simulate a session lifecycle event
    pub fn set_role(&self, role: ReplicatorRole) {
        self.role.set(role);
    }
}

#[async_trait]
impl ActionBus for LoopbackPeer {
    fn role(&self) -> ReplicatorRole {
        self.role.get()
    }

    fn role_changes(&self) -> broadcast::Receiver<ReplicatorRole> {
        self.role.subscribe()
    }

    async fn share_service(&self, name: &str) -> Result<Arc<dyn ServiceHandle>, TransportError> {
        let service = Arc::new(LoopbackService {
            name: name.to_string(),
            handlers: HandlerTable::new(),
            proxies: RwLock::new(Vec::new()),
            network: Arc::downgrade(&self.network.services),
            open: AtomicBool::new(true),
        });
        if let Some(previous) = self
            .network
            .services
            .write()
            .insert(name.to_string(), service.clone())
        {
            tracing::warn!("Service {} shared again, replacing previous host", name);
            previous.open.store(false, Ordering::SeqCst);
        }
        Ok(service)
    }

    async fn get_service_proxy(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ServiceHandle>, TransportError> {
        let service = self.network.services.read().get(name).cloned();
        let proxy = Arc::new(LoopbackProxy {
            name: name.to_string(),
            handlers: HandlerTable::new(),
            service: service.as_ref().map(Arc::downgrade).unwrap_or_default(),
            open: AtomicBool::new(service.is_some()),
        });
        if let Some(service) = service {
            let mut proxies = service.proxies.write();
            proxies.retain(|proxy| proxy.strong_count() > 0);
            proxies.push(Arc::downgrade(&proxy));
        }
        Ok(proxy)
    }
}

/// Host end of a shared service
pub struct LoopbackService {
    name: String,
    handlers: HandlerTable,
    proxies: RwLock<Vec<Weak<LoopbackProxy>>>,
    network: Weak<RwLock<HashMap<String, Arc<LoopbackService>>>>,
    open: AtomicBool,
}

impl LoopbackService {
    fn live_proxies(&self) -> Vec<Arc<LoopbackProxy>> {
        self.proxies
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|proxy| proxy.open.load(Ordering::SeqCst))
            .collect()
    }
}

#[async_trait]
impl ServiceHandle for LoopbackService {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_request(&self, request: &str, handler: RequestHandler) {
        self.handlers.set_request(request, handler);
    }

    fn on_notify(&self, notification: &str, handler: NotifyHandler) {
        self.handlers.set_notify(notification, handler);
    }

    async fn request(&self, _request: &str, _args: Value) -> Result<Value, TransportError> {
        Err(TransportError::Unsupported("requests from the host side"))
    }

    fn notify(&self, notification: &str, args: Value) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::ServiceUnavailable(self.name.clone()));
        }
        for proxy in self.live_proxies() {
            proxy.handlers.handle_notify(notification, args.clone());
        }
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.handlers.clear();
        if let Some(services) = self.network.upgrade() {
            let mut services = services.write();
            let ours = services
                .get(&self.name)
                .map(|service| std::ptr::eq(service.as_ref(), self))
                .unwrap_or(false);
            if ours {
                services.remove(&self.name);
            }
        }
    }
}

/// Guest end of a shared service
pub struct LoopbackProxy {
    name: String,
    handlers: HandlerTable,
    service: Weak<LoopbackService>,
    open: AtomicBool,
}

impl LoopbackProxy {
    fn host(&self) -> Result<Arc<LoopbackService>, TransportError> {
        self.service
            .upgrade()
            .filter(|service| service.is_available() && self.open.load(Ordering::SeqCst))
            .ok_or_else(|| TransportError::ServiceUnavailable(self.name.clone()))
    }
}

#[async_trait]
impl ServiceHandle for LoopbackProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.host().is_ok()
    }

    fn on_request(&self, request: &str, handler: RequestHandler) {
        self.handlers.set_request(request, handler);
    }

    fn on_notify(&self, notification: &str, handler: NotifyHandler) {
        self.handlers.set_notify(notification, handler);
    }

    async fn request(&self, request: &str, args: Value) -> Result<Value, TransportError> {
        self.host()?.handlers.handle_request(request, args)
    }

    fn notify(&self, notification: &str, args: Value) -> Result<(), TransportError> {
        self.host()?.handlers.handle_notify(notification, args);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.handlers.clear();
    }
}
