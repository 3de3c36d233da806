//! WebSocket transport for peers in different processes
//!
//! The host runs WsHostBus, guests connect with WsGuestBus. Frames are JSON
//! text messages; host notifies fan out to every connected guest.

use crate::bus::{ActionBus, HandlerTable, NotifyHandler, RequestHandler, RoleCell, ServiceHandle};
use crate::error::TransportError;
use crate::types::ReplicatorRole;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

/// Wire frames exchanged between host and guests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum BusFrame {
    /// Guest asking whether the host shares a service
    Discover { id: u64, service: String },
    Request {
        id: u64,
        service: String,
        name: String,
        args: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notify {
        service: String,
        name: String,
        args: Value,
    },
}

impl BusFrame {
    fn to_text(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    fn from_text(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    fn response(id: u64, result: Result<Value, TransportError>) -> Self {
        match result {
            Ok(value) => BusFrame::Response {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => BusFrame::Response {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

type ServiceMap = RwLock<HashMap<String, Arc<WsSharedService>>>;

/// Host side of the WebSocket transport
pub struct WsHostBus {
    /// Frames fanned out to every connected guest
    tx: broadcast::Sender<String>,
    services: Arc<ServiceMap>,
    guests: Arc<AtomicUsize>,
    role: RoleCell,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Closes every guest connection when set or dropped
    shutdown: watch::Sender<bool>,
}

impl WsHostBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        let (shutdown, _) = watch::channel(false);
        Self {
            tx,
            services: Arc::new(RwLock::new(HashMap::new())),
            guests: Arc::new(AtomicUsize::new(0)),
            role: RoleCell::new(),
            accept_task: Mutex::new(None),
            shutdown,
        }
    }

    /// Start listening for guest connections and take the host role
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Host listening on {}", local_addr);

        let tx = self.tx.clone();
        let services = self.services.clone();
        let guests = self.guests.clone();
        let shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::info!("Guest connected from {}", peer_addr);
                        let rx = tx.subscribe();
                        let services = services.clone();
                        let guests = guests.clone();
                        let shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_guest_connection(stream, rx, services, guests, shutdown)
                                    .await
                            {
                                tracing::warn!("Guest connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });
        if let Some(previous) = self.accept_task.lock().replace(task) {
            previous.abort();
        }

        self.role.set(ReplicatorRole::Host);
        Ok(local_addr)
    }

    /// Disconnect all guests and end the session
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let _ = self.shutdown.send(true);
        self.role.set(ReplicatorRole::None);
    }

    /// Get number of connected guests
    pub fn connected_guests(&self) -> usize {
        self.guests.load(Ordering::SeqCst)
    }
}

impl Default for WsHostBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WsHostBus {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ActionBus for WsHostBus {
    fn role(&self) -> ReplicatorRole {
        self.role.get()
    }

    fn role_changes(&self) -> broadcast::Receiver<ReplicatorRole> {
        self.role.subscribe()
    }

    async fn share_service(&self, name: &str) -> Result<Arc<dyn ServiceHandle>, TransportError> {
        let service = Arc::new(WsSharedService {
            name: name.to_string(),
            handlers: HandlerTable::new(),
            tx: self.tx.clone(),
            services: Arc::downgrade(&self.services),
            open: AtomicBool::new(true),
        });
        self.services
            .write()
            .insert(name.to_string(), service.clone());
        tracing::info!("Sharing service {}", name);
        Ok(service)
    }

    async fn get_service_proxy(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ServiceHandle>, TransportError> {
        tracing::warn!("Host cannot proxy service {}", name);
        Err(TransportError::Unsupported("service proxies on the host"))
    }
}

async fn handle_guest_connection(
    stream: TcpStream,
    mut rx: broadcast::Receiver<String>,
    services: Arc<ServiceMap>,
    guests: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    guests.fetch_add(1, Ordering::SeqCst);

    // Responses for this guest only
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(100);

    // Spawn task to forward broadcasts and replies to this guest
    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                _ = shutdown.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
                broadcast = rx.recv() => match broadcast {
                    Ok(text) => text,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // A gap here can never be closed, make the guest reattach
                        tracing::error!("Guest lagged {} messages, disconnecting", n);
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming frames from guest
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame = match BusFrame::from_text(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed frame from guest: {}", e);
                        continue;
                    }
                };
                let reply = match frame {
                    BusFrame::Discover { id, service } => {
                        let available = services
                            .read()
                            .get(&service)
                            .map(|s| s.is_available())
                            .unwrap_or(false);
                        Some(BusFrame::response(id, Ok(Value::Bool(available))))
                    }
                    BusFrame::Request {
                        id,
                        service,
                        name,
                        args,
                    } => {
                        let shared = services.read().get(&service).cloned();
                        let result = match shared {
                            Some(shared) => shared.handlers.handle_request(&name, args),
                            None => Err(TransportError::ServiceUnavailable(service)),
                        };
                        Some(BusFrame::response(id, result))
                    }
                    BusFrame::Notify {
                        service,
                        name,
                        args,
                    } => {
                        let shared = services.read().get(&service).cloned();
                        match shared {
                            Some(shared) => {
                                shared.handlers.handle_notify(&name, args);
                            }
                            None => tracing::debug!("Notify for unknown service {}", service),
                        }
                        None
                    }
                    BusFrame::Response { .. } => {
                        tracing::debug!("Unexpected response frame from guest");
                        None
                    }
                };
                if let Some(reply) = reply {
                    if reply_tx.send(reply.to_text()?).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    guests.fetch_sub(1, Ordering::SeqCst);
    tracing::info!("Guest disconnected");

    Ok(())
}

/// Host end of a service shared over WebSocket
pub struct WsSharedService {
    name: String,
    handlers: HandlerTable,
    tx: broadcast::Sender<String>,
    services: Weak<ServiceMap>,
    open: AtomicBool,
}

#[async_trait]
impl ServiceHandle for WsSharedService {
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
        let frame = BusFrame::Notify {
            service: self.name.clone(),
            name: notification.to_string(),
            args,
        };
        // No receivers means no guests yet
        let _ = self.tx.send(frame.to_text()?);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.handlers.clear();
        if let Some(services) = self.services.upgrade() {
            let mut services = services.write();
            let ours = services
                .get(&self.name)
                .map(|service| std::ptr::eq(service.as_ref(), self))
                .unwrap_or(false);
            if ours {
                services.remove(&self.name);
                tracing::info!("Unshared service {}", self.name);
            }
        }
    }
}

struct GuestConnection {
    outbound: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>,
    next_id: AtomicU64,
    proxies: RwLock<HashMap<String, Arc<WsServiceProxy>>>,
    role: RoleCell,
}

impl GuestConnection {
    async fn call(&self, frame: impl FnOnce(u64) -> BusFrame) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = frame(id).to_text()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);
        // Removes the entry if the caller gives up before the response
        let _pending = PendingRequest { connection: self, id };

        if self.outbound.send(text).await.is_err() {
            return Err(TransportError::Closed);
        }
        reply_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Queue a frame without waiting; a full queue is reported, not awaited
    fn send(&self, frame: BusFrame) -> Result<(), TransportError> {
        let text = frame.to_text()?;
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn on_frame(&self, frame: BusFrame) {
        match frame {
            BusFrame::Response { id, result, error } => {
                let Some(reply) = self.pending.lock().remove(&id) else {
                    tracing::debug!("Response for unknown request {}", id);
                    return;
                };
                let result = match error {
                    Some(error) => Err(TransportError::Remote(error)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(result);
            }
            BusFrame::Notify {
                service,
                name,
                args,
            } => {
                let proxy = self.proxies.read().get(&service).cloned();
                if let Some(proxy) = proxy {
                    proxy.handlers.handle_notify(&name, args);
                }
            }
            _ => tracing::debug!("Unexpected frame from host"),
        }
    }

    /// Fail every in-flight request and end the session
    fn disconnected(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, reply) in pending {
            let _ = reply.send(Err(TransportError::Closed));
        }
        self.role.set(ReplicatorRole::None);
    }
}

/// In-flight request entry, removed when the request completes or is dropped
struct PendingRequest<'a> {
    connection: &'a GuestConnection,
    id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.connection.pending.lock().remove(&self.id);
    }
}

/// Guest side of the WebSocket transport
pub struct WsGuestBus {
    connection: Arc<GuestConnection>,
}

impl WsGuestBus {
    /// Connect to the host and take the guest role
    pub async fn connect(host_addr: &str) -> anyhow::Result<Self> {
        let url = format!("ws://{}", host_addr);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        tracing::info!("Connected to host at {}", host_addr);

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(1024);
        let connection = Arc::new(GuestConnection {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            proxies: RwLock::new(HashMap::new()),
            role: RoleCell::new(),
        });

        // Spawn receiver task
        let receiver = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let Some(connection) = receiver.upgrade() else {
                    break;
                };
                match msg {
                    Ok(Message::Text(text)) => match BusFrame::from_text(&text) {
                        Ok(frame) => connection.on_frame(frame),
                        Err(e) => tracing::warn!("Ignoring malformed frame from host: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::warn!("Host closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            if let Some(connection) = receiver.upgrade() {
                connection.disconnected();
            }
        });

        // Spawn sender task
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        connection.role.set(ReplicatorRole::Guest);
        Ok(Self { connection })
    }
}

#[async_trait]
impl ActionBus for WsGuestBus {
    fn role(&self) -> ReplicatorRole {
        self.connection.role.get()
    }

    fn role_changes(&self) -> broadcast::Receiver<ReplicatorRole> {
        self.connection.role.subscribe()
    }

    async fn share_service(&self, name: &str) -> Result<Arc<dyn ServiceHandle>, TransportError> {
        tracing::warn!("Guest cannot share service {}", name);
        Err(TransportError::Unsupported("sharing services as guest"))
    }

    async fn get_service_proxy(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ServiceHandle>, TransportError> {
        let available = self
            .connection
            .call(|id| BusFrame::Discover {
                id,
                service: name.to_string(),
            })
            .await?
            .as_bool()
            .unwrap_or(false);

        let proxy = Arc::new(WsServiceProxy {
            name: name.to_string(),
            handlers: HandlerTable::new(),
            connection: Arc::downgrade(&self.connection),
            available: AtomicBool::new(available),
        });
        if available {
            self.connection
                .proxies
                .write()
                .insert(name.to_string(), proxy.clone());
        }
        Ok(proxy)
    }
}

/// Guest end of a service reached over WebSocket
pub struct WsServiceProxy {
    name: String,
    handlers: HandlerTable,
    connection: Weak<GuestConnection>,
    available: AtomicBool,
}

impl WsServiceProxy {
    fn connection(&self) -> Result<Arc<GuestConnection>, TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::ServiceUnavailable(self.name.clone()));
        }
        self.connection.upgrade().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl ServiceHandle for WsServiceProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.connection().is_ok()
    }

    fn on_request(&self, request: &str, handler: RequestHandler) {
        self.handlers.set_request(request, handler);
    }

    fn on_notify(&self, notification: &str, handler: NotifyHandler) {
        self.handlers.set_notify(notification, handler);
    }

    async fn request(&self, request: &str, args: Value) -> Result<Value, TransportError> {
        let connection = self.connection()?;
        connection
            .call(|id| BusFrame::Request {
                id,
                service: self.name.clone(),
                name: request.to_string(),
                args,
            })
            .await
    }

    fn notify(&self, notification: &str, args: Value) -> Result<(), TransportError> {
        self.connection()?.send(BusFrame::Notify {
            service: self.name.clone(),
            name: notification.to_string(),
            args,
        })
    }

    fn close(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.handlers.clear();
        if let Some(connection) = self.connection.upgrade() {
            connection.proxies.write().remove(&self.name);
        }
    }
}
