//! In-memory transport implementation for testing and development.
//!
//! Implements the transport traits without a broker so every core component
//! can be exercised in-process. Behavior is scriptable from tests:
//! - connect / link-open / transfer failures can be queued up front,
//! - credit grants, settlements, and link or connection faults are injected
//!   through the returned handles,
//! - management request handling is pluggable via a responder closure,
//! - token puts are recorded for inspection.
//!
//! By default links open with a generous credit window and settle transfers
//! as `Accepted`, which is enough for end-to-end facade tests; unit tests of
//! the delivery pipeline switch to manual mode.

use crate::error::AmqpError;
use crate::message::{DeliveryTag, EntityPath};
use crate::transport::{
    ConnectedHandle, ConnectionEvent, DeliveryOutcome, LinkEvent, ManagementRequest,
    ManagementResponse, RequestLink, SenderAttach, SenderLink, TokenLink, Transport,
    TransportConnection,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

type Responder =
    Arc<dyn Fn(&EntityPath, &ManagementRequest) -> Result<ManagementResponse, AmqpError> + Send + Sync>;

/// One recorded token put
#[derive(Debug, Clone)]
pub struct TokenPut {
    pub audience: String,
    pub token_type: String,
    pub token: String,
}

struct Shared {
    connect_failures: Mutex<VecDeque<AmqpError>>,
    connect_delay: Mutex<Option<Duration>>,
    connect_count: AtomicUsize,
    initial_credit: AtomicU32,
    auto_accept: AtomicBool,
    sender_open_failures: Mutex<VecDeque<AmqpError>>,
    token_link_open_failures: Mutex<VecDeque<AmqpError>>,
    token_link_open_count: AtomicUsize,
    request_link_open_count: AtomicUsize,
    put_token_failures: Mutex<VecDeque<AmqpError>>,
    put_token_log: Mutex<Vec<TokenPut>>,
    responder: Mutex<Option<Responder>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

/// Scriptable in-memory transport
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a transport with auto-accepting links and a 100-credit window
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                connect_failures: Mutex::new(VecDeque::new()),
                connect_delay: Mutex::new(None),
                connect_count: AtomicUsize::new(0),
                initial_credit: AtomicU32::new(100),
                auto_accept: AtomicBool::new(true),
                sender_open_failures: Mutex::new(VecDeque::new()),
                token_link_open_failures: Mutex::new(VecDeque::new()),
                token_link_open_count: AtomicUsize::new(0),
                request_link_open_count: AtomicUsize::new(0),
                put_token_failures: Mutex::new(VecDeque::new()),
                put_token_log: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Credit granted to each sender link immediately after attach
    pub fn set_initial_credit(&self, credit: u32) {
        self.shared.initial_credit.store(credit, Ordering::SeqCst);
    }

    /// Whether transfers settle as `Accepted` without test intervention
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.shared.auto_accept.store(auto_accept, Ordering::SeqCst);
    }

    /// Queue a failure for the next `connect` call
    pub fn fail_next_connect(&self, error: AmqpError) {
        self.shared.connect_failures.lock().unwrap().push_back(error);
    }

    /// Delay applied to every `connect` call before it resolves
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Queue a failure for the next sender-link attach
    pub fn fail_next_sender_open(&self, error: AmqpError) {
        self.shared
            .sender_open_failures
            .lock()
            .unwrap()
            .push_back(error);
    }

    /// Queue a failure for the next token-link attach
    pub fn fail_next_token_link_open(&self, error: AmqpError) {
        self.shared
            .token_link_open_failures
            .lock()
            .unwrap()
            .push_back(error);
    }

    /// Queue a failure for the next token put
    pub fn fail_next_put_token(&self, error: AmqpError) {
        self.shared
            .put_token_failures
            .lock()
            .unwrap()
            .push_back(error);
    }

    /// Install a management responder; replaces any previous one
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&EntityPath, &ManagementRequest) -> Result<ManagementResponse, AmqpError>
            + Send
            + Sync
            + 'static,
    {
        *self.shared.responder.lock().unwrap() = Some(Arc::new(responder));
    }

    /// Number of successful and failed `connect` calls observed
    pub fn connect_count(&self) -> usize {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    /// Number of token-link attach attempts observed
    pub fn token_link_open_count(&self) -> usize {
        self.shared.token_link_open_count.load(Ordering::SeqCst)
    }

    /// Number of request-link attach attempts observed
    pub fn request_link_open_count(&self) -> usize {
        self.shared.request_link_open_count.load(Ordering::SeqCst)
    }

    /// Tokens put over any token link, in order
    pub fn tokens_put(&self) -> Vec<TokenPut> {
        self.shared.put_token_log.lock().unwrap().clone()
    }

    /// Most recently opened connection, if any
    pub fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        self.shared.connections.lock().unwrap().last().cloned()
    }

    /// Most recently attached sender link for `path`, across connections
    pub fn last_sender(&self, path: &EntityPath) -> Option<Arc<MemorySenderLink>> {
        let connections = self.shared.connections.lock().unwrap();
        connections
            .iter()
            .rev()
            .find_map(|connection| connection.last_sender(path))
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _host: &str) -> Result<ConnectedHandle, AmqpError> {
        self.shared.connect_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.shared.connect_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let connection = Arc::new(MemoryConnection {
            closed: AtomicBool::new(false),
            event_tx,
            senders: Mutex::new(Vec::new()),
            request_links: Mutex::new(Vec::new()),
            token_links: Mutex::new(Vec::new()),
            shared: Arc::downgrade(&self.shared),
        });
        self.shared
            .connections
            .lock()
            .unwrap()
            .push(Arc::clone(&connection));

        Ok(ConnectedHandle { connection, events })
    }
}

// ============================================================================
// MemoryConnection
// ============================================================================

/// In-memory connection with fault-injection controls
pub struct MemoryConnection {
    closed: AtomicBool,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    senders: Mutex<Vec<Arc<MemorySenderLink>>>,
    request_links: Mutex<Vec<Arc<MemoryRequestLink>>>,
    token_links: Mutex<Vec<Arc<MemoryTokenLink>>>,
    shared: Weak<Shared>,
}

impl MemoryConnection {
    /// Fault the connection, emitting an error event to its owner
    pub fn fail(&self, error: AmqpError) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(ConnectionEvent::Error(error));
        }
    }

    /// Most recently attached sender link for `path` on this connection
    pub fn last_sender(&self, path: &EntityPath) -> Option<Arc<MemorySenderLink>> {
        let senders = self.senders.lock().unwrap();
        senders.iter().rev().find(|s| &s.path == path).cloned()
    }

    /// Request links attached on this connection
    pub fn request_links(&self) -> Vec<Arc<MemoryRequestLink>> {
        self.request_links.lock().unwrap().clone()
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionLost {
                message: "connection is closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_sender(&self, path: &EntityPath) -> Result<SenderAttach, AmqpError> {
        self.ensure_open()?;
        let shared = self.shared.upgrade().ok_or_else(|| AmqpError::ConnectionLost {
            message: "transport dropped".to_string(),
        })?;
        if let Some(error) = shared.sender_open_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let link = Arc::new(MemorySenderLink {
            path: path.clone(),
            open: AtomicBool::new(true),
            event_tx,
            transfers: Mutex::new(Vec::new()),
            transfer_failures: Mutex::new(VecDeque::new()),
            auto_accept: shared.auto_accept.load(Ordering::SeqCst),
        });

        let initial_credit = shared.initial_credit.load(Ordering::SeqCst);
        if initial_credit > 0 {
            let _ = link.event_tx.send(LinkEvent::Flow {
                credit: initial_credit,
            });
        }

        self.senders.lock().unwrap().push(Arc::clone(&link));
        Ok(SenderAttach { link, events })
    }

    async fn open_request_link(
        &self,
        path: &EntityPath,
    ) -> Result<Arc<dyn RequestLink>, AmqpError> {
        self.ensure_open()?;
        let shared = self.shared.upgrade().ok_or_else(|| AmqpError::ConnectionLost {
            message: "transport dropped".to_string(),
        })?;
        shared.request_link_open_count.fetch_add(1, Ordering::SeqCst);

        let link = Arc::new(MemoryRequestLink {
            path: path.clone(),
            open: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            shared: Weak::clone(&self.shared),
        });
        self.request_links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }

    async fn open_token_link(&self) -> Result<Arc<dyn TokenLink>, AmqpError> {
        self.ensure_open()?;
        let shared = self.shared.upgrade().ok_or_else(|| AmqpError::ConnectionLost {
            message: "transport dropped".to_string(),
        })?;
        shared.token_link_open_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = shared.token_link_open_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let link = Arc::new(MemoryTokenLink {
            open: AtomicBool::new(true),
            shared: Weak::clone(&self.shared),
        });
        self.token_links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(ConnectionEvent::Closed { error: None });
        }
    }
}

// ============================================================================
// MemorySenderLink
// ============================================================================

/// In-memory sender link with settlement and fault controls
pub struct MemorySenderLink {
    path: EntityPath,
    open: AtomicBool,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
    transfers: Mutex<Vec<(DeliveryTag, Bytes)>>,
    transfer_failures: Mutex<VecDeque<AmqpError>>,
    auto_accept: bool,
}

impl MemorySenderLink {
    /// Grant additional transfer credit to the owner of this link
    pub fn grant_credit(&self, credit: u32) {
        let _ = self.event_tx.send(LinkEvent::Flow { credit });
    }

    /// Settle a previously transferred delivery
    pub fn settle(&self, tag: DeliveryTag, outcome: DeliveryOutcome) {
        let _ = self.event_tx.send(LinkEvent::Disposition { tag, outcome });
    }

    /// Detach the link, emitting the closing condition
    pub fn detach(&self, error: Option<AmqpError>) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.event_tx.send(LinkEvent::Detached { error });
        }
    }

    /// Queue a failure for the next `transfer` call
    pub fn fail_next_transfer(&self, error: AmqpError) {
        self.transfer_failures.lock().unwrap().push_back(error);
    }

    /// Delivery tags transferred on this link, in order
    pub fn transferred_tags(&self) -> Vec<DeliveryTag> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Transfers observed on this link, tag and payload, in order
    pub fn transfers(&self) -> Vec<(DeliveryTag, Bytes)> {
        self.transfers.lock().unwrap().clone()
    }

    /// Number of transfers observed on this link
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

impl SenderLink for MemorySenderLink {
    fn transfer(&self, tag: &DeliveryTag, payload: Bytes) -> Result<(), AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::LinkDetached {
                message: format!("sender link to '{}' is detached", self.path),
            });
        }
        if let Some(error) = self.transfer_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        self.transfers.lock().unwrap().push((tag.clone(), payload));
        if self.auto_accept {
            let _ = self.event_tx.send(LinkEvent::Disposition {
                tag: tag.clone(),
                outcome: DeliveryOutcome::Accepted,
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.detach(None);
    }
}

// ============================================================================
// MemoryRequestLink
// ============================================================================

/// In-memory request-response link
pub struct MemoryRequestLink {
    path: EntityPath,
    open: AtomicBool,
    requests: Mutex<Vec<ManagementRequest>>,
    failures: Mutex<VecDeque<AmqpError>>,
    shared: Weak<Shared>,
}

impl MemoryRequestLink {
    /// Entity path this link is scoped to
    pub fn path(&self) -> &EntityPath {
        &self.path
    }

    /// Requests observed on this link, in order
    pub fn requests(&self) -> Vec<ManagementRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Queue a failure for the next `request` call
    pub fn fail_next_request(&self, error: AmqpError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl RequestLink for MemoryRequestLink {
    async fn request(&self, request: ManagementRequest) -> Result<ManagementResponse, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::LinkDetached {
                message: format!("request link to '{}' is detached", self.path),
            });
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        self.requests.lock().unwrap().push(request.clone());

        let responder = self
            .shared
            .upgrade()
            .and_then(|shared| shared.responder.lock().unwrap().clone());
        match responder {
            Some(responder) => responder(&self.path, &request),
            None => Ok(ManagementResponse::ok(request.body)),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// MemoryTokenLink
// ============================================================================

/// In-memory control link recording token puts
pub struct MemoryTokenLink {
    open: AtomicBool,
    shared: Weak<Shared>,
}

#[async_trait]
impl TokenLink for MemoryTokenLink {
    async fn put_token(
        &self,
        audience: &str,
        token_type: &str,
        token: &str,
    ) -> Result<(), AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::LinkDetached {
                message: "token link is detached".to_string(),
            });
        }
        let shared = self.shared.upgrade().ok_or_else(|| AmqpError::ConnectionLost {
            message: "transport dropped".to_string(),
        })?;
        if let Some(error) = shared.put_token_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        shared.put_token_log.lock().unwrap().push(TokenPut {
            audience: audience.to_string(),
            token_type: token_type.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
