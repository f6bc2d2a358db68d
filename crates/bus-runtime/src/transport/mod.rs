//! Transport collaborator interfaces.
//!
//! The runtime sits atop an existing asynchronous, session/link-oriented,
//! credit-flow-controlled transport. This module defines the seam: traits for
//! the physical connection and the three link shapes the core consumes
//! (outbound sender links, bidirectional request-response links, and the
//! dedicated token/control link), plus the event types the transport delivers
//! asynchronously. Wire framing and AMQP encoding live entirely behind these
//! traits.

use crate::error::AmqpError;
use crate::message::{DeliveryTag, EntityPath};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::MemoryTransport;

// ============================================================================
// Events
// ============================================================================

/// Connection-level events delivered after a successful open
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The connection faulted; it is no longer usable
    Error(AmqpError),
    /// The connection closed, cleanly or with a condition
    Closed { error: Option<AmqpError> },
}

/// Settlement outcome for one delivery tag
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected { error: AmqpError },
    Released,
    Other { description: String },
}

/// Link-level events for a sender link, delivered in transport order
#[derive(Debug)]
pub enum LinkEvent {
    /// The remote granted additional transfer credit
    Flow { credit: u32 },
    /// The remote settled a previously transferred delivery
    Disposition {
        tag: DeliveryTag,
        outcome: DeliveryOutcome,
    },
    /// The link detached; no further events follow for this instance
    Detached { error: Option<AmqpError> },
}

// ============================================================================
// Transport Traits
// ============================================================================

/// A freshly opened connection together with its event stream
pub struct ConnectedHandle {
    pub connection: Arc<dyn TransportConnection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// A freshly attached sender link together with its event stream
pub struct SenderAttach {
    pub link: Arc<dyn SenderLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Factory for physical connections to a remote endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `host`, resolving once the open handshake
    /// completes
    async fn connect(&self, host: &str) -> Result<ConnectedHandle, AmqpError>;
}

/// One physical connection multiplexing many links
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Attach an outbound sender link to `path`
    async fn open_sender(&self, path: &EntityPath) -> Result<SenderAttach, AmqpError>;

    /// Attach a bidirectional request-response link to `path`
    async fn open_request_link(&self, path: &EntityPath)
        -> Result<Arc<dyn RequestLink>, AmqpError>;

    /// Attach the dedicated token/control link
    async fn open_token_link(&self) -> Result<Arc<dyn TokenLink>, AmqpError>;

    /// Whether the connection has been observed closed or faulted
    fn is_closed(&self) -> bool;

    /// Close the connection; safe to call repeatedly
    async fn close(&self);
}

/// Outbound link handle. `transfer` enqueues one delivery onto the wire and
/// returns immediately; settlement arrives later as a [`LinkEvent`].
pub trait SenderLink: Send + Sync {
    fn transfer(&self, tag: &DeliveryTag, payload: Bytes) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Bidirectional request-response link scoped to one entity path
#[async_trait]
pub trait RequestLink: Send + Sync {
    async fn request(&self, request: ManagementRequest) -> Result<ManagementResponse, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Dedicated control link carrying security tokens
#[async_trait]
pub trait TokenLink: Send + Sync {
    async fn put_token(
        &self,
        audience: &str,
        token_type: &str,
        token: &str,
    ) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

// ============================================================================
// Management Request/Response
// ============================================================================

/// A request carried over a request-response link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementRequest {
    /// Management operation name, e.g. `com.microsoft:renew-lock`
    pub operation: String,
    /// Server-side processing budget hint
    pub server_timeout: Duration,
    /// Application properties attached to the request message
    pub application_properties: HashMap<String, String>,
    /// Operation-specific body
    pub body: serde_json::Value,
}

impl ManagementRequest {
    /// Create a request for `operation` with the given body
    pub fn new(
        operation: impl Into<String>,
        server_timeout: Duration,
        body: serde_json::Value,
    ) -> Self {
        Self {
            operation: operation.into(),
            server_timeout,
            application_properties: HashMap::new(),
            body,
        }
    }
}

/// Response to a management request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementResponse {
    pub status_code: u16,
    pub description: String,
    pub body: serde_json::Value,
}

impl ManagementResponse {
    /// Successful response with the given body
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status_code: 200,
            description: "OK".to_string(),
            body,
        }
    }

    /// Convert into a result, surfacing non-2xx statuses as errors
    pub fn into_result(self) -> Result<serde_json::Value, AmqpError> {
        if (200..300).contains(&self.status_code) {
            Ok(self.body)
        } else {
            Err(AmqpError::RequestFailed {
                status_code: self.status_code,
                description: self.description,
            })
        }
    }
}
