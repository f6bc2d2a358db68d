//! # Bus Runtime
//!
//! Client-side AMQP 1.0 messaging runtime: link lifecycle, delivery
//! settlement, and message pumping over a single shared connection.
//!
//! This library provides:
//! - A connection supervisor multiplexing every link over one connection
//! - Credit-aware sending links with retry-before-fresh delivery ordering
//! - Reference-counted request-response links for management operations
//! - Security token lifecycle with automatic renewal
//! - Message and session pumps with background lock renewal
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all runtime operations
//! - [`message`] - Message structures and domain identifiers
//! - [`transport`] - Transport traits and the in-memory implementation
//! - [`connection`] - Connection supervisor and control link
//! - [`sender`] - Sending link core
//! - [`pump`] - Message and session pumps
//! - [`client`] - Messaging factory and management client

// Module declarations
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod link_cache;
pub mod message;
pub mod pump;
pub mod registry;
pub mod retry;
pub mod sas;
pub mod sender;
pub mod timer;
pub mod token;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use client::{ManagementClient, MessagingFactory};
pub use codec::{JsonCodec, MessageCodec};
pub use config::{ClientConfig, RetryConfig};
pub use connection::ConnectionSupervisor;
pub use error::AmqpError;
pub use message::{
    DeliveryTag, DispositionKind, EntityPath, LockToken, Message, MessageId, ReceiveMode,
    ReceivedMessage, SessionId, Timestamp,
};
pub use pump::{
    ExceptionCallback, ExceptionPhase, MessageHandler, MessagePump, PumpOptions, PumpReceiver,
    SessionMessageHandler, SessionPump, SessionPumpOptions, SessionReceiver, SessionSource,
};
pub use retry::RetryPolicy;
pub use sender::Sender;
pub use timer::{TimerHandle, TimerKind, TimerService};
pub use token::{TokenLifecycle, TokenProvider};
pub use transport::{MemoryTransport, Transport};
