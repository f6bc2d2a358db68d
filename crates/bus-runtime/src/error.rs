//! Error types for the messaging runtime.
//!
//! Every failure surfaced by this crate is an [`AmqpError`]. The variants fall
//! into four classes that drive retry behavior (see [`AmqpError::is_transient`]):
//! transient communication failures, permanent failures, timeouts (which may
//! carry the last observed transient error as context), and closed/cancelled
//! conditions raised when an operation is interrupted by teardown.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all runtime operations
#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Server busy: {message}")]
    ServerBusy { message: String },

    #[error("Link detached: {message}")]
    LinkDetached { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout {
        duration: Duration,
        /// Last transient error observed before the timeout fired, if any.
        #[source]
        last_error: Option<Box<AmqpError>>,
    },

    #[error("Authorization failed: {message}")]
    Unauthorized { message: String },

    #[error("Invalid argument for {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("Entity not found: {path}")]
    EntityNotFound { path: String },

    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("Message lock lost: {lock_token}")]
    MessageLockLost { lock_token: String },

    #[error("Session lock lost: {session_id}")]
    SessionLockLost { session_id: String },

    #[error("Operation cancelled: {message}")]
    OperationCancelled { message: String },

    #[error("Client is closed: {component}")]
    ClientClosed { component: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Token signing failed: {message}")]
    TokenSigning { message: String },

    #[error("Handler already registered on this pump")]
    AlreadyRegistered,

    #[error("Delivery failed with outcome: {description}")]
    DeliveryFailed { description: String },

    #[error("Management request failed ({status_code}): {description}")]
    RequestFailed {
        status_code: u16,
        description: String,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AmqpError {
    /// Check if error is transient and eligible for retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } => true,
            Self::ServerBusy { .. } => true,
            Self::LinkDetached { .. } => true,
            Self::Timeout { .. } => true,
            Self::Unauthorized { .. } => false,
            Self::InvalidArgument { .. } => false,
            Self::EntityNotFound { .. } => false,
            Self::QuotaExceeded { .. } => false,
            Self::MessageLockLost { .. } => false,
            Self::SessionLockLost { .. } => false,
            Self::OperationCancelled { .. } => false,
            Self::ClientClosed { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::TokenSigning { .. } => false,
            Self::AlreadyRegistered => false,
            Self::DeliveryFailed { .. } => false,
            // Server 5xx-equivalent statuses are retried, the rest are not
            Self::RequestFailed { status_code, .. } => *status_code >= 500,
            Self::Serialization(_) => false,
        }
    }

    /// Check if this error terminates a lock-renewal loop
    pub fn is_lock_renewal_terminal(&self) -> bool {
        matches!(
            self,
            Self::MessageLockLost { .. }
                | Self::SessionLockLost { .. }
                | Self::OperationCancelled { .. }
        )
    }

    /// Get suggested retry delay for server-driven backpressure
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ServerBusy { .. } => Some(Duration::from_secs(10)),
            Self::ConnectionLost { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Wrap an error in a timeout, preserving it as context when transient
    pub fn timed_out(duration: Duration, last_error: Option<AmqpError>) -> Self {
        Self::Timeout {
            duration,
            last_error: last_error.map(Box::new),
        }
    }

    /// Cancellation raised when a component is torn down under an operation
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::OperationCancelled {
            message: message.into(),
        }
    }

    /// Closed-component error for the named owner
    pub fn closed(component: impl Into<String>) -> Self {
        Self::ClientClosed {
            component: component.into(),
        }
    }
}

// Completion channels carry errors across tasks; cloning keeps the variant
// and message but drops non-clonable sources.
impl Clone for AmqpError {
    fn clone(&self) -> Self {
        match self {
            Self::ConnectionLost { message } => Self::ConnectionLost {
                message: message.clone(),
            },
            Self::ServerBusy { message } => Self::ServerBusy {
                message: message.clone(),
            },
            Self::LinkDetached { message } => Self::LinkDetached {
                message: message.clone(),
            },
            Self::Timeout {
                duration,
                last_error,
            } => Self::Timeout {
                duration: *duration,
                last_error: last_error.clone(),
            },
            Self::Unauthorized { message } => Self::Unauthorized {
                message: message.clone(),
            },
            Self::InvalidArgument { field, message } => Self::InvalidArgument {
                field: field.clone(),
                message: message.clone(),
            },
            Self::EntityNotFound { path } => Self::EntityNotFound { path: path.clone() },
            Self::QuotaExceeded { message } => Self::QuotaExceeded {
                message: message.clone(),
            },
            Self::MessageLockLost { lock_token } => Self::MessageLockLost {
                lock_token: lock_token.clone(),
            },
            Self::SessionLockLost { session_id } => Self::SessionLockLost {
                session_id: session_id.clone(),
            },
            Self::OperationCancelled { message } => Self::OperationCancelled {
                message: message.clone(),
            },
            Self::ClientClosed { component } => Self::ClientClosed {
                component: component.clone(),
            },
            Self::MessageTooLarge { size, max_size } => Self::MessageTooLarge {
                size: *size,
                max_size: *max_size,
            },
            Self::TokenSigning { message } => Self::TokenSigning {
                message: message.clone(),
            },
            Self::AlreadyRegistered => Self::AlreadyRegistered,
            Self::DeliveryFailed { description } => Self::DeliveryFailed {
                description: description.clone(),
            },
            Self::RequestFailed {
                status_code,
                description,
            } => Self::RequestFailed {
                status_code: *status_code,
                description: description.clone(),
            },
            Self::Serialization(e) => Self::DeliveryFailed {
                description: format!("serialization failed: {e}"),
            },
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
