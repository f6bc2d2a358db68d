//! Message types and core domain identifiers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AmqpError;
use bytes::Bytes;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated path of a queue, topic, or subscription entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityPath(String);

impl EntityPath {
    /// Create new entity path with validation
    pub fn new(path: impl Into<String>) -> Result<Self, AmqpError> {
        let path = path.into();
        if path.is_empty() || path.len() > 260 {
            return Err(AmqpError::InvalidArgument {
                field: "entity_path".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }
        if !path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | '$'))
        {
            return Err(AmqpError::InvalidArgument {
                field: "entity_path".to_string(),
                message: "only ASCII alphanumeric, '-', '_', '/', '.', and '$' allowed"
                    .to_string(),
            });
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(AmqpError::InvalidArgument {
                field: "entity_path".to_string(),
                message: "no leading or trailing path separators".to_string(),
            });
        }
        Ok(Self(path))
    }

    /// Get path as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the management endpoint paired with this entity
    pub fn management_path(&self) -> String {
        format!("{}/$management", self.0)
    }

    /// Management endpoint as a validated entity path
    pub fn management_entity(&self) -> EntityPath {
        Self(self.management_path())
    }

    /// Token audience for this entity on the given host
    pub fn audience(&self, host: &str) -> String {
        format!("amqp://{}/{}", host, self.0)
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityPath {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unique identifier for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AmqpError::InvalidArgument {
                field: "message_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }
}

/// Identifier grouping related messages for ordered processing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create new session ID with validation
    pub fn new(id: impl Into<String>) -> Result<Self, AmqpError> {
        let id = id.into();
        if id.is_empty() || id.len() > 128 {
            return Err(AmqpError::InvalidArgument {
                field: "session_id".to_string(),
                message: "must be 1-128 characters".to_string(),
            });
        }
        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(AmqpError::InvalidArgument {
                field: "session_id".to_string(),
                message: "only ASCII printable characters allowed".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Get session ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Correlation Identifiers
// ============================================================================

/// Correlation identifier for one transfer attempt.
///
/// Tags are unique only for the lifetime of one underlying link instance and
/// are regenerated whenever a send is re-attempted on a new link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    /// Generate a fresh tag for a new transfer attempt
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get tag as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifying one received, not-yet-settled message under peek-lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    token: String,
    locked_until: Timestamp,
}

impl LockToken {
    /// Create new lock token with its expiry
    pub fn new(token: impl Into<String>, locked_until: Timestamp) -> Self {
        Self {
            token: token.into(),
            locked_until,
        }
    }

    /// Get opaque token string
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the lock expires
    pub fn locked_until(&self) -> Timestamp {
        self.locked_until.clone()
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Timestamp::now() >= self.locked_until
    }

    /// Replace the expiry after a successful renewal
    pub fn renewed_until(&self, locked_until: Timestamp) -> Self {
        Self {
            token: self.token.clone(),
            locked_until,
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp at the given offset from now
    pub fn after(duration: std::time::Duration) -> Self {
        Self(Utc::now() + Duration::from_std(duration).unwrap_or(Duration::MAX))
    }

    /// Signed duration from now until this timestamp (negative if past)
    pub fn until(&self) -> Duration {
        self.0 - Utc::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Receive and Disposition Modes
// ============================================================================

/// How a receiver takes ownership of delivered messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveMode {
    /// Messages are locked on delivery and must be settled explicitly
    PeekLock,
    /// Messages are removed from the entity as they are delivered
    ReceiveAndDelete,
}

/// Terminal outcome applied to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispositionKind {
    Complete,
    Abandon,
    Defer,
    DeadLetter,
}

impl DispositionKind {
    /// Wire name used by management update-disposition requests
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Complete => "completed",
            Self::Abandon => "abandoned",
            Self::Defer => "deferred",
            Self::DeadLetter => "suspended",
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub content_type: Option<String>,
    pub properties: HashMap<String, String>,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub time_to_live: Option<std::time::Duration>,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: MessageId::new(),
            body: body.into(),
            content_type: None,
            properties: HashMap::new(),
            session_id: None,
            correlation_id: None,
            time_to_live: None,
        }
    }

    /// Add session ID for ordered processing
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add message property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add time-to-live for message expiration
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// A message received from an entity with delivery metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    /// Lock token, present only under peek-lock receive mode
    pub lock_token: Option<LockToken>,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub enqueued_at: Timestamp,
}

impl ReceivedMessage {
    /// Check if message has exceeded maximum delivery count
    pub fn has_exceeded_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count > max_count
    }
}
