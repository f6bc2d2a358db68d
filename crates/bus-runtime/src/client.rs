//! Client facade: messaging factory and management client.
//!
//! The [`MessagingFactory`] wires the runtime together over one connection:
//! it owns the supervisor, the token lifecycle, the retry policy, and the
//! request-link cache, and hands out [`Sender`]s and [`ManagementClient`]s
//! that share them. Closing the factory tears everything down in order:
//! token renewal, cached request links, control link, connection.
//!
//! The [`ManagementClient`] speaks the `com.microsoft:*` management protocol
//! over the shared request-response link for its entity: peeking, lock
//! renewal, dispositions, and scheduled messages.

use crate::codec::{JsonCodec, MessageCodec};
use crate::config::ClientConfig;
use crate::connection::ConnectionSupervisor;
use crate::error::AmqpError;
use crate::link_cache::{LinkCache, RequestLinkFactory};
use crate::message::{
    DispositionKind, EntityPath, LockToken, Message, Timestamp,
};
use crate::registry::{LinkRegistration, LinkRegistry, RegisteredLink};
use crate::retry::RetryPolicy;
use crate::sender::{Sender, SenderLinkFactory};
use crate::timer::TimerService;
use crate::token::{TokenLifecycle, TokenProvider};
use crate::transport::{
    ManagementRequest, ManagementResponse, RequestLink, SenderAttach, Transport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

// ============================================================================
// Link factories
// ============================================================================

/// Attaches entity links on the shared connection, authorizing first
struct EntityLinkFactory {
    supervisor: Arc<ConnectionSupervisor>,
    tokens: Arc<TokenLifecycle>,
}

#[async_trait]
impl SenderLinkFactory for EntityLinkFactory {
    async fn attach(&self, path: &EntityPath) -> Result<SenderAttach, AmqpError> {
        self.tokens.authorize(path).await?;
        let connection = self.supervisor.get_connection().await?;
        connection.open_sender(path).await
    }
}

#[async_trait]
impl RequestLinkFactory for EntityLinkFactory {
    async fn create(&self, path: &EntityPath) -> Result<Arc<dyn RequestLink>, AmqpError> {
        self.tokens.authorize(path).await?;
        let connection = self.supervisor.get_connection().await?;
        connection.open_request_link(path).await
    }
}

// ============================================================================
// MessagingFactory
// ============================================================================

/// Root object owning the shared connection and everything on it
pub struct MessagingFactory {
    config: ClientConfig,
    timer: TimerService,
    retry: Arc<RetryPolicy>,
    codec: Arc<dyn MessageCodec>,
    registry: Arc<LinkRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    tokens: Arc<TokenLifecycle>,
    link_cache: Arc<LinkCache>,
    cache_registration: Mutex<Option<LinkRegistration>>,
    link_factory: Arc<EntityLinkFactory>,
    closed: AtomicBool,
}

impl MessagingFactory {
    /// Create a factory for `config.host` authenticating with `provider`.
    ///
    /// Nothing connects until the first link is used.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidArgument`] when the configuration fails
    /// validation.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        provider: TokenProvider,
    ) -> Result<Arc<Self>, AmqpError> {
        config.validate()?;

        let timer = TimerService::new();
        let registry = LinkRegistry::new();
        let supervisor = ConnectionSupervisor::new(
            transport,
            config.clone(),
            Arc::clone(&registry),
        );
        let tokens = TokenLifecycle::new(
            Arc::clone(&supervisor),
            provider,
            timer.clone(),
            config.clone(),
        );
        let link_factory = Arc::new(EntityLinkFactory {
            supervisor: Arc::clone(&supervisor),
            tokens: Arc::clone(&tokens),
        });
        let link_cache = LinkCache::new(
            Arc::clone(&link_factory) as Arc<dyn RequestLinkFactory>,
        );
        let cache_registration = registry.register(
            Arc::downgrade(&link_cache) as Weak<dyn RegisteredLink>,
        );

        info!(host = %config.host, "messaging factory created");
        Ok(Arc::new(Self {
            retry: Arc::new(RetryPolicy::new(config.retry.clone())),
            codec: Arc::new(JsonCodec::new(config.max_message_size)),
            config,
            timer,
            registry,
            supervisor,
            tokens,
            link_cache,
            cache_registration: Mutex::new(Some(cache_registration)),
            link_factory,
            closed: AtomicBool::new(false),
        }))
    }

    /// Create a sender for `path`, pre-authorizing the path.
    ///
    /// The link itself attaches lazily on the first send.
    pub async fn create_sender(&self, path: EntityPath) -> Result<Arc<Sender>, AmqpError> {
        self.ensure_open()?;
        self.tokens.authorize(&path).await?;

        let sender = Sender::new(
            path,
            Arc::clone(&self.link_factory) as Arc<dyn SenderLinkFactory>,
            Arc::clone(&self.codec),
            Arc::clone(&self.retry),
            self.timer.clone(),
            self.config.clone(),
        );
        let registration = self
            .registry
            .register(Arc::downgrade(&sender) as Weak<dyn RegisteredLink>);
        sender.hold_registration(registration);
        debug!(path = %sender.path(), "sender created");
        Ok(sender)
    }

    /// Open a management client for `path`, obtaining the shared
    /// request-response link for its management endpoint.
    pub async fn management_client(
        &self,
        path: EntityPath,
    ) -> Result<ManagementClient, AmqpError> {
        self.ensure_open()?;
        let management_path = path.management_entity();
        self.link_cache.obtain(&management_path).await?;
        Ok(ManagementClient {
            management_path,
            cache: Arc::clone(&self.link_cache),
            config: self.config.clone(),
            released: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::closed("messaging factory"));
        }
        Ok(())
    }

    /// Close the factory: token renewal stops, then the control link, the
    /// cached request links, and finally the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tokens.shutdown();
        self.supervisor.close_control_link().await;
        self.link_cache.free_all().await;
        *self.cache_registration.lock().unwrap() = None;
        self.supervisor.close().await;
        info!(host = %self.config.host, "messaging factory closed");
    }
}

// ============================================================================
// ManagementClient
// ============================================================================

/// Entity-scoped client for `com.microsoft:*` management operations.
///
/// Holds one reference to the shared request-response link for its entity;
/// [`ManagementClient::close`] releases it.
pub struct ManagementClient {
    management_path: EntityPath,
    cache: Arc<LinkCache>,
    config: ClientConfig,
    released: AtomicBool,
}

impl ManagementClient {
    /// Peek up to `count` messages from `from_sequence_number` without
    /// locking or removing them.
    pub async fn peek_messages(
        &self,
        from_sequence_number: i64,
        count: u32,
    ) -> Result<Vec<Message>, AmqpError> {
        let body = self
            .request(
                "com.microsoft:peek-message",
                json!({
                    "from-sequence-number": from_sequence_number,
                    "message-count": count,
                }),
            )
            .await?;
        Ok(serde_json::from_value(body["messages"].clone())?)
    }

    /// Renew the lock behind `lock_token`, returning the token with its new
    /// expiry.
    pub async fn renew_message_lock(
        &self,
        lock_token: &LockToken,
    ) -> Result<LockToken, AmqpError> {
        let body = self
            .request(
                "com.microsoft:renew-lock",
                json!({ "lock-tokens": [lock_token.token()] }),
            )
            .await?;
        let expirations: Vec<DateTime<Utc>> =
            serde_json::from_value(body["expirations"].clone())?;
        let expiry = expirations.into_iter().next().ok_or_else(|| {
            AmqpError::RequestFailed {
                status_code: 500,
                description: "renew-lock response carried no expiration".to_string(),
            }
        })?;
        Ok(lock_token.renewed_until(Timestamp::from_datetime(expiry)))
    }

    /// Settle a received message through the management endpoint.
    pub async fn update_disposition(
        &self,
        lock_token: &LockToken,
        disposition: DispositionKind,
        reason: Option<&str>,
    ) -> Result<(), AmqpError> {
        let mut body = json!({
            "lock-tokens": [lock_token.token()],
            "disposition-status": disposition.as_wire_str(),
        });
        if let Some(reason) = reason {
            body["deadletter-reason"] = json!(reason);
        }
        self.request("com.microsoft:update-disposition", body)
            .await?;
        Ok(())
    }

    /// Enqueue a message to become visible at `enqueue_at`, returning its
    /// sequence number for cancellation.
    pub async fn schedule_message(
        &self,
        message: &Message,
        enqueue_at: Timestamp,
    ) -> Result<i64, AmqpError> {
        let body = self
            .request(
                "com.microsoft:schedule-message",
                json!({
                    "messages": [serde_json::to_value(message)?],
                    "scheduled-enqueue-time": enqueue_at.as_datetime(),
                }),
            )
            .await?;
        let sequence_numbers: Vec<i64> =
            serde_json::from_value(body["sequence-numbers"].clone())?;
        sequence_numbers.into_iter().next().ok_or_else(|| {
            AmqpError::RequestFailed {
                status_code: 500,
                description: "schedule-message response carried no sequence number"
                    .to_string(),
            }
        })
    }

    /// Cancel a message scheduled earlier, by sequence number.
    pub async fn cancel_scheduled_message(
        &self,
        sequence_number: i64,
    ) -> Result<(), AmqpError> {
        self.request(
            "com.microsoft:cancel-scheduled-message",
            json!({ "sequence-numbers": [sequence_number] }),
        )
        .await?;
        Ok(())
    }

    async fn request(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, AmqpError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AmqpError::closed("management client"));
        }
        // obtain/release around each request keeps the cache's count
        // balanced even if the link was replaced after a connection fault
        let link = self.cache.obtain(&self.management_path).await?;
        let request = ManagementRequest::new(
            operation.to_string(),
            self.config.operation_timeout,
            body,
        );
        let result = tokio::time::timeout(self.config.operation_timeout, link.request(request))
            .await
            .map_err(|_| AmqpError::timed_out(self.config.operation_timeout, None))
            .and_then(|r| r);
        self.cache.release(&self.management_path).await;
        result.and_then(ManagementResponse::into_result)
    }

    /// Release this client's reference to the shared link. Idempotent.
    pub async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.release(&self.management_path).await;
    }
}
