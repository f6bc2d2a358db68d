//! Security token lifecycle.
//!
//! Each entity path is authorized by putting an audience-scoped token over
//! the supervisor's control link before any link to that path attaches.
//! System-generated tokens (signed from a shared-access key) are renewed on a
//! repeating timer armed at a fraction of the validity window; caller-supplied
//! tokens are the caller's responsibility and are sent exactly once per
//! authorization.

use crate::config::ClientConfig;
use crate::connection::ConnectionSupervisor;
use crate::error::AmqpError;
use crate::message::EntityPath;
use crate::sas::{SasSigner, TokenSigner, SAS_TOKEN_TYPE};
use crate::timer::{TimerHandle, TimerKind, TimerService};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

/// Source of security tokens for link authorization
pub enum TokenProvider {
    /// Tokens signed on demand from a shared-access key; renewable
    Sas {
        key_name: String,
        key: String,
        signer: Arc<dyn TokenSigner>,
    },
    /// A fixed token supplied by the caller; never renewed
    Static { token: String },
}

impl TokenProvider {
    /// Provider signing tokens with the default HMAC-SHA256 signer
    pub fn sas(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Sas {
            key_name: key_name.into(),
            key: key.into(),
            signer: Arc::new(SasSigner::new()),
        }
    }

    /// Provider handing out a caller-supplied token verbatim
    pub fn static_token(token: impl Into<String>) -> Self {
        Self::Static {
            token: token.into(),
        }
    }

    /// Whether tokens from this provider are renewed automatically
    pub fn is_renewable(&self) -> bool {
        matches!(self, Self::Sas { .. })
    }

    fn token_for(
        &self,
        audience: &str,
        validity: std::time::Duration,
    ) -> Result<String, AmqpError> {
        match self {
            Self::Sas {
                key_name,
                key,
                signer,
            } => signer.sign(key_name, key, audience, validity),
            Self::Static { token } => Ok(token.clone()),
        }
    }
}

/// Authorizes entity paths and keeps their tokens fresh
pub struct TokenLifecycle {
    supervisor: Arc<ConnectionSupervisor>,
    provider: TokenProvider,
    timer: TimerService,
    config: ClientConfig,
    renewals: Mutex<HashMap<String, TimerHandle>>,
}

impl TokenLifecycle {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        provider: TokenProvider,
        timer: TimerService,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            provider,
            timer,
            config,
            renewals: Mutex::new(HashMap::new()),
        })
    }

    /// Authorize `path`, arming renewal for renewable providers.
    ///
    /// Re-authorizing an already-armed path refreshes the token immediately
    /// without doubling the renewal schedule.
    ///
    /// # Errors
    ///
    /// Returns the signing or control-link error, or
    /// [`AmqpError::Timeout`] when the put exceeds the operation timeout.
    pub async fn authorize(self: &Arc<Self>, path: &EntityPath) -> Result<(), AmqpError> {
        let audience = path.audience(&self.config.host);
        self.put_token(&audience).await?;

        if self.provider.is_renewable() {
            self.arm_renewal(&audience);
        }
        Ok(())
    }

    fn arm_renewal(self: &Arc<Self>, audience: &str) {
        let mut renewals = self.renewals.lock().unwrap();
        if renewals.contains_key(audience) {
            return;
        }

        let interval = self
            .config
            .token_validity
            .mul_f64(self.config.token_renewal_fraction);
        let lifecycle = Arc::downgrade(self);
        let renewal_audience = audience.to_string();
        let handle = self.timer.schedule(interval, TimerKind::Repeating, move || {
            let lifecycle = Weak::clone(&lifecycle);
            let audience = renewal_audience.clone();
            async move {
                let Some(lifecycle) = lifecycle.upgrade() else {
                    return;
                };
                match lifecycle.put_token(&audience).await {
                    Ok(()) => debug!(audience = %audience, "token renewed"),
                    // A transient failure is retried on the next period; the
                    // supervisor replaces the control link underneath us.
                    Err(error) => warn!(audience = %audience, error = %error, "token renewal failed"),
                }
            }
        });
        debug!(audience = %audience, interval = ?interval, "token renewal armed");
        renewals.insert(audience.to_string(), handle);
    }

    async fn put_token(&self, audience: &str) -> Result<(), AmqpError> {
        let token = self
            .provider
            .token_for(audience, self.config.token_validity)?;
        let link = self.supervisor.get_control_link().await?;

        tokio::time::timeout(
            self.config.operation_timeout,
            link.put_token(audience, SAS_TOKEN_TYPE, &token),
        )
        .await
        .map_err(|_| AmqpError::timed_out(self.config.operation_timeout, None))?
    }

    /// Cancel every renewal schedule. Called during factory close.
    pub fn shutdown(&self) {
        let mut renewals = self.renewals.lock().unwrap();
        for (audience, handle) in renewals.drain() {
            debug!(audience = %audience, "token renewal cancelled");
            handle.cancel();
        }
    }
}
