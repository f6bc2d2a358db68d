//! Shared-access-signature token signing.
//!
//! The runtime treats token cryptography as a black box behind the
//! [`TokenSigner`] trait; [`SasSigner`] is the HMAC-SHA256 implementation
//! used for system-generated tokens.

use crate::error::AmqpError;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

#[cfg(test)]
#[path = "sas_tests.rs"]
mod tests;

/// Token type marker sent alongside shared-access signatures
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Signs audience-scoped security tokens
pub trait TokenSigner: Send + Sync {
    /// Produce a token string for `audience` valid for `validity`
    fn sign(
        &self,
        key_name: &str,
        key: &str,
        audience: &str,
        validity: Duration,
    ) -> Result<String, AmqpError>;
}

/// HMAC-SHA256 shared-access-signature signer
#[derive(Debug, Default, Clone)]
pub struct SasSigner;

impl SasSigner {
    /// Create a new signer
    pub fn new() -> Self {
        Self
    }
}

impl TokenSigner for SasSigner {
    fn sign(
        &self,
        key_name: &str,
        key: &str,
        audience: &str,
        validity: Duration,
    ) -> Result<String, AmqpError> {
        if key_name.is_empty() || key.is_empty() {
            return Err(AmqpError::TokenSigning {
                message: "key name and key must not be empty".to_string(),
            });
        }

        let expiry = Utc::now().timestamp() + validity.as_secs() as i64;
        let encoded_audience = urlencoding::encode(audience).into_owned();
        let string_to_sign = format!("{encoded_audience}\n{expiry}");

        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).map_err(|e| {
            AmqpError::TokenSigning {
                message: format!("invalid signing key: {e}"),
            }
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_audience,
            urlencoding::encode(&signature),
            expiry,
            key_name
        ))
    }
}
