//! Tests for configuration validation.

use super::*;
use tokio_test::assert_ok;

#[test]
fn default_config_is_valid() {
    let config = ClientConfig::new("sb.example.net");
    assert_ok!(config.validate());
    assert_eq!(config.control_link_max_attempts, 3);
    assert_eq!(config.operation_timeout, Duration::from_secs(60));
}

#[test]
fn empty_host_is_rejected() {
    let config = ClientConfig::new("");
    match config.validate() {
        Err(AmqpError::InvalidArgument { field, .. }) => assert_eq!(field, "host"),
        other => panic!("expected InvalidArgument, got: {other:?}"),
    }
}

#[test]
fn zero_operation_timeout_is_rejected() {
    let config = ClientConfig {
        operation_timeout: Duration::ZERO,
        ..ClientConfig::new("sb.example.net")
    };
    assert!(config.validate().is_err());
}

#[test]
fn renewal_fraction_must_be_a_ratio() {
    let config = ClientConfig {
        token_renewal_fraction: 1.5,
        ..ClientConfig::new("sb.example.net")
    };
    assert!(config.validate().is_err());
}

#[test]
fn inverted_backoff_bounds_are_rejected() {
    let retry = RetryConfig {
        min_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(30),
        ..RetryConfig::default()
    };
    assert!(retry.validate().is_err());
}
