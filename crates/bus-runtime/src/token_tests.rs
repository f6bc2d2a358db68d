//! Tests for the token lifecycle.

use super::*;
use crate::registry::LinkRegistry;
use crate::transport::MemoryTransport;
use std::time::Duration;

fn lifecycle_with(
    transport: Arc<MemoryTransport>,
    provider: TokenProvider,
) -> Arc<TokenLifecycle> {
    let mut config = ClientConfig::new("sb.example.net");
    config.token_validity = Duration::from_secs(100);
    config.token_renewal_fraction = 0.8;
    let supervisor =
        ConnectionSupervisor::new(transport, config.clone(), LinkRegistry::new());
    TokenLifecycle::new(supervisor, provider, TimerService::new(), config)
}

fn path(s: &str) -> EntityPath {
    s.parse().unwrap()
}

#[tokio::test]
async fn authorize_puts_an_audience_scoped_token() {
    let transport = Arc::new(MemoryTransport::new());
    let lifecycle = lifecycle_with(Arc::clone(&transport), TokenProvider::sas("kn", "key"));

    lifecycle.authorize(&path("orders")).await.unwrap();

    let puts = transport.tokens_put();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].audience, "amqp://sb.example.net/orders");
    assert_eq!(puts[0].token_type, SAS_TOKEN_TYPE);
    assert!(puts[0].token.starts_with("SharedAccessSignature "));
}

#[tokio::test(start_paused = true)]
async fn renewable_token_is_renewed_at_the_configured_fraction() {
    let transport = Arc::new(MemoryTransport::new());
    let lifecycle = lifecycle_with(Arc::clone(&transport), TokenProvider::sas("kn", "key"));

    lifecycle.authorize(&path("orders")).await.unwrap();
    assert_eq!(transport.tokens_put().len(), 1);

    // 80% of the 100s validity window
    tokio::time::sleep(Duration::from_secs(81)).await;
    assert_eq!(transport.tokens_put().len(), 2);

    tokio::time::sleep(Duration::from_secs(80)).await;
    assert_eq!(transport.tokens_put().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn static_token_is_never_renewed() {
    let transport = Arc::new(MemoryTransport::new());
    let lifecycle = lifecycle_with(
        Arc::clone(&transport),
        TokenProvider::static_token("caller-token"),
    );

    lifecycle.authorize(&path("orders")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(500)).await;

    let puts = transport.tokens_put();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].token, "caller-token");
}

#[tokio::test(start_paused = true)]
async fn reauthorizing_does_not_double_the_renewal_schedule() {
    let transport = Arc::new(MemoryTransport::new());
    let lifecycle = lifecycle_with(Arc::clone(&transport), TokenProvider::sas("kn", "key"));

    lifecycle.authorize(&path("orders")).await.unwrap();
    lifecycle.authorize(&path("orders")).await.unwrap();
    assert_eq!(transport.tokens_put().len(), 2);

    tokio::time::sleep(Duration::from_secs(81)).await;
    assert_eq!(transport.tokens_put().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn distinct_paths_get_distinct_renewal_schedules() {
    let transport = Arc::new(MemoryTransport::new());
    let lifecycle = lifecycle_with(Arc::clone(&transport), TokenProvider::sas("kn", "key"));

    lifecycle.authorize(&path("orders")).await.unwrap();
    lifecycle.authorize(&path("billing")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(81)).await;
    let audiences: Vec<String> = transport
        .tokens_put()
        .into_iter()
        .map(|put| put.audience)
        .collect();
    assert_eq!(audiences.len(), 4);
    assert!(audiences[2..].contains(&"amqp://sb.example.net/orders".to_string()));
    assert!(audiences[2..].contains(&"amqp://sb.example.net/billing".to_string()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_renewal() {
    let transport = Arc::new(MemoryTransport::new());
    let lifecycle = lifecycle_with(Arc::clone(&transport), TokenProvider::sas("kn", "key"));

    lifecycle.authorize(&path("orders")).await.unwrap();
    lifecycle.shutdown();
    tokio::time::sleep(Duration::from_secs(500)).await;

    assert_eq!(transport.tokens_put().len(), 1);
}

#[tokio::test]
async fn put_failure_surfaces_to_the_caller() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next_put_token(AmqpError::Unauthorized {
        message: "denied".to_string(),
    });
    let lifecycle = lifecycle_with(Arc::clone(&transport), TokenProvider::sas("kn", "key"));

    let result = lifecycle.authorize(&path("orders")).await;

    assert!(matches!(result, Err(AmqpError::Unauthorized { .. })));
}
