//! Tests for the messaging factory and management client.

use super::*;
use crate::transport::{MemoryTransport, TransportConnection};
use std::time::Duration;

fn factory_with(transport: Arc<MemoryTransport>) -> Arc<MessagingFactory> {
    MessagingFactory::new(
        ClientConfig::new("sb.example.net"),
        transport,
        TokenProvider::sas("kn", "key"),
    )
    .unwrap()
}

fn orders() -> EntityPath {
    "orders".parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn sender_sends_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let factory = factory_with(Arc::clone(&transport));

    let sender = factory.create_sender(orders()).await.unwrap();
    sender.send(&Message::new("hello")).await.unwrap();

    assert_eq!(transport.connect_count(), 1);
    let link = transport.last_sender(&orders()).unwrap();
    assert_eq!(link.transfer_count(), 1);
    // The path was authorized before the link attached
    assert!(transport
        .tokens_put()
        .iter()
        .any(|put| put.audience == "amqp://sb.example.net/orders"));
}

#[tokio::test(start_paused = true)]
async fn management_clients_share_one_request_link() {
    let transport = Arc::new(MemoryTransport::new());
    let factory = factory_with(Arc::clone(&transport));

    let a = factory.management_client(orders()).await.unwrap();
    let b = factory.management_client(orders()).await.unwrap();
    let c = factory.management_client(orders()).await.unwrap();
    assert_eq!(transport.request_link_open_count(), 1);

    // All three operate over the shared link
    a.cancel_scheduled_message(1).await.unwrap();
    b.cancel_scheduled_message(2).await.unwrap();
    c.cancel_scheduled_message(3).await.unwrap();

    a.close().await;
    b.close().await;
    c.close().await;

    // Last release tore the link down; the next client attaches a new one
    let d = factory.management_client(orders()).await.unwrap();
    assert_eq!(transport.request_link_open_count(), 2);
    d.close().await;
}

#[tokio::test(start_paused = true)]
async fn renew_message_lock_returns_the_new_expiry() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_responder(|_, request| {
        assert_eq!(request.operation, "com.microsoft:renew-lock");
        assert_eq!(request.body["lock-tokens"][0], "tok-1");
        Ok(crate::transport::ManagementResponse::ok(serde_json::json!({
            "expirations": [chrono::Utc::now() + chrono::Duration::seconds(90)],
        })))
    });
    let factory = factory_with(Arc::clone(&transport));
    let client = factory.management_client(orders()).await.unwrap();

    let stale = LockToken::new("tok-1", Timestamp::now());
    let renewed = client.renew_message_lock(&stale).await.unwrap();

    assert_eq!(renewed.token(), "tok-1");
    assert!(!renewed.is_expired());
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn update_disposition_carries_wire_fields() {
    let transport = Arc::new(MemoryTransport::new());
    let factory = factory_with(Arc::clone(&transport));
    let client = factory.management_client(orders()).await.unwrap();

    let token = LockToken::new("tok-2", Timestamp::after(Duration::from_secs(30)));
    client
        .update_disposition(&token, DispositionKind::DeadLetter, Some("poison"))
        .await
        .unwrap();

    let links = transport.last_connection().unwrap().request_links();
    let requests = links[0].requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].operation, "com.microsoft:update-disposition");
    assert_eq!(requests[0].body["disposition-status"], "suspended");
    assert_eq!(requests[0].body["deadletter-reason"], "poison");
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn peek_messages_parses_the_response_body() {
    let transport = Arc::new(MemoryTransport::new());
    let peeked = Message::new("peeked-body");
    let peeked_json = serde_json::to_value(&peeked).unwrap();
    transport.set_responder(move |_, request| {
        assert_eq!(request.operation, "com.microsoft:peek-message");
        assert_eq!(request.body["from-sequence-number"], 7);
        Ok(crate::transport::ManagementResponse::ok(serde_json::json!({
            "messages": [peeked_json.clone()],
        })))
    });
    let factory = factory_with(Arc::clone(&transport));
    let client = factory.management_client(orders()).await.unwrap();

    let messages = client.peek_messages(7, 1).await.unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, peeked.body);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn schedule_and_cancel_round_trip() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_responder(|_, request| {
        match request.operation.as_str() {
            "com.microsoft:schedule-message" => {
                Ok(crate::transport::ManagementResponse::ok(serde_json::json!({
                    "sequence-numbers": [42],
                })))
            }
            "com.microsoft:cancel-scheduled-message" => {
                assert_eq!(request.body["sequence-numbers"][0], 42);
                Ok(crate::transport::ManagementResponse::ok(
                    serde_json::json!({}),
                ))
            }
            other => panic!("unexpected operation: {other}"),
        }
    });
    let factory = factory_with(Arc::clone(&transport));
    let client = factory.management_client(orders()).await.unwrap();

    let sequence = client
        .schedule_message(
            &Message::new("later"),
            Timestamp::after(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    assert_eq!(sequence, 42);

    client.cancel_scheduled_message(sequence).await.unwrap();
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn non_success_management_status_is_an_error() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_responder(|_, _| {
        Ok(crate::transport::ManagementResponse {
            status_code: 410,
            description: "lock expired".to_string(),
            body: serde_json::Value::Null,
        })
    });
    let factory = factory_with(Arc::clone(&transport));
    let client = factory.management_client(orders()).await.unwrap();

    let result = client.cancel_scheduled_message(1).await;

    assert!(matches!(
        result,
        Err(AmqpError::RequestFailed {
            status_code: 410,
            ..
        })
    ));
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn factory_close_is_terminal_and_idempotent() {
    let transport = Arc::new(MemoryTransport::new());
    let factory = factory_with(Arc::clone(&transport));
    let client = factory.management_client(orders()).await.unwrap();
    let sender = factory.create_sender(orders()).await.unwrap();
    sender.send(&Message::new("before-close")).await.unwrap();

    factory.close().await;
    factory.close().await;

    assert!(transport.last_connection().unwrap().is_closed());
    assert!(matches!(
        factory.create_sender(orders()).await,
        Err(AmqpError::ClientClosed { .. })
    ));
    assert!(matches!(
        factory.management_client(orders()).await,
        Err(AmqpError::ClientClosed { .. })
    ));
    // The cache refused the released client's next request
    assert!(client.cancel_scheduled_message(1).await.is_err());
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let result = MessagingFactory::new(
        ClientConfig::new(""),
        transport,
        TokenProvider::sas("kn", "key"),
    );

    assert!(matches!(
        result.map(|_| ()),
        Err(AmqpError::InvalidArgument { .. })
    ));
}
