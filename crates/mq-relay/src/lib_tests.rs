//! Tests for the mq-relay crate root.

use super::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_round_trip_through_crate_root_types() {
    let broker = InMemoryBroker::new();
    let manager =
        ConnectionManager::new(Arc::new(broker.clone()), MessagingSettings::default()).unwrap();
    let orders = Destination::queue("tcp://broker:61616/orders").unwrap();

    let listener = manager.create_listener(&orders).unwrap();
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = listener.set_handler(move |message: &ReceivedMessage| {
        sender.send(message.body_text().unwrap_or_default().to_string())?;
        Ok(())
    });
    listener.start().await.unwrap();

    let client = manager.create_client(&orders).unwrap();
    client.send_one_way(Message::text("order-1")).await.unwrap();

    let body = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .unwrap();
    assert_eq!(body.as_deref(), Some("order-1"));

    manager.dispose().await;
    assert_eq!(broker.open_connections(), 0);
}

#[test]
fn test_default_settings_are_valid() {
    let settings = MessagingSettings::default();

    assert!(settings.validate().is_ok());
    assert_eq!(
        settings.listener.acknowledgement_mode,
        AcknowledgementMode::Transactional
    );
    assert_eq!(settings.listener.maximum_redelivery_count, 0);
    assert!(settings.failover.is_none());
}
