//! Tests for the queue listener.

use super::*;
use crate::listener::ListenerStatus;
use crate::message::{Message, ReceivedMessage};
use crate::providers::InMemoryBroker;
use std::sync::Mutex;
use std::time::Duration;

const HOST: &str = "tcp://broker:61616";

fn invoices() -> Destination {
    Destination::queue(&format!("{}/invoices", HOST)).unwrap()
}

fn queue_listener(broker: &InMemoryBroker, settings: ListenerSettings) -> QueueListener {
    let shared = Arc::new(SharedConnection::new(Arc::new(broker.clone())));
    let failover = FailoverSettings {
        max_reconnect_attempts: 3,
        initial_reconnect_delay: Duration::from_millis(1),
        ..FailoverSettings::default()
    };
    QueueListener::new(invoices(), shared, Arc::new(failover), settings)
}

#[tokio::test]
async fn test_start_registers_consumer_and_delivers() {
    let broker = InMemoryBroker::new();
    let listener = queue_listener(&broker, ListenerSettings::default());
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let sink = bodies.clone();
    listener.set_handler(move |message: &ReceivedMessage| {
        sink.lock()
            .unwrap()
            .push(message.body_text().unwrap_or_default().to_string());
        Ok(())
    });

    listener.start().await.unwrap();
    broker.publish(&invoices(), Message::text("invoice-1"));
    broker.publish(&invoices(), Message::text("invoice-2"));

    for _ in 0..400 {
        if bodies.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        *bodies.lock().unwrap(),
        vec!["invoice-1".to_string(), "invoice-2".to_string()]
    );
    assert_eq!(listener.status().await, ListenerStatus::ConsumerRegistered);
    assert_eq!(broker.commits(), 2);
}

#[tokio::test]
async fn test_connection_id_becomes_client_id() {
    let broker = InMemoryBroker::new();
    let settings = ListenerSettings {
        connection_id: Some("invoice-service".to_string()),
        ..ListenerSettings::default()
    };
    let listener = queue_listener(&broker, settings);

    listener.start().await.unwrap();

    assert_eq!(listener.client_id(), Some("invoice-service"));
    assert_eq!(broker.client_ids(), vec!["invoice-service".to_string()]);
}

#[tokio::test]
async fn test_start_fails_when_broker_is_unreachable() {
    let broker = InMemoryBroker::new();
    broker.refuse_host(HOST);
    let listener = queue_listener(&broker, ListenerSettings::default());

    let error = listener.start().await.unwrap_err();

    assert!(matches!(error, MessagingError::ConnectFailed { attempts: 3, .. }));
    assert_eq!(listener.status().await, ListenerStatus::Disconnected);
}
