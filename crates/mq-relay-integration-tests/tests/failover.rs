//! Integration tests for connect retry and broker failover
//!
//! These tests verify:
//! - Connect succeeds after fewer induced failures than the maximum
//! - Connect fails fatally once the maximum is reached
//! - Failover hosts are selected deterministically
//! - Connection loss is healed without caller involvement
//! - A passive listener keeps consuming when a sibling fails over or the
//!   manager reconnects

mod common;

use common::*;
use mq_relay::{
    Destination, InMemoryBroker, ListenerSettings, ListenerStatus, Message, MessagingError,
    TransportError,
};

#[tokio::test]
async fn test_connect_succeeds_for_every_failure_count_below_the_maximum() {
    let max_attempts = 4;
    for failures in 0..max_attempts {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(failures);
        let manager = create_manager(
            &broker,
            mq_relay::MessagingSettings {
                failover: Some(fast_failover(max_attempts)),
                ..Default::default()
            },
        );
        let client = manager.create_client(&queue("orders")).unwrap();

        client.connect().await.unwrap();

        assert_eq!(broker.connect_attempts().len() as u32, failures + 1);
        manager.dispose().await;
    }
}

#[tokio::test]
async fn test_connect_fails_fatally_at_the_maximum() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(4);
    let manager = create_manager(
        &broker,
        mq_relay::MessagingSettings {
            failover: Some(fast_failover(4)),
            ..Default::default()
        },
    );
    let client = manager.create_client(&queue("orders")).unwrap();

    let error = client.connect().await.unwrap_err();

    assert!(error.is_fatal());
    assert!(matches!(
        error,
        MessagingError::ConnectFailed {
            attempts: 4,
            source: TransportError::ConnectionRefused { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_failover_walks_the_broker_list_in_order() {
    let broker = InMemoryBroker::new();
    broker.refuse_host(PRIMARY);
    broker.refuse_host(SECONDARY);
    let manager = create_manager(&broker, settings_with(ListenerSettings::default()));
    let client = manager.create_client(&queue("orders")).unwrap();

    client.send_one_way(Message::text("order-1")).await.unwrap();

    // The first failure retries the configured host, then rotation begins
    assert_eq!(
        broker.connect_attempts(),
        vec![
            PRIMARY.to_string(),
            PRIMARY.to_string(),
            SECONDARY.to_string(),
            TERTIARY.to_string(),
        ]
    );
    assert_eq!(client.destination().host(), TERTIARY);
    assert_eq!(
        broker.sent_to(&format!("{}/orders", TERTIARY)).len(),
        1
    );
}

#[tokio::test]
async fn test_failover_selection_continues_across_calls() {
    let broker = InMemoryBroker::new();
    let manager = create_manager(&broker, settings_with(ListenerSettings::default()));
    let client = manager.create_client(&queue("orders")).unwrap();
    client.connect().await.unwrap();

    broker.fail_sends(1);
    client.send_one_way(Message::text("first")).await.unwrap();
    assert_eq!(client.destination().host(), PRIMARY);

    broker.fail_sends(1);
    client.send_one_way(Message::text("second")).await.unwrap();
    assert_eq!(client.destination().host(), SECONDARY);
    assert_eq!(client.retry_counter().total_attempts(), 2);
}

#[tokio::test]
async fn test_lost_connection_heals_listener_and_client() {
    let broker = InMemoryBroker::new();
    let manager = create_manager(&broker, settings_with(ListenerSettings::default()));
    let handler = RecordingHandler::new();
    let listener = manager.create_listener(&queue("orders")).unwrap();
    listener.set_handler(handler.clone());
    listener.start().await.unwrap();
    let client = manager.create_client(&queue("orders")).unwrap();
    client.connect().await.unwrap();

    broker.drop_connections();
    eventually("listener consumer re-registered", || {
        broker.open_connections() == 1
            && broker.active_consumers(&format!("{}/orders", PRIMARY))
                + broker.active_consumers(&format!("{}/orders", SECONDARY))
                + broker.active_consumers(&format!("{}/orders", TERTIARY))
                == 1
    })
    .await;

    client.send_one_way(Message::text("after-loss")).await.unwrap();
    eventually("message handled", || handler.call_count() == 1).await;
    assert_eq!(handler.bodies(), vec!["after-loss".to_string()]);
    assert_eq!(client.destination().host(), listener.destination().host());
}

#[tokio::test]
async fn test_passive_listener_survives_sibling_failover() {
    let broker = InMemoryBroker::new();
    let manager = create_manager(&broker, settings_with(ListenerSettings::default()));
    let handler = RecordingHandler::new();
    let listener = manager.create_listener(&queue("orders")).unwrap();
    listener.set_handler(handler.clone());
    listener.start().await.unwrap();
    let audit = manager.create_client(&queue("audit")).unwrap();

    broker.publish(&queue("orders"), Message::text("before"));
    eventually("first order handled", || handler.call_count() == 1).await;

    broker.fail_sends(1);
    audit.send_one_way(Message::text("entry")).await.unwrap();
    broker.publish(&queue("orders"), Message::text("after"));

    eventually("second order handled", || handler.call_count() == 2).await;
    assert_eq!(
        handler.bodies(),
        vec!["before".to_string(), "after".to_string()]
    );
    assert_eq!(listener.status().await, ListenerStatus::ConsumerRegistered);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_passive_listener_follows_manager_reconnect() {
    let broker = InMemoryBroker::new();
    let manager = create_manager(&broker, settings_with(ListenerSettings::default()));
    let handler = RecordingHandler::new();
    let listener = manager.create_listener(&queue("orders")).unwrap();
    listener.set_handler(handler.clone());
    listener.start().await.unwrap();

    manager.reconnect(SECONDARY).await.unwrap();

    let moved = format!("{}/orders", SECONDARY);
    eventually("consumer on the new broker", || {
        broker.active_consumers(&moved) == 1
    })
    .await;
    broker.publish(&Destination::queue(&moved).unwrap(), Message::text("moved"));

    eventually("order handled on the new broker", || handler.call_count() == 1).await;
    assert_eq!(listener.destination().host(), SECONDARY);
    assert_eq!(broker.active_consumers(&format!("{}/orders", PRIMARY)), 0);
}
