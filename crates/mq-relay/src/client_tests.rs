//! Tests for the client send path.

use super::*;
use crate::providers::InMemoryBroker;
use std::time::Duration;

const HOST_A: &str = "tcp://broker-a:61616";
const HOST_B: &str = "tcp://broker-b:61616";
const HOST_C: &str = "tcp://broker-c:61616";

fn fast_failover(max_attempts: u32) -> FailoverSettings {
    FailoverSettings {
        max_reconnect_attempts: max_attempts,
        initial_reconnect_delay: Duration::from_millis(1),
        max_reconnect_delay: Duration::from_millis(2),
        ..FailoverSettings::default()
    }
}

fn client_on(broker: &InMemoryBroker, failover: FailoverSettings) -> (ClientBase, Arc<SharedConnection>) {
    let shared = Arc::new(SharedConnection::new(Arc::new(broker.clone())));
    let destination = Destination::queue(&format!("{}/orders", HOST_A)).unwrap();
    let client = ClientBase::new(destination, shared.clone(), Arc::new(failover), None);
    (client, shared)
}

async fn wait_until_connected(client: &ClientBase) {
    for _ in 0..400 {
        if client.is_connected().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("client did not reconnect");
}

// ============================================================================
// Connect
// ============================================================================

mod connect {
    use super::*;

    #[tokio::test]
    async fn test_connect_succeeds_after_fewer_failures_than_the_maximum() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(2);
        let (client, _) = client_on(&broker, fast_failover(3));

        client.connect().await.unwrap();

        assert!(client.is_connected().await);
        assert_eq!(broker.connect_attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_connect_fails_fatally_at_the_maximum() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(3);
        let (client, _) = client_on(&broker, fast_failover(3));

        let error = client.connect().await.unwrap_err();

        assert!(error.is_fatal());
        match error {
            MessagingError::ConnectFailed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, TransportError::ConnectionRefused { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.connect_attempts().len(), 3);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_rotates_through_failover_hosts() {
        let broker = InMemoryBroker::new();
        broker.refuse_host(HOST_A);
        let failover = FailoverSettings {
            broker_uris: vec![HOST_A.to_string(), HOST_B.to_string(), HOST_C.to_string()],
            ..fast_failover(5)
        };
        let (client, _) = client_on(&broker, failover);

        client.connect().await.unwrap();

        assert_eq!(
            broker.connect_attempts(),
            vec![HOST_A.to_string(), HOST_A.to_string(), HOST_B.to_string()]
        );
        assert_eq!(client.destination().host(), HOST_B);
        assert_eq!(client.destination().name(), "orders");
        assert_eq!(client.retry_counter().total_attempts(), 2);
    }

    #[tokio::test]
    async fn test_connect_is_a_no_op_when_already_connected() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));

        client.connect().await.unwrap();
        client.connect().await.unwrap();

        assert_eq!(broker.connect_attempts().len(), 1);
    }
}

// ============================================================================
// Send
// ============================================================================

mod send {
    use super::*;

    #[tokio::test]
    async fn test_send_assigns_correlation_id_when_missing() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));

        let correlation_id = client.send_message(Message::text("order")).await.unwrap();

        assert!(!correlation_id.is_empty());
        let sent = broker.sent_to(&format!("{}/orders", HOST_A));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].correlation_id.as_deref(), Some(correlation_id.as_str()));
    }

    #[tokio::test]
    async fn test_send_keeps_existing_correlation_id() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));

        let correlation_id = client
            .send_message(Message::text("order").with_correlation_id("order-42"))
            .await
            .unwrap();

        assert_eq!(correlation_id, "order-42");
    }

    #[tokio::test]
    async fn test_failed_send_reconnects_and_retries() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));
        client.connect().await.unwrap();
        broker.fail_sends(1);

        client.send_message(Message::text("order")).await.unwrap();

        assert_eq!(broker.sent_to(&format!("{}/orders", HOST_A)).len(), 1);
        assert_eq!(broker.connect_attempts().len(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_send_fails_fatally_when_retries_are_exhausted() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(2));
        broker.fail_sends(10);

        let error = client.send_message(Message::text("order")).await.unwrap_err();

        assert!(matches!(
            error,
            MessagingError::SendFailed { attempts: 2, .. }
        ));
        assert!(broker.sent_to(&format!("{}/orders", HOST_A)).is_empty());
    }

    #[tokio::test]
    async fn test_one_way_client_sends() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));
        let one_way = OneWayClient::new(client);

        one_way.send_one_way(Message::text("fire")).await.unwrap();

        assert_eq!(broker.sent_to(&format!("{}/orders", HOST_A)).len(), 1);
    }
}

// ============================================================================
// Reconnect
// ============================================================================

mod reconnect {
    use super::*;

    #[tokio::test]
    async fn test_connection_exception_triggers_reconnect() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));
        client.connect().await.unwrap();

        broker.drop_connections();

        wait_until_connected(&client).await;
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.connect_attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_replaced_connection_is_picked_up_lazily() {
        let broker = InMemoryBroker::new();
        let (client, shared) = client_on(&broker, fast_failover(3));
        client.connect().await.unwrap();

        shared.reconnect(HOST_A).await.unwrap();
        assert!(!client.is_connected().await);

        client.send_message(Message::text("after")).await.unwrap();

        assert!(client.is_connected().await);
        assert_eq!(broker.connect_attempts().len(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_dispose_twice_is_harmless() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));
        client.connect().await.unwrap();

        client.dispose().await;
        client.dispose().await;

        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_disposed_client_ignores_connection_exceptions() {
        let broker = InMemoryBroker::new();
        let (client, _) = client_on(&broker, fast_failover(3));
        client.connect().await.unwrap();
        client.dispose().await;

        broker.drop_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broker.connect_attempts().len(), 1);
    }
}
