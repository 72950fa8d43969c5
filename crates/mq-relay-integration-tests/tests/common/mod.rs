//! Common test utilities for mq-relay integration tests
//!
//! This module provides:
//! - Manager and settings builders wired to an in-memory broker
//! - Recording and failing message handlers
//! - A simulated request/reply service
//! - Polling helpers for asynchronous delivery

use async_trait::async_trait;
use mq_relay::{
    ConnectionManager, Destination, FailoverSettings, InMemoryBroker, ListenerSettings, Message,
    MessageHandler, MessagingSettings, ReceivedMessage,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::time::{sleep, Duration};

pub const PRIMARY: &str = "tcp://broker-a:61616";
pub const SECONDARY: &str = "tcp://broker-b:61616";
pub const TERTIARY: &str = "tcp://broker-c:61616";

static TRACING: Once = Once::new();

/// Route library logs to the test output; filter with `RUST_LOG`
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Builders
// ============================================================================

#[allow(dead_code)]
pub fn queue(name: &str) -> Destination {
    Destination::queue(&format!("{}/{}", PRIMARY, name)).unwrap()
}

#[allow(dead_code)]
pub fn topic(name: &str) -> Destination {
    Destination::topic(&format!("{}/{}", PRIMARY, name)).unwrap()
}

/// Failover across all three brokers with millisecond backoff
#[allow(dead_code)]
pub fn fast_failover(max_attempts: u32) -> FailoverSettings {
    FailoverSettings {
        broker_uris: vec![
            PRIMARY.to_string(),
            SECONDARY.to_string(),
            TERTIARY.to_string(),
        ],
        max_reconnect_attempts: max_attempts,
        initial_reconnect_delay: Duration::from_millis(1),
        max_reconnect_delay: Duration::from_millis(4),
        ..FailoverSettings::default()
    }
}

#[allow(dead_code)]
pub fn settings_with(listener: ListenerSettings) -> MessagingSettings {
    MessagingSettings {
        failover: Some(fast_failover(6)),
        listener,
        ..MessagingSettings::default()
    }
}

#[allow(dead_code)]
pub fn create_manager(broker: &InMemoryBroker, settings: MessagingSettings) -> ConnectionManager {
    init_tracing();
    ConnectionManager::new(Arc::new(broker.clone()), settings).expect("valid messaging settings")
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler recording `(body, delivery count)` and failing the first
/// `failures` messages it sees
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<(String, u32)>>>,
    failures_left: Arc<AtomicU32>,
}

impl RecordingHandler {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn failing(failures: u32) -> Self {
        let handler = Self::default();
        handler.failures_left.store(failures, Ordering::SeqCst);
        handler
    }

    #[allow(dead_code)]
    pub fn bodies(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(body, _)| body.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub fn delivery_counts(&self) -> Vec<u32> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, count)| *count)
            .collect()
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        self.received.lock().unwrap().push((
            message.body_text().unwrap_or_default().to_string(),
            message.delivery_count,
        ));

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            anyhow::bail!("handler rejected message");
        }
        Ok(())
    }
}

/// Service answering each request on its reply-to with `{prefix}{body}`
#[derive(Clone)]
#[allow(dead_code)]
pub struct EchoService {
    broker: InMemoryBroker,
    prefix: String,
}

impl EchoService {
    #[allow(dead_code)]
    pub fn new(broker: &InMemoryBroker, prefix: &str) -> Self {
        Self {
            broker: broker.clone(),
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl MessageHandler for EchoService {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        let Some(reply_to) = &message.reply_to else {
            anyhow::bail!("request without reply-to");
        };
        let mut reply = Message::text(format!(
            "{}{}",
            self.prefix,
            message.body_text().unwrap_or_default()
        ));
        reply.correlation_id = message.correlation_id.clone();
        self.broker.publish(reply_to, reply);
        Ok(())
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` until it holds, panicking after two seconds
#[allow(dead_code)]
pub async fn eventually(description: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {}", description);
}
