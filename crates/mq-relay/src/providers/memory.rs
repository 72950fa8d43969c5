//! In-memory broker implementation for testing and development.
//!
//! This module provides a broker that implements every transport trait:
//! - Queues with competing consumers and topics with fan-out
//! - Durable topic subscriptions that keep a backlog while disconnected
//! - Transactional sessions with redelivery counting and a native
//!   dead letter queue once a consumer's redelivery limit is exceeded
//! - Temporary queues bound to the connection that created them
//! - Fault injection: refused connects, failed sends and dropped connections
//! - Operation statistics for assertions
//!
//! Consumers have a prefetch of one: a consumer receives its next message only
//! after the listener callback for the previous one has returned.

use crate::destination::{Destination, DestinationKind, DestinationUri};
use crate::error::TransportError;
use crate::message::Message;
use crate::transport::{
    AcknowledgementMode, BrokerConnection, BrokerConnector, BrokerMessage, BrokerSession,
    ConsumerOptions, ExceptionListener, ExceptionListenerId, MessageConsumer, MessageListener,
    MessageProducer, MATCH_ALL_SELECTOR,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Queue the broker moves messages to once their redelivery limit is exceeded
pub const NATIVE_DEAD_LETTER_QUEUE: &str = "DLQ";

/// Redeliveries allowed when a consumer does not set its own limit
pub const DEFAULT_MAX_REDELIVERIES: u32 = 6;

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Debug, Clone)]
struct Envelope {
    message: Message,
    delivery_count: u32,
    origin_connection: Option<u64>,
    expires_at: Option<Instant>,
}

impl Envelope {
    fn new(message: Message, origin_connection: Option<u64>) -> Self {
        let expires_at = message.time_to_live.map(|ttl| Instant::now() + ttl);
        Self {
            message,
            delivery_count: 0,
            origin_connection,
            expires_at,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum QueueOwner {
    Broker,
    Temporary {
        connection_id: u64,
    },
    Subscription {
        topic_key: String,
        durable: bool,
        no_local_connection: Option<u64>,
    },
}

struct QueueState {
    /// Destination reported on deliveries; the topic for subscriptions
    destination: Destination,
    messages: VecDeque<Envelope>,
    consumers: Vec<u64>,
    next_consumer: usize,
    owner: QueueOwner,
}

impl QueueState {
    fn new(destination: Destination, owner: QueueOwner) -> Self {
        Self {
            destination,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            owner,
        }
    }
}

struct ConnectionState {
    host: String,
    client_id: Option<String>,
    started: bool,
    exception_listeners: Vec<(ExceptionListenerId, Weak<dyn ExceptionListener>)>,
    sessions: Vec<u64>,
}

struct Unacknowledged {
    tag: u64,
    queue_key: String,
    envelope: Envelope,
    max_redeliveries: u32,
}

struct PendingSend {
    host: String,
    destination: Destination,
    envelope: Envelope,
}

struct SessionState {
    connection_id: u64,
    mode: AcknowledgementMode,
    unacknowledged: Vec<Unacknowledged>,
    pending_sends: Vec<PendingSend>,
    consumers: Vec<u64>,
}

struct ConsumerState {
    session_id: u64,
    connection_id: u64,
    queue_key: String,
    max_redeliveries: u32,
    sender: Option<mpsc::UnboundedSender<Arc<InMemoryDelivery>>>,
    busy: bool,
}

#[derive(Default)]
struct Faults {
    refused_hosts: HashSet<String>,
    refuse_connects: u32,
    fail_sends: u32,
}

#[derive(Default)]
struct Stats {
    connect_attempts: Vec<String>,
    commits: u32,
    rollbacks: u32,
    sent: HashMap<String, Vec<Message>>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    queues: HashMap<String, QueueState>,
    /// Topic key to the keys of its subscription queues
    topics: HashMap<String, Vec<String>>,
    connections: HashMap<u64, ConnectionState>,
    sessions: HashMap<u64, SessionState>,
    consumers: HashMap<u64, ConsumerState>,
    faults: Faults,
    stats: Stats,
}

fn key_for(host: &str, name: &str) -> String {
    format!("{}/{}", host, name)
}

fn broker_error(message: impl Into<String>) -> TransportError {
    TransportError::Broker {
        code: "InMemory".to_string(),
        message: message.into(),
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_connection(&self, connection_id: u64) -> Result<&ConnectionState, TransportError> {
        self.connections
            .get(&connection_id)
            .ok_or(TransportError::ConnectionClosed)
    }

    fn ensure_session(&self, session_id: u64) -> Result<&SessionState, TransportError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or(TransportError::SessionClosed)?;
        self.ensure_connection(session.connection_id)?;
        Ok(session)
    }

    /// Put a message on a queue, or fan it out to a topic's subscriptions
    fn route(&mut self, host: &str, destination: &Destination, envelope: Envelope) {
        let key = key_for(host, destination.name());
        self.stats
            .sent
            .entry(key.clone())
            .or_default()
            .push(envelope.message.clone());

        match destination.kind() {
            DestinationKind::Queue => {
                let queue = self.queues.entry(key.clone()).or_insert_with(|| {
                    QueueState::new(destination.with_host(host), QueueOwner::Broker)
                });
                queue.messages.push_back(envelope);
                self.dispatch(&key);
            }
            DestinationKind::TemporaryQueue => match self.queues.get_mut(&key) {
                Some(queue) => {
                    queue.messages.push_back(envelope);
                    self.dispatch(&key);
                }
                None => debug!(destination = %key, "Temporary queue no longer exists, message discarded"),
            },
            DestinationKind::Topic => {
                let subscriptions = self.topics.get(&key).cloned().unwrap_or_default();
                for subscription in subscriptions {
                    let Some(queue) = self.queues.get_mut(&subscription) else {
                        continue;
                    };
                    if let QueueOwner::Subscription {
                        no_local_connection: Some(connection_id),
                        ..
                    } = &queue.owner
                    {
                        if envelope.origin_connection == Some(*connection_id) {
                            continue;
                        }
                    }
                    queue.messages.push_back(envelope.clone());
                    self.dispatch(&subscription);
                }
            }
        }
    }

    /// Hand queued messages to idle consumers whose connection is started
    fn dispatch(&mut self, key: &str) {
        loop {
            let Some(queue) = self.queues.get(key) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let start = queue.next_consumer % count;
            let chosen = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&index| self.is_ready(queue.consumers[index]));
            let Some(index) = chosen else {
                return;
            };
            let consumer_id = queue.consumers[index];

            let tag = self.next_id();
            let Some(queue) = self.queues.get_mut(key) else {
                return;
            };
            queue.next_consumer = index + 1;
            let Some(mut envelope) = queue.messages.pop_front() else {
                return;
            };
            if envelope.is_expired() {
                debug!(destination = %key, message_id = %envelope.message.message_id, "Expired message discarded");
                continue;
            }
            envelope.delivery_count += 1;
            let destination = queue.destination.clone();

            let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
                return;
            };
            consumer.busy = true;
            let session_id = consumer.session_id;
            let max_redeliveries = consumer.max_redeliveries;
            let delivery = Arc::new(InMemoryDelivery {
                message: envelope.message.clone(),
                destination,
                delivery_count: envelope.delivery_count,
                consumer_id,
                tag,
            });
            let sent = consumer
                .sender
                .as_ref()
                .map(|sender| sender.send(delivery).is_ok())
                .unwrap_or(false);

            if !sent {
                consumer.busy = false;
                consumer.sender = None;
                envelope.delivery_count -= 1;
                if let Some(queue) = self.queues.get_mut(key) {
                    queue.messages.push_front(envelope);
                }
                continue;
            }

            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.unacknowledged.push(Unacknowledged {
                    tag,
                    queue_key: key.to_string(),
                    envelope,
                    max_redeliveries,
                });
            }
        }
    }

    fn is_ready(&self, consumer_id: u64) -> bool {
        let Some(consumer) = self.consumers.get(&consumer_id) else {
            return false;
        };
        consumer.sender.is_some()
            && !consumer.busy
            && self
                .connections
                .get(&consumer.connection_id)
                .map(|connection| connection.started)
                .unwrap_or(false)
    }

    /// Return a message for redelivery, or move it to the native dead letter
    /// queue once it has been delivered more often than the limit allows
    fn requeue(&mut self, unacknowledged: Unacknowledged) {
        let Unacknowledged {
            queue_key,
            envelope,
            max_redeliveries,
            ..
        } = unacknowledged;

        let Some(queue) = self.queues.get_mut(&queue_key) else {
            return;
        };

        if envelope.delivery_count > max_redeliveries {
            let host = queue.destination.host().to_string();
            debug!(
                destination = %queue_key,
                delivery_count = envelope.delivery_count,
                "Redelivery limit exceeded, moving message to native dead letter queue"
            );
            match DestinationUri::new(host.as_str(), NATIVE_DEAD_LETTER_QUEUE) {
                Ok(uri) => {
                    let dead_letter = Destination::new(DestinationKind::Queue, uri);
                    let envelope = Envelope::new(envelope.message, envelope.origin_connection);
                    self.route(&host, &dead_letter, envelope);
                }
                Err(e) => debug!(error = %e, "Native dead letter queue unavailable"),
            }
            return;
        }

        queue.messages.push_front(envelope);
        self.dispatch(&queue_key);
    }

    fn close_consumer(&mut self, consumer_id: u64) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };

        if let Some(session) = self.sessions.get_mut(&consumer.session_id) {
            session.consumers.retain(|id| *id != consumer_id);
        }

        let mut remove_queue = None;
        if let Some(queue) = self.queues.get_mut(&consumer.queue_key) {
            queue.consumers.retain(|id| *id != consumer_id);
            if let QueueOwner::Subscription {
                topic_key,
                durable: false,
                ..
            } = &queue.owner
            {
                remove_queue = Some(topic_key.clone());
            }
        }

        if let Some(topic_key) = remove_queue {
            self.queues.remove(&consumer.queue_key);
            if let Some(subscriptions) = self.topics.get_mut(&topic_key) {
                subscriptions.retain(|key| *key != consumer.queue_key);
            }
        } else {
            // Remaining consumers may pick up what this one left behind
            self.dispatch(&consumer.queue_key);
        }
    }

    fn close_session(&mut self, session_id: u64) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };

        if let Some(connection) = self.connections.get_mut(&session.connection_id) {
            connection.sessions.retain(|id| *id != session_id);
        }

        // Closing a session aborts its open transaction
        for unacknowledged in session.unacknowledged {
            self.requeue(unacknowledged);
        }
        for consumer_id in session.consumers {
            self.close_consumer(consumer_id);
        }
    }

    fn close_connection(
        &mut self,
        connection_id: u64,
    ) -> Vec<(ExceptionListenerId, Weak<dyn ExceptionListener>)> {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return Vec::new();
        };

        for session_id in connection.sessions {
            self.close_session(session_id);
        }

        let temporary: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == QueueOwner::Temporary { connection_id })
            .map(|(key, _)| key.clone())
            .collect();
        for key in temporary {
            self.queues.remove(&key);
        }

        connection.exception_listeners
    }

    fn settle(&mut self, consumer_id: u64, tag: u64, succeeded: bool) {
        let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
            return;
        };
        consumer.busy = false;
        let session_id = consumer.session_id;
        let queue_key = consumer.queue_key.clone();

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if !session.mode.is_transactional() {
                let position = session
                    .unacknowledged
                    .iter()
                    .position(|entry| entry.tag == tag);
                if let Some(position) = position {
                    let entry = session.unacknowledged.remove(position);
                    if !succeeded {
                        self.requeue(entry);
                    }
                }
            }
        }

        self.dispatch(&queue_key);
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker shared by every connection opened through it
///
/// # Examples
///
/// ```rust
/// use mq_relay::{Destination, InMemoryBroker, Message};
///
/// let broker = InMemoryBroker::new();
/// let orders = Destination::queue("tcp://broker:61616/orders").unwrap();
///
/// broker.publish(&orders, Message::text("hello"));
/// assert_eq!(broker.queue_depth("tcp://broker:61616/orders"), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker").finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // Every mutation leaves the state consistent before it can panic
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Refuse the next `count` connection attempts regardless of host
    pub fn refuse_connections(&self, count: u32) {
        self.state().faults.refuse_connects = count;
    }

    /// Refuse every connection attempt to `host` until [`Self::allow_host`]
    pub fn refuse_host(&self, host: &str) {
        self.state().faults.refused_hosts.insert(host.to_string());
    }

    pub fn allow_host(&self, host: &str) {
        self.state().faults.refused_hosts.remove(host);
    }

    /// Fail the next `count` producer sends
    pub fn fail_sends(&self, count: u32) {
        self.state().faults.fail_sends = count;
    }

    /// Close every open connection and notify their exception listeners
    pub fn drop_connections(&self) {
        let listeners: Vec<Weak<dyn ExceptionListener>> = {
            let mut state = self.state();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let mut listeners = Vec::new();
            for id in ids {
                listeners.extend(
                    state
                        .close_connection(id)
                        .into_iter()
                        .map(|(_, listener)| listener),
                );
            }
            listeners
        };

        for listener in listeners.into_iter().filter_map(|l| l.upgrade()) {
            tokio::spawn(async move {
                listener.on_exception(TransportError::ConnectionClosed).await;
            });
        }
    }

    // ------------------------------------------------------------------------
    // External traffic
    // ------------------------------------------------------------------------

    /// Deliver a message as if sent by another broker client
    pub fn publish(&self, destination: &Destination, message: Message) {
        let envelope = Envelope::new(message, None);
        self.state().route(destination.host(), destination, envelope);
    }

    /// Deliver a message that the broker has already delivered
    /// `previous_deliveries` times
    pub fn publish_redelivered(
        &self,
        destination: &Destination,
        message: Message,
        previous_deliveries: u32,
    ) {
        let mut envelope = Envelope::new(message, None);
        envelope.delivery_count = previous_deliveries;
        self.state().route(destination.host(), destination, envelope);
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Hosts of every connection attempt, in order
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state().stats.connect_attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Client ids of the open connections that have one
    pub fn client_ids(&self) -> Vec<String> {
        self.state()
            .connections
            .values()
            .filter_map(|connection| connection.client_id.clone())
            .collect()
    }

    pub fn commits(&self) -> u32 {
        self.state().stats.commits
    }

    pub fn rollbacks(&self) -> u32 {
        self.state().stats.rollbacks
    }

    /// Messages routed to `uri` (`host/name`), including topic publications
    pub fn sent_to(&self, uri: &str) -> Vec<Message> {
        self.state().stats.sent.get(uri).cloned().unwrap_or_default()
    }

    /// Messages the broker itself dead-lettered on `host`
    pub fn native_dead_letters(&self, host: &str) -> Vec<Message> {
        self.sent_to(&key_for(host, NATIVE_DEAD_LETTER_QUEUE))
    }

    /// Messages waiting on a queue, or summed over a topic's subscriptions
    pub fn queue_depth(&self, uri: &str) -> usize {
        let state = self.state();
        match state.topics.get(uri) {
            Some(subscriptions) => subscriptions
                .iter()
                .filter_map(|key| state.queues.get(key))
                .map(|queue| queue.messages.len())
                .sum(),
            None => state
                .queues
                .get(uri)
                .map(|queue| queue.messages.len())
                .unwrap_or(0),
        }
    }

    /// Consumers attached to a queue, or summed over a topic's subscriptions
    pub fn active_consumers(&self, uri: &str) -> usize {
        let state = self.state();
        match state.topics.get(uri) {
            Some(subscriptions) => subscriptions
                .iter()
                .filter_map(|key| state.queues.get(key))
                .map(|queue| queue.consumers.len())
                .sum(),
            None => state
                .queues
                .get(uri)
                .map(|queue| queue.consumers.len())
                .unwrap_or(0),
        }
    }

    /// Durable subscriptions as `client_id:subscriber_id`, for a topic `uri`
    pub fn durable_subscriptions(&self, uri: &str) -> Vec<String> {
        let state = self.state();
        let prefix = format!("{}#", uri);
        let mut names: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| {
                matches!(queue.owner, QueueOwner::Subscription { durable: true, .. })
            })
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut state = self.state();
        state.stats.connect_attempts.push(host.to_string());

        if state.faults.refuse_connects > 0 {
            state.faults.refuse_connects -= 1;
            return Err(TransportError::ConnectionRefused {
                host: host.to_string(),
                message: "connection refused".to_string(),
            });
        }
        if state.faults.refused_hosts.contains(host) {
            return Err(TransportError::ConnectionRefused {
                host: host.to_string(),
                message: "host unreachable".to_string(),
            });
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                host: host.to_string(),
                client_id: None,
                started: false,
                exception_listeners: Vec::new(),
                sessions: Vec::new(),
            },
        );

        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
            host: host.to_string(),
        }))
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Connection handle; dropping it closes the connection
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    host: String,
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.broker.state().close_connection(self.id);
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_closed(&self) -> bool {
        !self.broker.state().connections.contains_key(&self.id)
    }

    fn client_id(&self) -> Option<String> {
        self.broker
            .state()
            .connections
            .get(&self.id)
            .and_then(|connection| connection.client_id.clone())
    }

    fn set_client_id(&self, client_id: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();

        let in_use = state.connections.iter().any(|(id, connection)| {
            *id != self.id && connection.client_id.as_deref() == Some(client_id)
        });
        if in_use {
            return Err(TransportError::InvalidClientId {
                client_id: client_id.to_string(),
                message: "already in use by another connection".to_string(),
            });
        }

        let connection = state
            .connections
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        connection.client_id = Some(client_id.to_string());
        Ok(())
    }

    fn add_exception_listener(&self, listener: Weak<dyn ExceptionListener>) -> ExceptionListenerId {
        let mut state = self.broker.state();
        let id = state.next_id();
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.exception_listeners.push((id, listener));
        }
        id
    }

    fn remove_exception_listener(&self, id: ExceptionListenerId) {
        if let Some(connection) = self.broker.state().connections.get_mut(&self.id) {
            connection
                .exception_listeners
                .retain(|(listener_id, _)| *listener_id != id);
        }
    }

    async fn create_session(
        &self,
        mode: AcknowledgementMode,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let mut state = self.broker.state();
        state.ensure_connection(self.id)?;

        let id = state.next_id();
        state.sessions.insert(
            id,
            SessionState {
                connection_id: self.id,
                mode,
                unacknowledged: Vec::new(),
                pending_sends: Vec::new(),
                consumers: Vec::new(),
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.sessions.push(id);
        }

        Ok(Box::new(InMemorySession {
            broker: self.broker.clone(),
            id,
            connection_id: self.id,
            host: self.host.clone(),
            mode,
        }))
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let connection = state
            .connections
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        connection.started = true;

        let keys: Vec<String> = state.queues.keys().cloned().collect();
        for key in keys {
            state.dispatch(&key);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // A locally closed connection raises no exceptions; only broker-side
        // loss notifies the registered listeners
        let _listeners = self.broker.state().close_connection(self.id);
        Ok(())
    }
}

/// Session handle; dropping it closes the session and aborts its transaction
pub struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
    connection_id: u64,
    host: String,
    mode: AcknowledgementMode,
}

impl InMemorySession {
    fn register_consumer(
        &self,
        state: &mut BrokerState,
        queue_key: &str,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, TransportError> {
        if let Some(selector) = &options.selector {
            if selector != MATCH_ALL_SELECTOR {
                return Err(broker_error(format!("unsupported selector '{}'", selector)));
            }
        }

        let id = state.next_id();
        state.consumers.insert(
            id,
            ConsumerState {
                session_id: self.id,
                connection_id: self.connection_id,
                queue_key: queue_key.to_string(),
                max_redeliveries: options
                    .max_redelivery_count
                    .unwrap_or(DEFAULT_MAX_REDELIVERIES),
                sender: None,
                busy: false,
            },
        );
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.consumers.push(id);
        }
        if let Some(queue) = state.queues.get_mut(queue_key) {
            queue.consumers.push(id);
        }

        Ok(Box::new(InMemoryConsumer {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn subscribe(
        &self,
        state: &mut BrokerState,
        topic: &Destination,
        queue_key: String,
        durable: bool,
        no_local: bool,
    ) {
        let topic_key = key_for(&self.host, topic.name());
        if !state.queues.contains_key(&queue_key) {
            state.queues.insert(
                queue_key.clone(),
                QueueState::new(
                    topic.with_host(self.host.as_str()),
                    QueueOwner::Subscription {
                        topic_key: topic_key.clone(),
                        durable,
                        no_local_connection: None,
                    },
                ),
            );
            state
                .topics
                .entry(topic_key)
                .or_default()
                .push(queue_key.clone());
        }

        if let Some(queue) = state.queues.get_mut(&queue_key) {
            if let QueueOwner::Subscription {
                no_local_connection,
                ..
            } = &mut queue.owner
            {
                *no_local_connection = no_local.then_some(self.connection_id);
            }
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.broker.state().close_session(self.id);
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.mode
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, TransportError> {
        self.broker.state().ensure_session(self.id)?;
        Ok(Box::new(InMemoryProducer {
            broker: self.broker.clone(),
            session_id: self.id,
            connection_id: self.connection_id,
            host: self.host.clone(),
            destination: destination.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, TransportError> {
        let mut state = self.broker.state();
        state.ensure_session(self.id)?;

        let key = key_for(&self.host, destination.name());
        match destination.kind() {
            DestinationKind::Queue => {
                state.queues.entry(key.clone()).or_insert_with(|| {
                    QueueState::new(destination.with_host(self.host.as_str()), QueueOwner::Broker)
                });
                self.register_consumer(&mut state, &key, &options)
            }
            DestinationKind::TemporaryQueue => {
                if !state.queues.contains_key(&key) {
                    return Err(broker_error(format!(
                        "temporary queue '{}' does not exist",
                        key
                    )));
                }
                self.register_consumer(&mut state, &key, &options)
            }
            DestinationKind::Topic => {
                let consumer_key = state.next_id();
                let queue_key = format!("{}#consumer-{}", key, consumer_key);
                self.subscribe(&mut state, destination, queue_key.clone(), false, options.no_local);
                self.register_consumer(&mut state, &queue_key, &options)
            }
        }
    }

    async fn create_durable_consumer(
        &self,
        topic: &Destination,
        subscriber_id: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, TransportError> {
        if topic.kind() != DestinationKind::Topic {
            return Err(broker_error(format!(
                "durable subscriptions require a topic, got {}",
                topic
            )));
        }

        let mut state = self.broker.state();
        state.ensure_session(self.id)?;

        let client_id = state
            .connections
            .get(&self.connection_id)
            .and_then(|connection| connection.client_id.clone())
            .ok_or_else(|| TransportError::InvalidClientId {
                client_id: String::new(),
                message: "durable subscriptions require a client id".to_string(),
            })?;

        let queue_key = format!(
            "{}#{}:{}",
            key_for(&self.host, topic.name()),
            client_id,
            subscriber_id
        );
        self.subscribe(&mut state, topic, queue_key.clone(), true, options.no_local);
        self.register_consumer(&mut state, &queue_key, &options)
    }

    async fn create_temporary_queue(&self) -> Result<Destination, TransportError> {
        let mut state = self.broker.state();
        state.ensure_session(self.id)?;

        let id = state.next_id();
        let name = format!("ID:temp-{}-{}", self.connection_id, id);
        let uri = DestinationUri::new(self.host.as_str(), name)
            .map_err(|e| broker_error(e.to_string()))?;
        let destination = Destination::new(DestinationKind::TemporaryQueue, uri);

        state.queues.insert(
            destination.uri().to_string(),
            QueueState::new(
                destination.clone(),
                QueueOwner::Temporary {
                    connection_id: self.connection_id,
                },
            ),
        );
        Ok(destination)
    }

    async fn commit(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.ensure_session(self.id)?;

        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::SessionClosed)?;
        if !session.mode.is_transactional() {
            return Err(broker_error("session is not transacted"));
        }
        session.unacknowledged.clear();
        let sends = std::mem::take(&mut session.pending_sends);

        state.stats.commits += 1;
        for send in sends {
            state.route(&send.host, &send.destination, send.envelope);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.ensure_session(self.id)?;

        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::SessionClosed)?;
        if !session.mode.is_transactional() {
            return Err(broker_error("session is not transacted"));
        }
        session.pending_sends.clear();
        let received = std::mem::take(&mut session.unacknowledged);

        state.stats.rollbacks += 1;
        for unacknowledged in received {
            state.requeue(unacknowledged);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state().close_session(self.id);
        Ok(())
    }
}

pub struct InMemoryProducer {
    broker: InMemoryBroker,
    session_id: u64,
    connection_id: u64,
    host: String,
    destination: Destination,
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let mode = state.ensure_session(self.session_id)?.mode;

        if state.faults.fail_sends > 0 {
            state.faults.fail_sends -= 1;
            return Err(TransportError::SendFailed {
                destination: self.destination.uri().to_string(),
                message: "send rejected".to_string(),
            });
        }

        let envelope = Envelope::new(message.clone(), Some(self.connection_id));
        if mode.is_transactional() {
            if let Some(session) = state.sessions.get_mut(&self.session_id) {
                session.pending_sends.push(PendingSend {
                    host: self.host.clone(),
                    destination: self.destination.clone(),
                    envelope,
                });
            }
        } else {
            state.route(&self.host, &self.destination, envelope);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Consumer handle; dropping it detaches the consumer
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    id: u64,
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.broker.state().close_consumer(self.id);
    }
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    fn set_listener(&self, listener: Arc<dyn MessageListener>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<InMemoryDelivery>>();

        {
            let mut state = self.broker.state();
            let Some(consumer) = state.consumers.get_mut(&self.id) else {
                return;
            };
            consumer.sender = Some(sender);
            let queue_key = consumer.queue_key.clone();
            state.dispatch(&queue_key);
        }

        let broker = self.broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let (consumer_id, tag) = (delivery.consumer_id, delivery.tag);
                let succeeded = listener.on_message(delivery).await.is_ok();
                broker.state().settle(consumer_id, tag, succeeded);
            }
        });
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state().close_consumer(self.id);
        Ok(())
    }
}

/// A message as delivered by the in-memory broker
#[derive(Debug)]
pub struct InMemoryDelivery {
    message: Message,
    destination: Destination,
    delivery_count: u32,
    consumer_id: u64,
    tag: u64,
}

impl BrokerMessage for InMemoryDelivery {
    fn message(&self) -> &Message {
        &self.message
    }

    fn destination(&self) -> Option<&Destination> {
        Some(&self.destination)
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}
