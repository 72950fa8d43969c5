//! Broker transport capabilities.
//!
//! The wire protocol is owned by an underlying broker client library. These
//! traits describe what the relay needs from it: connections, sessions,
//! producers, consumers, transactions, durable subscriptions and an
//! asynchronous exception channel. [`crate::providers::InMemoryBroker`]
//! implements all of them.

use crate::destination::Destination;
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::{Arc, Weak};

/// Match-all selector used for durable subscriptions
pub const MATCH_ALL_SELECTOR: &str = "2 > 1";

/// How received messages are acknowledged to the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcknowledgementMode {
    AutoAcknowledge,
    ClientAcknowledge,
    /// Receipts and sends are committed or rolled back as a unit
    #[default]
    Transactional,
}

impl AcknowledgementMode {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transactional)
    }
}

/// Consumer registration parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Message selector; `None` receives everything
    pub selector: Option<String>,
    /// Skip messages published on the consumer's own connection
    pub no_local: bool,
    /// Redeliveries the broker attempts before applying its own poison policy
    pub max_redelivery_count: Option<u32>,
}

/// Identifies an exception listener registered on a connection
pub type ExceptionListenerId = u64;

/// Opens connections to a broker host
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to the broker at `host`, e.g. `tcp://broker:61616`
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// An open connection to one broker host, shared by many sessions
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Host this connection was opened to
    fn host(&self) -> &str;

    fn is_closed(&self) -> bool;

    fn client_id(&self) -> Option<String>;

    /// Set the stable client id durable subscriptions are tied to
    fn set_client_id(&self, client_id: &str) -> Result<(), TransportError>;

    /// Register a callback for asynchronous connection faults.
    ///
    /// The connection holds the listener weakly.
    fn add_exception_listener(&self, listener: Weak<dyn ExceptionListener>) -> ExceptionListenerId;

    fn remove_exception_listener(&self, id: ExceptionListenerId);

    async fn create_session(
        &self,
        mode: AcknowledgementMode,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;

    /// Start delivering messages to consumers
    async fn start(&self) -> Result<(), TransportError>;

    /// Close the connection and every session created from it
    async fn close(&self) -> Result<(), TransportError>;
}

/// A single-threaded unit of work on a connection
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn acknowledgement_mode(&self) -> AcknowledgementMode;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, TransportError>;

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, TransportError>;

    /// Create a consumer on a durable topic subscription identified by the
    /// connection's client id and `subscriber_id`
    async fn create_durable_consumer(
        &self,
        topic: &Destination,
        subscriber_id: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, TransportError>;

    /// Create a queue that lives as long as this session's connection
    async fn create_temporary_queue(&self) -> Result<Destination, TransportError>;

    async fn commit(&self) -> Result<(), TransportError>;

    async fn rollback(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Install the arrival callback; deliveries flow once the connection is started
    fn set_listener(&self, listener: Arc<dyn MessageListener>);

    async fn close(&self) -> Result<(), TransportError>;
}

/// Capabilities of a message as delivered by a concrete transport
pub trait BrokerMessage: Send + Sync + Debug {
    fn message(&self) -> &Message;

    /// Destination the message was delivered from
    fn destination(&self) -> Option<&Destination>;

    /// Number of times the broker has delivered this message, starting at 1
    fn delivery_count(&self) -> u32;
}

/// Arrival callback invoked by the transport, one message at a time per consumer
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// An error tells the transport processing failed
    async fn on_message(&self, message: Arc<dyn BrokerMessage>) -> anyhow::Result<()>;
}

/// Callback for faults detected on a connection outside any explicit call
#[async_trait]
pub trait ExceptionListener: Send + Sync {
    async fn on_exception(&self, error: TransportError);
}
