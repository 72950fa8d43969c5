//! # MQ Relay
//!
//! Reliable client and listener layer over a message broker connection.
//!
//! This library provides:
//! - One shared broker connection per [`ConnectionManager`]
//! - Automatic reconnect with retry, backoff and failover across brokers
//! - Transactional listeners with poison message handling
//! - Request/reply over temporary reply queues
//! - Durable topic subscriptions
//! - An in-memory broker for tests and local development
//!
//! ## Module Organization
//!
//! - [`destination`] - Destination addresses and kinds
//! - [`message`] - Outgoing and received messages
//! - [`settings`] - Failover, listener and request/reply settings
//! - [`retry`] - Retry counter with backoff and failover host rotation
//! - [`transport`] - Broker transport traits
//! - [`connection`] - Shared connection and connection manager
//! - [`client`], [`queue_client`] - Send path and request/reply
//! - [`listener`], [`queue_listener`], [`topic_listener`] - Receive path
//! - [`providers`] - Transport implementations

pub mod client;
pub mod connection;
pub mod destination;
pub mod error;
pub mod listener;
pub mod message;
pub mod providers;
pub mod queue_client;
pub mod queue_listener;
pub mod reply;
pub mod retry;
pub mod settings;
pub mod topic_listener;
pub mod transport;

pub use client::{ClientBase, OneWayClient};
pub use connection::{ConnectionManager, ManagedResource, SharedConnection};
pub use destination::{Destination, DestinationKind, DestinationUri, ADVISORY_TOPIC};
pub use error::{ConfigurationError, MessagingError, TransportError, ValidationError};
pub use listener::{
    HandlerSubscription, Listener, ListenerBase, ListenerStatus, MessageHandler, RollbackOutcome,
};
pub use message::{Message, MessageId, ReceivedMessage, Timestamp};
pub use providers::InMemoryBroker;
pub use queue_client::QueueClient;
pub use queue_listener::QueueListener;
pub use reply::{PendingReplies, PendingReply};
pub use retry::RetryCounter;
pub use settings::{FailoverSettings, ListenerSettings, MessagingSettings, RequestReplySettings};
pub use topic_listener::TopicListener;
pub use transport::{
    AcknowledgementMode, BrokerConnection, BrokerConnector, BrokerMessage, BrokerSession,
    ConsumerOptions, ExceptionListener, MessageConsumer, MessageListener, MessageProducer,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
