//! # Connection Management
//!
//! A [`ConnectionManager`] owns one broker connection shared by every client
//! and listener it creates. Each child owns its own session and producer or
//! consumer; the connection itself lives in a [`SharedConnection`] carrying a
//! generation number.
//!
//! Replacing the connection bumps the generation. Children compare the
//! generation their session was opened under with the current one before
//! every use and re-establish their session lazily when it moved.
//!
//! Passive children such as listeners have no next use to trigger that, so
//! they register as [`ConnectionObserver`]s and are told whenever the shared
//! connection is closed or replaced underneath them.

use crate::client::{ClientBase, OneWayClient};
use crate::destination::{Destination, DestinationKind};
use crate::error::{ConfigurationError, MessagingError, TransportError};
use crate::listener::Listener;
use crate::queue_client::QueueClient;
use crate::queue_listener::QueueListener;
use crate::reply::PendingReplies;
use crate::settings::{FailoverSettings, MessagingSettings};
use crate::topic_listener::TopicListener;
use crate::transport::{BrokerConnection, BrokerConnector};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

// ============================================================================
// Shared Connection
// ============================================================================

/// Told when the shared connection it depends on was closed or replaced
#[async_trait]
pub(crate) trait ConnectionObserver: Send + Sync {
    /// Called on a spawned task after the generation moved.
    ///
    /// Implementations re-establish their session only when it is stale.
    async fn connection_replaced(&self);
}

/// Broker connection shared by all children of one [`ConnectionManager`]
pub struct SharedConnection {
    connector: Arc<dyn BrokerConnector>,
    current: AsyncMutex<Option<Arc<dyn BrokerConnection>>>,
    generation: AtomicU64,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
}

impl SharedConnection {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            current: AsyncMutex::new(None),
            generation: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a child to be told about connection replacements.
    ///
    /// Only a weak reference is kept; dropped observers are pruned.
    pub(crate) fn observe(&self, observer: Weak<dyn ConnectionObserver>) {
        let mut observers = self.lock_observers();
        observers.retain(|existing| existing.strong_count() > 0);
        observers.push(observer);
    }

    /// Number of live observers
    pub fn observer_count(&self) -> usize {
        self.lock_observers()
            .iter()
            .filter(|observer| observer.strong_count() > 0)
            .count()
    }

    fn notify_replaced(&self) {
        let live: Vec<Arc<dyn ConnectionObserver>> = {
            let mut observers = self.lock_observers();
            observers.retain(|observer| observer.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };

        debug!(
            observers = live.len(),
            generation = self.generation(),
            "Notifying observers of connection replacement"
        );
        for observer in live {
            tokio::spawn(async move {
                observer.connection_replaced().await;
            });
        }
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<Weak<dyn ConnectionObserver>>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generation of the current connection; bumped on every replacement
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether an open connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|connection| !connection.is_closed())
            .unwrap_or(false)
    }

    /// Return the open connection, connecting to `host` if there is none.
    ///
    /// An open connection is returned even when it points at another host.
    pub async fn connect(
        &self,
        host: &str,
    ) -> Result<(Arc<dyn BrokerConnection>, u64), TransportError> {
        let mut current = self.current.lock().await;

        if let Some(connection) = current.as_ref() {
            if !connection.is_closed() {
                return Ok((connection.clone(), self.generation()));
            }
        }

        let connection = self.connector.connect(host).await?;
        *current = Some(connection.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(host = %host, generation = generation, "Broker connection established");
        Ok((connection, generation))
    }

    /// Close the current connection if it is still the one opened under
    /// `observed`.
    ///
    /// A child that saw a fault calls this; when another child has already
    /// replaced the connection the call does nothing.
    pub async fn invalidate(&self, observed: u64) {
        let mut current = self.current.lock().await;
        if self.generation() != observed {
            return;
        }

        if let Some(connection) = current.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = connection.close().await {
                debug!(host = %connection.host(), error = %e, "Error closing stale connection");
            }
            self.notify_replaced();
        }
    }

    /// Replace the current connection with a fresh one to `host`.
    ///
    /// Observers are notified even when the new connection is refused, so
    /// they retry through their own failover settings.
    pub async fn reconnect(&self, host: &str) -> Result<u64, TransportError> {
        let mut current = self.current.lock().await;

        if let Some(connection) = current.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = connection.close().await {
                warn!(host = %connection.host(), error = %e, "Error closing connection before reconnect");
            }
        }

        let connection = match self.connector.connect(host).await {
            Ok(connection) => connection,
            Err(e) => {
                self.notify_replaced();
                return Err(e);
            }
        };
        *current = Some(connection);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(host = %host, generation = generation, "Broker connection replaced");
        self.notify_replaced();
        Ok(generation)
    }

    /// Close the current connection, if any
    pub async fn close(&self) {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = connection.close().await {
                warn!(host = %connection.host(), error = %e, "Error closing connection");
            }
        }
    }
}

/// A failed session attempt and the connection generation it was made under
#[derive(Debug)]
pub(crate) struct SessionFault {
    pub generation: u64,
    pub error: TransportError,
}

impl SessionFault {
    pub fn new(generation: u64, error: TransportError) -> Self {
        Self { generation, error }
    }
}

// ============================================================================
// Managed Resources
// ============================================================================

/// A client or listener disposed together with its manager
#[async_trait]
pub trait ManagedResource: Send + Sync {
    /// Short description for logs, e.g. `client Queue tcp://broker:61616/orders`
    fn describe(&self) -> String;

    /// Release broker resources. Must not fail.
    async fn dispose(&self);
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Factory for clients and listeners sharing one broker connection
///
/// # Examples
///
/// ```rust
/// use mq_relay::{ConnectionManager, Destination, InMemoryBroker, Message, MessagingSettings};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let manager =
///     ConnectionManager::new(Arc::new(broker.clone()), MessagingSettings::default()).unwrap();
///
/// let orders = Destination::queue("tcp://broker:61616/orders").unwrap();
/// let client = manager.create_client(&orders).unwrap();
/// client.send_one_way(Message::text("hello")).await.unwrap();
///
/// manager.dispose().await;
/// assert_eq!(broker.sent_to("tcp://broker:61616/orders").len(), 1);
/// # });
/// ```
pub struct ConnectionManager {
    connection: Arc<SharedConnection>,
    settings: MessagingSettings,
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
}

impl ConnectionManager {
    /// Create a manager over `connector`; fails when `settings` are invalid
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        settings: MessagingSettings,
    ) -> Result<Self, MessagingError> {
        settings.validate()?;

        Ok(Self {
            connection: Arc::new(SharedConnection::new(connector)),
            settings,
            resources: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    /// The shared connection handed to every child
    pub fn connection(&self) -> &Arc<SharedConnection> {
        &self.connection
    }

    /// Number of clients and listeners awaiting disposal
    pub fn registered_count(&self) -> usize {
        self.lock_resources().len()
    }

    /// Create a fire-and-forget client for a queue or topic
    pub fn create_client(&self, destination: &Destination) -> Result<OneWayClient, MessagingError> {
        validate_kind(destination)?;

        let base = ClientBase::new(
            destination.clone(),
            self.connection.clone(),
            self.failover_settings(),
            None,
        );
        self.register(base.resource());
        debug!(destination = %destination, "Created one-way client");
        Ok(OneWayClient::new(base))
    }

    /// Create a request/reply client for a queue or topic
    pub fn create_reply_client(&self, destination: &Destination) -> Result<QueueClient, MessagingError> {
        validate_kind(destination)?;

        let replies = Arc::new(PendingReplies::new(self.settings.request_reply.reply_retention));
        let base = ClientBase::new(
            destination.clone(),
            self.connection.clone(),
            self.failover_settings(),
            Some(replies),
        );
        self.register(base.resource());
        debug!(destination = %destination, "Created request/reply client");
        Ok(QueueClient::new(base))
    }

    /// Create a listener with a plain consumer on a queue or topic
    pub fn create_listener(&self, destination: &Destination) -> Result<Listener, MessagingError> {
        self.build_listener(destination, None)
    }

    /// Create a listener identified by `subscriber_id`.
    ///
    /// On a topic this is a durable subscription that keeps messages while
    /// the listener is disconnected; on a queue the subscriber id becomes the
    /// connection's client id.
    pub fn create_registered_listener(
        &self,
        destination: &Destination,
        subscriber_id: &str,
    ) -> Result<Listener, MessagingError> {
        if subscriber_id.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "subscriber id must not be empty".to_string(),
            }
            .into());
        }
        self.build_listener(destination, Some(subscriber_id))
    }

    fn build_listener(
        &self,
        destination: &Destination,
        subscriber_id: Option<&str>,
    ) -> Result<Listener, MessagingError> {
        validate_kind(destination)?;

        let mut settings = self.settings.listener.clone();
        let listener = match destination.kind() {
            DestinationKind::Topic => Listener::Topic(TopicListener::new(
                destination.clone(),
                self.connection.clone(),
                self.failover_settings(),
                settings,
                subscriber_id.map(str::to_string),
            )),
            _ => {
                if let Some(subscriber_id) = subscriber_id {
                    settings.connection_id = Some(subscriber_id.to_string());
                }
                Listener::Queue(QueueListener::new(
                    destination.clone(),
                    self.connection.clone(),
                    self.failover_settings(),
                    settings,
                ))
            }
        };

        self.register(listener.resource());
        debug!(
            destination = %destination,
            subscriber_id = ?subscriber_id,
            "Created listener"
        );
        Ok(listener)
    }

    /// Replace the shared connection with a fresh one to `host`.
    ///
    /// Clients re-establish their session on next use; listeners are
    /// notified and re-register their consumers in the background.
    pub async fn reconnect(&self, host: &str) -> Result<(), MessagingError> {
        self.connection.reconnect(host).await?;
        Ok(())
    }

    /// Dispose every registered child, then the shared connection.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        let resources: Vec<Arc<dyn ManagedResource>> = self.lock_resources().drain(..).collect();

        for resource in resources {
            debug!(resource = %resource.describe(), "Disposing");
            resource.dispose().await;
        }

        self.connection.close().await;
    }

    fn failover_settings(&self) -> Arc<FailoverSettings> {
        Arc::new(self.settings.failover.clone().unwrap_or_default())
    }

    fn register(&self, resource: Arc<dyn ManagedResource>) {
        self.lock_resources().push(resource);
    }

    fn lock_resources(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn ManagedResource>>> {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_kind(destination: &Destination) -> Result<(), ConfigurationError> {
    match destination.kind() {
        DestinationKind::Queue | DestinationKind::Topic => Ok(()),
        kind => Err(ConfigurationError::UnsupportedDestination {
            kind: kind.to_string(),
        }),
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
