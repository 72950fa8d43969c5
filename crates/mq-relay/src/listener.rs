//! # Listener Base
//!
//! Receive path shared by [`QueueListener`] and [`TopicListener`].
//!
//! A listener owns one session and consumer on the manager's shared
//! connection. Each delivery is handed to the registered [`MessageHandler`]
//! inside a commit/rollback boundary:
//!
//! - handler succeeds: the session is committed
//! - handler fails: the session is rolled back and the broker redelivers
//! - delivery count above the configured maximum: the message is forwarded to
//!   the dead letter queue and committed, or logged and handed back to the
//!   broker's own redelivery policy when no dead letter queue is configured
//!
//! Commit and rollback only act on transactional sessions.

use crate::connection::{ConnectionObserver, ManagedResource, SessionFault, SharedConnection};
use crate::destination::{Destination, DestinationKind, DestinationUri, ADVISORY_TOPIC};
use crate::error::{ConfigurationError, MessagingError, TransportError};
use crate::message::{Message, ReceivedMessage};
use crate::queue_listener::QueueListener;
use crate::retry::RetryCounter;
use crate::settings::{FailoverSettings, ListenerSettings};
use crate::topic_listener::TopicListener;
use crate::transport::{
    AcknowledgementMode, BrokerConnection, BrokerMessage, BrokerSession, ConsumerOptions,
    ExceptionListener, ExceptionListenerId, MessageConsumer, MessageListener,
    MATCH_ALL_SELECTOR,
};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Writer;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;

// ============================================================================
// Handlers
// ============================================================================

/// Application callback for received messages
///
/// Returning an error rolls the message back so the broker redelivers it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&ReceivedMessage) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        self(message)
    }
}

#[derive(Default)]
struct HandlerSlot {
    current: Mutex<Option<(u64, Arc<dyn MessageHandler>)>>,
    next_id: AtomicU64,
}

impl HandlerSlot {
    fn lock(&self) -> MutexGuard<'_, Option<(u64, Arc<dyn MessageHandler>)>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Option<Arc<dyn MessageHandler>> {
        self.lock().as_ref().map(|(_, handler)| handler.clone())
    }
}

/// Registration of a listener's message handler
///
/// A later registration replaces this one.
#[derive(Debug)]
pub struct HandlerSubscription {
    slot: Weak<HandlerSlot>,
    id: u64,
}

impl HandlerSubscription {
    /// Whether this handler is still the one receiving messages
    pub fn is_active(&self) -> bool {
        self.slot
            .upgrade()
            .map(|slot| matches!(slot.lock().as_ref(), Some((id, _)) if *id == self.id))
            .unwrap_or(false)
    }

    /// Remove the handler unless it was already replaced
    pub fn unsubscribe(self) {
        if let Some(slot) = self.slot.upgrade() {
            let mut current = slot.lock();
            if matches!(current.as_ref(), Some((id, _)) if *id == self.id) {
                *current = None;
            }
        }
    }
}

// ============================================================================
// Outcomes and Status
// ============================================================================

/// What [`ListenerBase::rollback`] did with the last received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The session is not transactional; nothing was done
    NotTransactional,
    /// The session was rolled back and the broker will redeliver
    RolledBack,
    /// Poison message forwarded to the dead letter queue and committed
    DeadLettered { dead_letter_queue: String },
    /// Poison message logged and rolled back for the broker's own policy
    DeferredToBroker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Disconnected,
    Connected,
    ConsumerRegistered,
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsumerBinding {
    Plain { destination: Destination },
    Durable { topic: Destination, subscriber_id: String },
}

impl ConsumerBinding {
    fn destination(&self) -> &Destination {
        match self {
            Self::Plain { destination } => destination,
            Self::Durable { topic, .. } => topic,
        }
    }
}

struct ListenerSession {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    exception_listener: ExceptionListenerId,
    session: Arc<dyn BrokerSession>,
    consumer: Option<Box<dyn MessageConsumer>>,
}

impl ListenerSession {
    fn is_current(&self, shared: &SharedConnection) -> bool {
        self.generation == shared.generation() && !self.connection.is_closed()
    }
}

/// Arrival callback wired to a consumer; holds the session it was created on
struct Dispatcher {
    core: Weak<ListenerCore>,
    session: Arc<dyn BrokerSession>,
    host: String,
}

#[async_trait]
impl MessageListener for Dispatcher {
    async fn on_message(&self, message: Arc<dyn BrokerMessage>) -> anyhow::Result<()> {
        match self.core.upgrade() {
            Some(core) => core.dispatch(message, &self.session, &self.host).await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// Listener Core
// ============================================================================

pub(crate) struct ListenerCore {
    destination: RwLock<Destination>,
    connection: Arc<SharedConnection>,
    settings: ListenerSettings,
    client_id: Option<String>,
    retry: RetryCounter,
    binding: Mutex<Option<ConsumerBinding>>,
    state: AsyncMutex<Option<ListenerSession>>,
    handler: Arc<HandlerSlot>,
    last_message: Mutex<Option<Arc<dyn BrokerMessage>>>,
    self_ref: Weak<ListenerCore>,
}

impl ListenerCore {
    fn destination(&self) -> Destination {
        self.destination
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_host(&self, host: &str) {
        let mut destination = self
            .destination
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *destination = destination.with_host(host);
    }

    fn binding(&self) -> Option<ConsumerBinding> {
        self.binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_binding(&self, binding: Option<ConsumerBinding>) {
        *self
            .binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = binding;
    }

    fn is_transactional(&self) -> bool {
        self.settings.acknowledgement_mode.is_transactional()
    }

    /// Single attempt at opening a session, re-binding the consumer if one
    /// was registered before
    async fn open_session(&self) -> Result<ListenerSession, SessionFault> {
        let destination = self.destination();
        let (connection, generation) = self
            .connection
            .connect(destination.host())
            .await
            .map_err(|e| SessionFault::new(self.connection.generation(), e))?;

        if connection.host() != destination.host() {
            self.set_host(connection.host());
        }

        if let Some(client_id) = &self.client_id {
            if connection.client_id().as_deref() != Some(client_id.as_str()) {
                connection
                    .set_client_id(client_id)
                    .map_err(|e| SessionFault::new(generation, e))?;
                debug!(client_id = %client_id, "Applied client id to connection");
            }
        }

        let listener: Weak<dyn ExceptionListener> = self.self_ref.clone();
        let exception_listener = connection.add_exception_listener(listener);

        let session = match connection
            .create_session(self.settings.acknowledgement_mode)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                connection.remove_exception_listener(exception_listener);
                return Err(SessionFault::new(generation, e));
            }
        };

        let mut session = ListenerSession {
            generation,
            connection,
            exception_listener,
            session: Arc::from(session),
            consumer: None,
        };

        if let Some(binding) = self.binding() {
            if let Err(e) = self.attach_consumer(&mut session, &binding).await {
                self.teardown(session).await;
                return Err(SessionFault::new(generation, e));
            }
        }

        Ok(session)
    }

    /// Create the consumer for `binding`, wire the dispatcher and start delivery
    async fn attach_consumer(
        &self,
        session: &mut ListenerSession,
        binding: &ConsumerBinding,
    ) -> Result<(), TransportError> {
        let host = session.connection.host().to_string();
        let destination = binding.destination().with_host(host.as_str());
        let max_redelivery_count = Some(self.settings.maximum_redelivery_count);

        let consumer = match binding {
            ConsumerBinding::Plain { .. } => {
                debug!(destination = %destination, "Registering listener");
                session
                    .session
                    .create_consumer(
                        &destination,
                        ConsumerOptions {
                            selector: None,
                            no_local: false,
                            max_redelivery_count,
                        },
                    )
                    .await?
            }
            ConsumerBinding::Durable { subscriber_id, .. } => {
                debug!(
                    destination = %destination,
                    subscriber_id = %subscriber_id,
                    "Registering durable subscriber"
                );
                session
                    .session
                    .create_durable_consumer(
                        &destination,
                        subscriber_id,
                        ConsumerOptions {
                            selector: Some(MATCH_ALL_SELECTOR.to_string()),
                            no_local: false,
                            max_redelivery_count,
                        },
                    )
                    .await?
            }
        };

        consumer.set_listener(Arc::new(Dispatcher {
            core: self.self_ref.clone(),
            session: session.session.clone(),
            host,
        }));

        if let Err(e) = session.connection.start().await {
            if let Err(close_error) = consumer.close().await {
                debug!(error = %close_error, "Error closing consumer");
            }
            return Err(e);
        }

        if let Some(previous) = session.consumer.replace(consumer) {
            if let Err(e) = previous.close().await {
                debug!(error = %e, "Error closing replaced consumer");
            }
        }
        info!(destination = %destination, "Listener started listening");
        Ok(())
    }

    /// Release the handles of a session; failures are logged and ignored
    async fn teardown(&self, session: ListenerSession) {
        let ListenerSession {
            connection,
            exception_listener,
            session,
            consumer,
            ..
        } = session;

        connection.remove_exception_listener(exception_listener);

        if let Some(consumer) = consumer {
            if let Err(e) = consumer.close().await {
                debug!(error = %e, "Error closing consumer");
            }
        }
        if let Err(e) = session.close().await {
            debug!(error = %e, "Error closing session");
        }
    }

    async fn fail_over(&self, observed_generation: u64) {
        if let Some(host) = self.retry.next_failover_host() {
            let host = host.to_string();
            info!(
                destination = %self.destination(),
                failover_host = %host,
                "Failing over to next broker"
            );
            self.set_host(&host);
        }
        self.connection.invalidate(observed_generation).await;
    }

    async fn connect_locked(&self, state: &mut Option<ListenerSession>) -> Result<(), MessagingError> {
        self.retry.reset();
        loop {
            match self.open_session().await {
                Ok(session) => {
                    *state = Some(session);
                    debug!(destination = %self.destination(), "Listener connected");
                    return Ok(());
                }
                Err(fault) => {
                    warn!(
                        destination = %self.destination(),
                        attempt = self.retry.attempts() + 1,
                        error = %fault.error,
                        "Error trying to create connection"
                    );
                    self.fail_over(fault.generation).await;

                    if !self.retry.retry().await {
                        let attempts = self.retry.attempts();
                        error!(
                            destination = %self.destination(),
                            attempts = attempts,
                            error = %fault.error,
                            "Error trying to create connection, giving up"
                        );
                        return Err(MessagingError::ConnectFailed {
                            destination: self.destination().uri().to_string(),
                            attempts,
                            source: fault.error,
                        });
                    }
                }
            }
        }
    }

    async fn ensure_connected(
        &self,
        state: &mut Option<ListenerSession>,
    ) -> Result<(), MessagingError> {
        match state.take() {
            Some(session) if session.is_current(&self.connection) => {
                *state = Some(session);
                Ok(())
            }
            Some(stale) => {
                debug!(destination = %self.destination(), "Connection changed, re-establishing session");
                self.teardown(stale).await;
                self.connect_locked(state).await
            }
            None => self.connect_locked(state).await,
        }
    }

    async fn register(&self, binding: ConsumerBinding) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;
        self.set_binding(Some(binding.clone()));

        let attached = match state.as_mut() {
            Some(session) => self
                .attach_consumer(session, &binding)
                .await
                .map_err(|e| SessionFault::new(session.generation, e)),
            None => Err(SessionFault::new(
                self.connection.generation(),
                TransportError::SessionClosed,
            )),
        };

        if let Err(fault) = attached {
            warn!(
                destination = %self.destination(),
                error = %fault.error,
                "Error registering consumer, reconnecting"
            );
            if let Some(session) = state.take() {
                self.teardown(session).await;
            }
            self.fail_over(fault.generation).await;
            // Reconnecting re-binds the consumer registered above
            self.connect_locked(&mut state).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn dispatch(
        &self,
        message: Arc<dyn BrokerMessage>,
        session: &Arc<dyn BrokerSession>,
        host: &str,
    ) -> anyhow::Result<()> {
        *self
            .last_message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.clone());

        let received = ReceivedMessage::from_broker(message.as_ref(), host);
        debug!(
            destination = %self.destination(),
            message_id = %received.message_id,
            correlation_id = ?received.correlation_id,
            delivery_count = received.delivery_count,
            "Received message"
        );

        let result = match self.handler.current() {
            Some(handler) => handler.handle(&received).await,
            None => {
                debug!("Message was received but no handler is registered");
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                self.commit_session(session.as_ref()).await?;
                Ok(())
            }
            Err(e) => {
                error!(
                    destination = %self.destination(),
                    message_id = %received.message_id,
                    error = %e,
                    "Error handling message, rolling back"
                );
                match self
                    .rollback_session(session.as_ref(), message.as_ref(), host)
                    .await
                {
                    Ok(outcome) => debug!(outcome = ?outcome, "Rollback complete"),
                    Err(rollback_error) => warn!(
                        destination = %self.destination(),
                        error = %rollback_error,
                        "Error rolling back message"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn commit_session(&self, session: &dyn BrokerSession) -> Result<(), MessagingError> {
        if !self.is_transactional() {
            return Ok(());
        }
        session.commit().await?;
        Ok(())
    }

    async fn rollback_session(
        &self,
        session: &dyn BrokerSession,
        message: &dyn BrokerMessage,
        host: &str,
    ) -> Result<RollbackOutcome, MessagingError> {
        if !self.is_transactional() {
            return Ok(RollbackOutcome::NotTransactional);
        }

        let delivery_count = message.delivery_count();
        if delivery_count <= self.settings.maximum_redelivery_count {
            session.rollback().await?;
            return Ok(RollbackOutcome::RolledBack);
        }

        let original = message.message();
        match &self.settings.dead_letter_queue {
            Some(dead_letter_queue) => {
                warn!(
                    destination = %self.destination(),
                    dead_letter_queue = %dead_letter_queue,
                    delivery_count = delivery_count,
                    "Poison message found, sending to dead letter queue"
                );
                let target = Destination::new(
                    DestinationKind::Queue,
                    DestinationUri::new(host, dead_letter_queue.as_str())?,
                );
                let producer = session.create_producer(&target).await?;
                let sent = producer.send(original).await;
                if let Err(e) = producer.close().await {
                    debug!(error = %e, "Error closing dead letter producer");
                }
                sent?;
                session.commit().await?;
                Ok(RollbackOutcome::DeadLettered {
                    dead_letter_queue: dead_letter_queue.clone(),
                })
            }
            None => {
                error!(
                    destination = %self.destination(),
                    delivery_count = delivery_count,
                    message_id = %original.message_id,
                    correlation_id = ?original.correlation_id,
                    properties = ?original.properties,
                    body = %String::from_utf8_lossy(&original.body),
                    "Poison message found, no dead letter queue configured"
                );
                session.rollback().await?;
                Ok(RollbackOutcome::DeferredToBroker)
            }
        }
    }

    async fn current_session(&self) -> Result<(Arc<dyn BrokerSession>, String), MessagingError> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|session| (session.session.clone(), session.connection.host().to_string()))
            .ok_or_else(|| TransportError::SessionClosed.into())
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    async fn publish_advisory(&self, state: &Option<ListenerSession>) -> Result<(), SessionFault> {
        let Some(session) = state.as_ref().filter(|s| s.is_current(&self.connection)) else {
            return Err(SessionFault::new(
                self.connection.generation(),
                TransportError::ConnectionClosed,
            ));
        };
        let generation = session.generation;
        let fault = |e| SessionFault::new(generation, e);

        let host = session.connection.host().to_string();
        let uri = DestinationUri::new(host.as_str(), ADVISORY_TOPIC).map_err(|e| {
            fault(TransportError::Broker {
                code: "Advisory".to_string(),
                message: e.to_string(),
            })
        })?;
        let topic = Destination::new(DestinationKind::Topic, uri);

        let advisory_session = session
            .connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .map_err(fault)?;
        let sent = async {
            let body = advisory_body(&self.destination()).map_err(|e| TransportError::Broker {
                code: "Advisory".to_string(),
                message: e.to_string(),
            })?;
            let producer = advisory_session.create_producer(&topic).await?;
            let sent = producer.send(&Message::text(body)).await;
            if let Err(e) = producer.close().await {
                debug!(error = %e, "Error closing advisory producer");
            }
            sent
        }
        .await;
        if let Err(e) = advisory_session.close().await {
            debug!(error = %e, "Error closing advisory session");
        }

        sent.map_err(fault)
    }

    async fn assert_connected(&self) -> bool {
        let mut state = self.state.lock().await;
        match self.publish_advisory(&state).await {
            Ok(()) => true,
            Err(fault) => {
                warn!(
                    destination = %self.destination(),
                    error = %fault.error,
                    "Connection assertion failed, reconnecting"
                );
                if let Some(session) = state.take() {
                    self.teardown(session).await;
                }
                self.fail_over(fault.generation).await;
                if let Err(e) = self.connect_locked(&mut state).await {
                    error!(destination = %self.destination(), error = %e, "Reconnect failed");
                }
                false
            }
        }
    }

    async fn status(&self) -> ListenerStatus {
        match self.state.lock().await.as_ref() {
            Some(session) if session.is_current(&self.connection) => {
                if session.consumer.is_some() {
                    ListenerStatus::ConsumerRegistered
                } else {
                    ListenerStatus::Connected
                }
            }
            _ => ListenerStatus::Disconnected,
        }
    }

    async fn dispose(&self) {
        let mut state = self.state.lock().await;
        self.set_binding(None);
        if let Some(session) = state.take() {
            self.teardown(session).await;
            debug!(destination = %self.destination(), "Listener disposed");
        }
        *self
            .last_message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[async_trait]
impl ExceptionListener for ListenerCore {
    async fn on_exception(&self, error: TransportError) {
        let mut state = self.state.lock().await;
        let session = match state.take() {
            // Already re-established on a newer connection
            Some(session) if session.is_current(&self.connection) => {
                *state = Some(session);
                return;
            }
            Some(session) => session,
            None => return,
        };

        warn!(
            destination = %self.destination(),
            error = %error,
            "Connection exception, reconnecting"
        );
        let generation = session.generation;
        self.teardown(session).await;
        self.fail_over(generation).await;

        if let Err(e) = self.connect_locked(&mut state).await {
            error!(
                destination = %self.destination(),
                error = %e,
                "Reconnect after connection exception failed"
            );
        }
    }
}

#[async_trait]
impl ConnectionObserver for ListenerCore {
    async fn connection_replaced(&self) {
        let mut state = self.state.lock().await;
        let stale = match state.take() {
            Some(session) if session.is_current(&self.connection) => {
                *state = Some(session);
                return;
            }
            Some(session) => session,
            None => return,
        };

        info!(
            destination = %self.destination(),
            generation = self.connection.generation(),
            "Shared connection replaced, re-establishing listener"
        );
        self.teardown(stale).await;

        if let Err(e) = self.connect_locked(&mut state).await {
            error!(
                destination = %self.destination(),
                error = %e,
                "Re-establishing listener after connection replacement failed"
            );
        }
    }
}

#[async_trait]
impl ManagedResource for ListenerCore {
    fn describe(&self) -> String {
        format!("listener {}", self.destination())
    }

    async fn dispose(&self) {
        ListenerCore::dispose(self).await;
    }
}

/// XML advisory announcing that this process listens on `destination`
fn advisory_body(destination: &Destination) -> Result<String, quick_xml::Error> {
    let process_name = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string());
    let host_name = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let uri = destination.uri().to_string();
    let time = chrono::Utc::now().to_rfc3339();

    let mut element = BytesStart::new("ServiceHostAdvisory");
    element.push_attribute(("DestinationUri", uri.as_str()));
    element.push_attribute(("ProcessName", process_name.as_str()));
    element.push_attribute(("HostName", host_name.as_str()));
    element.push_attribute(("Time", time.as_str()));

    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Empty(element))?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

// ============================================================================
// Public Listener
// ============================================================================

/// Receive side of a destination with reconnect, retry and failover
#[derive(Clone)]
pub struct ListenerBase {
    core: Arc<ListenerCore>,
}

impl ListenerBase {
    pub(crate) fn new(
        destination: Destination,
        connection: Arc<SharedConnection>,
        failover: Arc<FailoverSettings>,
        settings: ListenerSettings,
        client_id: Option<String>,
    ) -> Self {
        let core = Arc::new_cyclic(|self_ref| ListenerCore {
            destination: RwLock::new(destination),
            connection,
            settings,
            client_id,
            retry: RetryCounter::new(failover),
            binding: Mutex::new(None),
            state: AsyncMutex::new(None),
            handler: Arc::new(HandlerSlot::default()),
            last_message: Mutex::new(None),
            self_ref: self_ref.clone(),
        });
        let observer: Weak<dyn ConnectionObserver> = Arc::<ListenerCore>::downgrade(&core);
        core.connection.observe(observer);
        Self { core }
    }

    pub(crate) fn resource(&self) -> Arc<dyn ManagedResource> {
        self.core.clone()
    }

    /// Open a session on the shared connection, retrying with failover.
    ///
    /// Applies the listener's client id to the connection.
    #[instrument(skip_all, fields(destination = %self.destination()))]
    pub async fn connect(&self) -> Result<(), MessagingError> {
        let mut state = self.core.state.lock().await;
        self.core.ensure_connected(&mut state).await
    }

    /// Consume from `destination` and start delivery to the handler.
    ///
    /// The consumer is re-created on every reconnect.
    #[instrument(skip_all, fields(destination = %destination))]
    pub async fn register_consumer(&self, destination: &Destination) -> Result<(), MessagingError> {
        self.core
            .register(ConsumerBinding::Plain {
                destination: destination.clone(),
            })
            .await
    }

    /// Consume from a durable subscription on `topic` and start delivery
    #[instrument(skip_all, fields(destination = %topic, subscriber_id = %subscriber_id))]
    pub async fn register_durable_consumer(
        &self,
        topic: &Destination,
        subscriber_id: &str,
    ) -> Result<(), MessagingError> {
        if topic.kind() != DestinationKind::Topic {
            return Err(ConfigurationError::UnsupportedDestination {
                kind: topic.kind().to_string(),
            }
            .into());
        }
        self.core
            .register(ConsumerBinding::Durable {
                topic: topic.clone(),
                subscriber_id: subscriber_id.to_string(),
            })
            .await
    }

    /// Register the handler for received messages, replacing any previous one
    pub fn set_handler<H>(&self, handler: H) -> HandlerSubscription
    where
        H: MessageHandler + 'static,
    {
        let slot = &self.core.handler;
        let id = slot.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        *slot.lock() = Some((id, handler));

        HandlerSubscription {
            slot: Arc::downgrade(slot),
            id,
        }
    }

    /// Commit the current transaction; a no-op unless transactional
    pub async fn commit(&self) -> Result<(), MessagingError> {
        if !self.core.is_transactional() {
            return Ok(());
        }
        let (session, _) = self.core.current_session().await?;
        self.core.commit_session(session.as_ref()).await
    }

    /// Roll back the last received message, dead-lettering it once it has
    /// been delivered more often than allowed
    pub async fn rollback(&self) -> Result<RollbackOutcome, MessagingError> {
        if !self.core.is_transactional() {
            return Ok(RollbackOutcome::NotTransactional);
        }
        let (session, host) = self.core.current_session().await?;
        let last_message = self
            .core
            .last_message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        match last_message {
            Some(message) => {
                self.core
                    .rollback_session(session.as_ref(), message.as_ref(), &host)
                    .await
            }
            None => {
                session.rollback().await?;
                Ok(RollbackOutcome::RolledBack)
            }
        }
    }

    /// Publish a liveness advisory; reconnects and returns `false` when the
    /// connection turns out to be dead
    #[instrument(skip_all, fields(destination = %self.destination()))]
    pub async fn assert_connected(&self) -> bool {
        self.core.assert_connected().await
    }

    pub async fn status(&self) -> ListenerStatus {
        self.core.status().await
    }

    /// Current destination; its host follows failover
    pub fn destination(&self) -> Destination {
        self.core.destination()
    }

    pub fn failover_settings(&self) -> &FailoverSettings {
        self.core.retry.settings()
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.core.settings
    }

    /// Client id applied to the shared connection, if any
    pub fn client_id(&self) -> Option<&str> {
        self.core.client_id.as_deref()
    }

    pub fn retry_counter(&self) -> &RetryCounter {
        &self.core.retry
    }

    /// Release the consumer and session. Never fails; safe to repeat.
    pub async fn dispose(&self) {
        self.core.dispose().await;
    }
}

impl std::fmt::Debug for ListenerBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBase")
            .field("destination", &self.destination())
            .field("client_id", &self.core.client_id)
            .finish_non_exhaustive()
    }
}

/// Listener returned by [`crate::ConnectionManager`]
#[derive(Debug, Clone)]
pub enum Listener {
    Queue(QueueListener),
    Topic(TopicListener),
}

impl Listener {
    /// Connect and register the consumer for the listener's destination
    pub async fn start(&self) -> Result<(), MessagingError> {
        match self {
            Self::Queue(listener) => listener.start().await,
            Self::Topic(listener) => listener.start().await,
        }
    }

    pub(crate) fn resource(&self) -> Arc<dyn ManagedResource> {
        self.deref().resource()
    }
}

impl Deref for Listener {
    type Target = ListenerBase;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Queue(listener) => &**listener,
            Self::Topic(listener) => &**listener,
        }
    }
}
