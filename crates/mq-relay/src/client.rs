//! # Client Base
//!
//! Send path shared by [`OneWayClient`] and [`crate::QueueClient`].
//!
//! A client owns one session and producer on the manager's shared
//! connection. Every "ensure connected, then use the session" sequence runs
//! under the client's own async mutex, so it cannot interleave with a
//! reconnect started by a connection exception.
//!
//! Failed attempts rotate the client's destination host through the
//! configured failover brokers and are retried with backoff; exhausting the
//! retry budget raises [`MessagingError::ConnectFailed`] or
//! [`MessagingError::SendFailed`].

use crate::connection::{ManagedResource, SessionFault, SharedConnection};
use crate::destination::Destination;
use crate::error::{MessagingError, TransportError};
use crate::message::{Message, ReceivedMessage};
use crate::reply::PendingReplies;
use crate::retry::RetryCounter;
use crate::settings::FailoverSettings;
use crate::transport::{
    AcknowledgementMode, BrokerConnection, BrokerMessage, BrokerSession, ConsumerOptions,
    ExceptionListener, ExceptionListenerId, MessageConsumer, MessageListener, MessageProducer,
};
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

// ============================================================================
// Session State
// ============================================================================

/// Temporary queue and consumer receiving replies for a request/reply client
pub(crate) struct ReplyChannel {
    destination: Destination,
    consumer: Box<dyn MessageConsumer>,
}

/// Broker handles owned by one client, replaced as a unit on reconnect
pub(crate) struct ClientSession {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    exception_listener: ExceptionListenerId,
    session: Box<dyn BrokerSession>,
    producer: Box<dyn MessageProducer>,
    reply_channel: Option<ReplyChannel>,
}

impl ClientSession {
    fn is_current(&self, shared: &SharedConnection) -> bool {
        self.generation == shared.generation() && !self.connection.is_closed()
    }
}

/// Where a request's reply should be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyTo {
    /// Leave the message's reply-to as the caller set it
    Keep,
    /// Point the reply-to at the client's temporary reply queue
    Shared,
}

/// Routes every inbound reply into the pending-reply table
struct ReplyRouter {
    replies: Arc<PendingReplies>,
    host: String,
}

#[async_trait]
impl MessageListener for ReplyRouter {
    async fn on_message(&self, message: Arc<dyn BrokerMessage>) -> anyhow::Result<()> {
        let reply = ReceivedMessage::from_broker(message.as_ref(), &self.host);
        debug!(
            correlation_id = ?reply.correlation_id,
            message_id = %reply.message_id,
            "Reply received"
        );
        self.replies.deliver(reply);
        Ok(())
    }
}

// ============================================================================
// Client Core
// ============================================================================

pub(crate) struct ClientCore {
    destination: RwLock<Destination>,
    connection: Arc<SharedConnection>,
    retry: RetryCounter,
    state: AsyncMutex<Option<ClientSession>>,
    replies: Option<Arc<PendingReplies>>,
    self_ref: Weak<ClientCore>,
}

impl ClientCore {
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

    pub(crate) fn replies(&self) -> Option<&Arc<PendingReplies>> {
        self.replies.as_ref()
    }

    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, Option<ClientSession>> {
        self.state.lock().await
    }

    /// Single attempt at opening a session, producer and reply channel
    async fn open_session(&self) -> Result<ClientSession, SessionFault> {
        let destination = self.destination();
        let (connection, generation) = self
            .connection
            .connect(destination.host())
            .await
            .map_err(|e| SessionFault::new(self.connection.generation(), e))?;

        if connection.host() != destination.host() {
            self.set_host(connection.host());
        }
        let destination = destination.with_host(connection.host());

        let listener: Weak<dyn ExceptionListener> = self.self_ref.clone();
        let exception_listener = connection.add_exception_listener(listener);

        match self.create_handles(&connection, &destination).await {
            Ok((session, producer, reply_channel)) => Ok(ClientSession {
                generation,
                connection,
                exception_listener,
                session,
                producer,
                reply_channel,
            }),
            Err(e) => {
                connection.remove_exception_listener(exception_listener);
                Err(SessionFault::new(generation, e))
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn create_handles(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        destination: &Destination,
    ) -> Result<
        (
            Box<dyn BrokerSession>,
            Box<dyn MessageProducer>,
            Option<ReplyChannel>,
        ),
        TransportError,
    > {
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await?;

        let handles = async {
            let producer = session.create_producer(destination).await?;
            let reply_channel = match &self.replies {
                Some(replies) => {
                    let reply_destination = session.create_temporary_queue().await?;
                    let consumer = session
                        .create_consumer(&reply_destination, ConsumerOptions::default())
                        .await?;
                    consumer.set_listener(Arc::new(ReplyRouter {
                        replies: replies.clone(),
                        host: connection.host().to_string(),
                    }));
                    connection.start().await?;
                    debug!(reply_to = %reply_destination, "Reply channel ready");
                    Some(ReplyChannel {
                        destination: reply_destination,
                        consumer,
                    })
                }
                None => None,
            };
            Ok::<_, TransportError>((producer, reply_channel))
        }
        .await;

        match handles {
            Ok((producer, reply_channel)) => Ok((session, producer, reply_channel)),
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    debug!(error = %close_error, "Error closing half-open session");
                }
                Err(e)
            }
        }
    }

    /// Release the handles of a session; failures are logged and ignored
    async fn teardown(&self, session: ClientSession) {
        let ClientSession {
            connection,
            exception_listener,
            session,
            producer,
            reply_channel,
            ..
        } = session;

        connection.remove_exception_listener(exception_listener);

        if let Err(e) = producer.close().await {
            debug!(error = %e, "Error closing producer");
        }
        if let Some(reply_channel) = reply_channel {
            if let Err(e) = reply_channel.consumer.close().await {
                debug!(error = %e, "Error closing reply consumer");
            }
        }
        if let Err(e) = session.close().await {
            debug!(error = %e, "Error closing session");
        }
    }

    /// Move to the next failover host and drop the connection that failed
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

    /// Open a session, retrying with failover until the budget is spent
    async fn connect_locked(&self, state: &mut Option<ClientSession>) -> Result<(), MessagingError> {
        self.retry.reset();
        loop {
            match self.open_session().await {
                Ok(session) => {
                    *state = Some(session);
                    debug!(destination = %self.destination(), "Client connected");
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

    /// Make sure `state` holds a session opened on the current connection
    pub(crate) async fn ensure_connected(
        &self,
        state: &mut Option<ClientSession>,
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

    /// Single send attempt, opening a session first when needed
    async fn try_send(
        &self,
        state: &mut Option<ClientSession>,
        message: &mut Message,
        reply_to: ReplyTo,
    ) -> Result<(), SessionFault> {
        let session = match state.take() {
            Some(session) if session.is_current(&self.connection) => session,
            Some(stale) => {
                self.teardown(stale).await;
                self.open_session().await?
            }
            None => self.open_session().await?,
        };

        if reply_to == ReplyTo::Shared {
            message.reply_to = session
                .reply_channel
                .as_ref()
                .map(|channel| channel.destination.clone());
        }

        let result = session
            .producer
            .send(message)
            .await
            .map_err(|e| SessionFault::new(session.generation, e));
        *state = Some(session);
        result
    }

    /// Send with retry and failover; the caller holds the state lock
    pub(crate) async fn send_locked(
        &self,
        state: &mut Option<ClientSession>,
        message: &mut Message,
        reply_to: ReplyTo,
    ) -> Result<(), MessagingError> {
        self.ensure_connected(state).await?;

        self.retry.reset();
        loop {
            match self.try_send(state, message, reply_to).await {
                Ok(()) => {
                    debug!(
                        destination = %self.destination(),
                        message_id = %message.message_id,
                        correlation_id = ?message.correlation_id,
                        reply_to = ?message.reply_to.as_ref().map(|d| d.uri().to_string()),
                        "Message sent"
                    );
                    return Ok(());
                }
                Err(fault) => {
                    warn!(
                        destination = %self.destination(),
                        attempt = self.retry.attempts() + 1,
                        error = %fault.error,
                        "Error sending message"
                    );
                    if let Some(session) = state.take() {
                        self.teardown(session).await;
                    }
                    self.fail_over(fault.generation).await;

                    if !self.retry.retry().await {
                        let attempts = self.retry.attempts();
                        error!(
                            destination = %self.destination(),
                            attempts = attempts,
                            error = %fault.error,
                            "Error sending message, giving up"
                        );
                        return Err(MessagingError::SendFailed {
                            destination: self.destination().uri().to_string(),
                            attempts,
                            source: fault.error,
                        });
                    }
                }
            }
        }
    }

    async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.take() {
            self.teardown(session).await;
            debug!(destination = %self.destination(), "Client disposed");
        }
        if let Some(replies) = &self.replies {
            replies.close();
        }
    }
}

#[async_trait]
impl ExceptionListener for ClientCore {
    async fn on_exception(&self, error: TransportError) {
        let mut state = self.state.lock().await;
        let session = match state.take() {
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
impl ManagedResource for ClientCore {
    fn describe(&self) -> String {
        format!("client {}", self.destination())
    }

    async fn dispose(&self) {
        ClientCore::dispose(self).await;
    }
}

// ============================================================================
// Public Clients
// ============================================================================

/// Send side of a destination with reconnect, retry and failover
#[derive(Clone)]
pub struct ClientBase {
    core: Arc<ClientCore>,
}

impl ClientBase {
    pub(crate) fn new(
        destination: Destination,
        connection: Arc<SharedConnection>,
        failover: Arc<FailoverSettings>,
        replies: Option<Arc<PendingReplies>>,
    ) -> Self {
        let core = Arc::new_cyclic(|self_ref| ClientCore {
            destination: RwLock::new(destination),
            connection,
            retry: RetryCounter::new(failover),
            state: AsyncMutex::new(None),
            replies,
            self_ref: self_ref.clone(),
        });
        Self { core }
    }

    pub(crate) fn core(&self) -> &ClientCore {
        &self.core
    }

    pub(crate) fn resource(&self) -> Arc<dyn ManagedResource> {
        self.core.clone()
    }

    /// Open a session and producer, retrying with failover
    #[instrument(skip_all, fields(destination = %self.destination()))]
    pub async fn connect(&self) -> Result<(), MessagingError> {
        let mut state = self.core.lock_state().await;
        self.core.ensure_connected(&mut state).await
    }

    /// Send a message and return its correlation id.
    ///
    /// A correlation id is generated when the message has none.
    #[instrument(skip_all, fields(destination = %self.destination()))]
    pub async fn send_message(&self, message: Message) -> Result<String, MessagingError> {
        let mut message = message;
        let correlation_id = message.ensure_correlation_id();

        let mut state = self.core.lock_state().await;
        self.core
            .send_locked(&mut state, &mut message, ReplyTo::Keep)
            .await?;
        Ok(correlation_id)
    }

    /// Current destination; its host follows failover
    pub fn destination(&self) -> Destination {
        self.core.destination()
    }

    pub fn failover_settings(&self) -> &FailoverSettings {
        self.core.retry.settings()
    }

    pub fn retry_counter(&self) -> &RetryCounter {
        &self.core.retry
    }

    /// Whether a session is open on the current connection
    pub async fn is_connected(&self) -> bool {
        self.core
            .lock_state()
            .await
            .as_ref()
            .map(|session| session.is_current(&self.core.connection))
            .unwrap_or(false)
    }

    /// Release the producer and session. Never fails; safe to repeat.
    pub async fn dispose(&self) {
        self.core.dispose().await;
    }
}

impl std::fmt::Debug for ClientBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBase")
            .field("destination", &self.destination())
            .finish_non_exhaustive()
    }
}

/// Fire-and-forget client
#[derive(Debug, Clone)]
pub struct OneWayClient {
    base: ClientBase,
}

impl OneWayClient {
    pub(crate) fn new(base: ClientBase) -> Self {
        Self { base }
    }

    /// Send a message without waiting for any reply
    pub async fn send_one_way(&self, message: Message) -> Result<(), MessagingError> {
        self.base.send_message(message).await.map(|_| ())
    }
}

impl Deref for OneWayClient {
    type Target = ClientBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
