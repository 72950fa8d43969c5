//! Synchronous request/reply over asynchronous delivery.
//!
//! A [`QueueClient`] provisions a temporary reply queue alongside its
//! producer. Requests carry a correlation id and a reply-to address; replies
//! arriving on the temporary queue are matched to their request through a
//! correlation-keyed pending table.

use crate::client::{ClientBase, ReplyTo};
use crate::error::{ConfigurationError, MessagingError};
use crate::message::{Message, ReceivedMessage};
use crate::reply::{PendingReplies, PendingReply};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "queue_client_tests.rs"]
mod tests;

/// Request/reply client built on [`ClientBase`]
///
/// # Examples
///
/// ```rust,no_run
/// use mq_relay::{ConnectionManager, Destination, InMemoryBroker, Message, MessagingSettings};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), mq_relay::MessagingError> {
/// let manager = ConnectionManager::new(Arc::new(InMemoryBroker::new()), MessagingSettings::default())?;
/// let quotes = Destination::queue("tcp://broker:61616/quotes").unwrap();
/// let client = manager.create_reply_client(&quotes)?;
///
/// let reply = client.send(Message::text("ACME"), Duration::from_secs(5)).await?;
/// println!("quote: {:?}", reply.body_text());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct QueueClient {
    base: ClientBase,
}

impl QueueClient {
    pub(crate) fn new(base: ClientBase) -> Self {
        Self { base }
    }

    fn replies(&self) -> Result<&Arc<PendingReplies>, MessagingError> {
        self.base.core().replies().ok_or_else(|| {
            ConfigurationError::Invalid {
                message: "client was created without a reply channel".to_string(),
            }
            .into()
        })
    }

    /// Send a request and return a handle for its reply.
    ///
    /// The message keeps a caller-supplied reply-to; otherwise replies are
    /// directed at this client's temporary queue.
    #[instrument(skip_all, fields(destination = %self.base.destination()))]
    pub async fn begin_send(&self, message: Message) -> Result<PendingReply, MessagingError> {
        let replies = self.replies()?;
        let mut message = message;
        let correlation_id = message.ensure_correlation_id();
        let reply_to = if message.reply_to.is_some() {
            ReplyTo::Keep
        } else {
            ReplyTo::Shared
        };

        let core = self.base.core();
        let mut state = core.lock_state().await;
        core.ensure_connected(&mut state).await?;

        let pending = replies.register(&correlation_id)?;
        if let Err(e) = core.send_locked(&mut state, &mut message, reply_to).await {
            replies.cancel(&correlation_id);
            return Err(e);
        }

        debug!(correlation_id = %correlation_id, "Request sent, awaiting reply");
        Ok(pending)
    }

    /// Wait up to `timeout` for the reply to a request
    pub async fn end_send(
        &self,
        pending: PendingReply,
        timeout: Duration,
    ) -> Result<ReceivedMessage, MessagingError> {
        let (correlation_id, receiver) = pending.into_parts();

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MessagingError::ReplyChannelClosed { correlation_id }),
            Err(_) => {
                if let Ok(replies) = self.replies() {
                    replies.cancel(&correlation_id);
                }
                warn!(
                    destination = %self.base.destination(),
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "No reply received in time"
                );
                Err(MessagingError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    /// [`Self::begin_send`] followed by [`Self::end_send`]
    pub async fn send(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<ReceivedMessage, MessagingError> {
        let pending = self.begin_send(message).await?;
        self.end_send(pending, timeout).await
    }

    /// Replies currently awaited or retained
    pub fn pending_replies(&self) -> usize {
        self.replies().map(|replies| replies.len()).unwrap_or(0)
    }
}

impl Deref for QueueClient {
    type Target = ClientBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
