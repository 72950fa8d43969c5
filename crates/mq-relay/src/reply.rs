//! Correlation-keyed table of replies awaited by request/reply callers.
//!
//! The reply consumer writes into the table, callers of
//! [`crate::QueueClient::end_send`] read from it. A reply that arrives before
//! anyone waits for it is retained until it expires.

use crate::error::MessagingError;
use crate::message::ReceivedMessage;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

enum Entry {
    Waiting(oneshot::Sender<ReceivedMessage>),
    Arrived {
        reply: ReceivedMessage,
        expires_at: Instant,
    },
}

impl Entry {
    fn is_stale(&self, now: Instant) -> bool {
        match self {
            Self::Waiting(sender) => sender.is_closed(),
            Self::Arrived { expires_at, .. } => now >= *expires_at,
        }
    }
}

/// A request waiting for its reply
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<ReceivedMessage>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn into_parts(self) -> (String, oneshot::Receiver<ReceivedMessage>) {
        (self.correlation_id, self.receiver)
    }
}

/// Pending-reply table shared by a reply consumer and its waiters
pub struct PendingReplies {
    entries: Mutex<HashMap<String, Entry>>,
    retention: Duration,
}

impl PendingReplies {
    /// `retention` applies to unclaimed replies that carry no time-to-live
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Start waiting for the reply correlated with `correlation_id`.
    ///
    /// A reply that already arrived is handed over immediately.
    pub fn register(&self, correlation_id: &str) -> Result<PendingReply, MessagingError> {
        let mut entries = self.lock_entries();
        purge_stale(&mut entries);

        let (sender, receiver) = oneshot::channel();
        match entries.remove(correlation_id) {
            Some(Entry::Waiting(existing)) => {
                entries.insert(correlation_id.to_string(), Entry::Waiting(existing));
                return Err(MessagingError::DuplicateCorrelationId {
                    correlation_id: correlation_id.to_string(),
                });
            }
            Some(Entry::Arrived { reply, .. }) => {
                // The receiver is alive, so this send cannot fail
                let _ = sender.send(reply);
            }
            None => {
                entries.insert(correlation_id.to_string(), Entry::Waiting(sender));
            }
        }

        Ok(PendingReply {
            correlation_id: correlation_id.to_string(),
            receiver,
        })
    }

    /// Hand a reply to its waiter, or retain it until it expires.
    ///
    /// Returns `true` when a waiter received the reply.
    pub fn deliver(&self, reply: ReceivedMessage) -> bool {
        let Some(correlation_id) = reply.correlation_id.clone().filter(|id| !id.is_empty()) else {
            debug!(message_id = %reply.message_id, "Reply without correlation id discarded");
            return false;
        };

        let mut entries = self.lock_entries();
        purge_stale(&mut entries);

        match entries.remove(&correlation_id) {
            Some(Entry::Waiting(sender)) => match sender.send(reply) {
                Ok(()) => true,
                Err(_) => {
                    debug!(correlation_id = %correlation_id, "Waiter gone, reply discarded");
                    false
                }
            },
            _ => {
                let retention = reply.time_to_live.unwrap_or(self.retention);
                debug!(
                    correlation_id = %correlation_id,
                    retention_ms = retention.as_millis() as u64,
                    "Retaining unclaimed reply"
                );
                entries.insert(
                    correlation_id,
                    Entry::Arrived {
                        reply,
                        expires_at: Instant::now() + retention,
                    },
                );
                false
            }
        }
    }

    /// Stop waiting for `correlation_id`
    pub fn cancel(&self, correlation_id: &str) {
        self.lock_entries().remove(correlation_id);
    }

    /// Drop every entry; current waiters observe a closed channel
    pub fn close(&self) {
        self.lock_entries().clear();
    }

    /// Entries currently held, waiting or retained
    pub fn len(&self) -> usize {
        let mut entries = self.lock_entries();
        purge_stale(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn purge_stale(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    entries.retain(|_, entry| !entry.is_stale(now));
}

#[cfg(test)]
#[path = "reply_tests.rs"]
mod tests;
