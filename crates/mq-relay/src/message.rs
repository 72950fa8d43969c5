//! Message types exchanged with the broker.

use crate::destination::Destination;
use crate::error::ValidationError;
use crate::transport::BrokerMessage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for messages sent through the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Generate a fresh correlation id
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to a destination
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub time_to_live: Option<Duration>,
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: MessageId::new(),
            body: body.into(),
            properties: HashMap::new(),
            correlation_id: None,
            reply_to: None,
            time_to_live: None,
        }
    }

    /// Create a message carrying UTF-8 text
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Add message property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add correlation ID linking this message to a request or reply
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Ask receivers to reply to the given destination
    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Add time-to-live for message expiration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Body as text, if it is valid UTF-8
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Return the correlation id, generating one first if the message has none.
    ///
    /// An existing id is never replaced.
    pub fn ensure_correlation_id(&mut self) -> String {
        match &self.correlation_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let id = new_correlation_id();
                self.correlation_id = Some(id.clone());
                id
            }
        }
    }
}

/// Transport-agnostic view of a message delivered to a handler
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub time_to_live: Option<Duration>,
    /// Broker host the message was received from
    pub origin_host: String,
    /// Number of times the broker has delivered this message, starting at 1
    pub delivery_count: u32,
    pub received_at: Timestamp,
}

impl ReceivedMessage {
    /// Build the handler view of a broker delivery
    pub fn from_broker(message: &dyn BrokerMessage, origin_host: &str) -> Self {
        let inner = message.message();
        Self {
            message_id: inner.message_id.clone(),
            body: inner.body.clone(),
            properties: inner.properties.clone(),
            correlation_id: inner.correlation_id.clone(),
            reply_to: inner.reply_to.clone(),
            time_to_live: inner.time_to_live,
            origin_host: origin_host.to_string(),
            delivery_count: message.delivery_count(),
            received_at: Timestamp::now(),
        }
    }

    /// Convert back to Message (for forwarding/replying)
    pub fn message(&self) -> Message {
        Message {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            time_to_live: self.time_to_live,
        }
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
