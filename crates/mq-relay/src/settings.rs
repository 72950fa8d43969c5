//! Failover, listener and request/reply settings.
//!
//! Settings are plain serde structs so a host process can deserialize them
//! from whatever configuration source it loads. Durations are written as
//! milliseconds.

use crate::destination::DestinationUri;
use crate::error::{ConfigurationError, ValidationError};
use crate::transport::AcknowledgementMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker failover and reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Broker hosts tried in rotation, e.g. `tcp://broker-a:61616`
    pub broker_uris: Vec<String>,
    pub max_reconnect_attempts: u32,
    pub use_exponential_back_off: bool,
    /// Delay before the first retry; also the constant delay without backoff
    #[serde(with = "duration_ms")]
    pub initial_reconnect_delay: Duration,
    pub back_off_multiplier: f64,
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            broker_uris: Vec::new(),
            max_reconnect_attempts: 5,
            use_exponential_back_off: true,
            initial_reconnect_delay: Duration::from_millis(100),
            back_off_multiplier: 2.0,
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl FailoverSettings {
    /// Failover settings rotating over the given broker hosts
    pub fn with_broker_uris<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            broker_uris: uris.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.back_off_multiplier.is_finite() || self.back_off_multiplier < 1.0 {
            return Err(ValidationError::OutOfRange {
                field: "back_off_multiplier".to_string(),
                message: format!(
                    "must be a finite value of at least 1.0, got {}",
                    self.back_off_multiplier
                ),
            });
        }

        if self.max_reconnect_delay < self.initial_reconnect_delay {
            return Err(ValidationError::OutOfRange {
                field: "max_reconnect_delay".to_string(),
                message: "must not be shorter than initial_reconnect_delay".to_string(),
            });
        }

        if let Some(uri) = self.broker_uris.iter().find(|uri| uri.trim().is_empty()) {
            return Err(ValidationError::InvalidFormat {
                field: "broker_uris".to_string(),
                message: format!("empty broker uri '{}'", uri),
            });
        }

        Ok(())
    }
}

/// Receive-side settings shared by queue and topic listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub acknowledgement_mode: AcknowledgementMode,
    /// Deliveries above this count are treated as poison messages
    pub maximum_redelivery_count: u32,
    /// Queue name poison messages are forwarded to on the listener's host
    pub dead_letter_queue: Option<String>,
    /// Stable client id applied to the shared connection on every connect
    pub connection_id: Option<String>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            acknowledgement_mode: AcknowledgementMode::Transactional,
            maximum_redelivery_count: 0,
            dead_letter_queue: None,
            connection_id: None,
        }
    }
}

/// Request/reply settings for [`crate::QueueClient`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestReplySettings {
    /// How long a reply nobody is waiting for yet is kept, unless the reply
    /// carries its own time-to-live
    #[serde(with = "duration_ms")]
    pub reply_retention: Duration,
}

impl Default for RequestReplySettings {
    fn default() -> Self {
        Self {
            reply_retention: Duration::from_secs(60),
        }
    }
}

/// Settings handed to a [`crate::ConnectionManager`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    /// Propagated to every client and listener when present
    pub failover: Option<FailoverSettings>,
    pub listener: ListenerSettings,
    pub request_reply: RequestReplySettings,
}

impl MessagingSettings {
    /// Extract settings from an already assembled configuration tree.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mq_relay::MessagingSettings;
    ///
    /// let config = config::Config::builder()
    ///     .set_override("messaging.listener.maximum_redelivery_count", 3)
    ///     .unwrap()
    ///     .build()
    ///     .unwrap();
    ///
    /// let settings = MessagingSettings::from_config(&config, "messaging").unwrap();
    /// assert_eq!(settings.listener.maximum_redelivery_count, 3);
    /// ```
    pub fn from_config(config: &config::Config, key: &str) -> Result<Self, ConfigurationError> {
        let settings: Self = config
            .get(key)
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(failover) = &self.failover {
            failover.validate().map_err(|e| ConfigurationError::Invalid {
                message: e.to_string(),
            })?;
        }

        if let Some(dlq) = &self.listener.dead_letter_queue {
            // The dead letter queue lives next to the listener's destination
            DestinationUri::new("host", dlq.as_str()).map_err(|e| ConfigurationError::Invalid {
                message: format!("dead_letter_queue: {}", e),
            })?;
        }

        Ok(())
    }
}

/// Serialize durations as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
