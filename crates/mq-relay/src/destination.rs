//! Broker destinations and their `scheme://host[:port]/name` addresses.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the topic that listeners publish liveness advisories to
pub const ADVISORY_TOPIC: &str = "ServiceHostAdvisory";

// ============================================================================
// Destination Uri
// ============================================================================

/// Broker address of a destination, split into the broker host and the
/// destination name.
///
/// The address is split at the *last* `/`, so the host keeps its scheme and
/// port: `tcp://broker:61616/orders` has host `tcp://broker:61616` and name
/// `orders`.
///
/// # Examples
///
/// ```rust
/// use mq_relay::DestinationUri;
///
/// let uri: DestinationUri = "tcp://broker:61616/orders".parse().unwrap();
/// assert_eq!(uri.host(), "tcp://broker:61616");
/// assert_eq!(uri.name(), "orders");
/// assert_eq!(uri.to_string(), "tcp://broker:61616/orders");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DestinationUri {
    host: String,
    name: String,
}

impl DestinationUri {
    /// Create a destination uri from its parts
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Result<Self, ConfigurationError> {
        let host = host.into();
        let name = name.into();

        if host.is_empty() {
            return Err(invalid(&format!("{}/{}", host, name), "host is empty"));
        }
        if name.is_empty() {
            return Err(invalid(&format!("{}/{}", host, name), "name is empty"));
        }
        if name.contains('/') {
            return Err(invalid(
                &format!("{}/{}", host, name),
                "name must not contain '/'",
            ));
        }

        Ok(Self { host, name })
    }

    /// Parse an address by splitting it at its last `/`
    pub fn parse(uri: &str) -> Result<Self, ConfigurationError> {
        if uri.is_empty() {
            return Err(invalid(uri, "uri is empty"));
        }

        let Some(separator) = uri.rfind('/') else {
            return Err(invalid(uri, "expected 'host/name'"));
        };

        // The last '/' must follow the authority, not sit inside "scheme://"
        if let Some(scheme_end) = uri.find("://") {
            if separator <= scheme_end + 3 {
                return Err(invalid(uri, "expected 'scheme://authority/name'"));
            }
        }

        let (host, name) = (&uri[..separator], &uri[separator + 1..]);
        if host.is_empty() || name.is_empty() {
            return Err(invalid(uri, "expected 'host/name'"));
        }

        Ok(Self {
            host: host.to_string(),
            name: name.to_string(),
        })
    }

    /// Broker host including scheme and port
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination name on the broker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full address, `host/name`
    pub fn uri(&self) -> String {
        format!("{}/{}", self.host, self.name)
    }

    /// Same destination name on a different broker host
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: self.name.clone(),
        }
    }
}

fn invalid(uri: &str, message: &str) -> ConfigurationError {
    ConfigurationError::InvalidDestinationUri {
        uri: uri.to_string(),
        message: message.to_string(),
    }
}

impl fmt::Display for DestinationUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.name)
    }
}

impl FromStr for DestinationUri {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DestinationUri {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DestinationUri> for String {
    fn from(value: DestinationUri) -> Self {
        value.uri()
    }
}

// ============================================================================
// Destination
// ============================================================================

/// Kind of broker endpoint a destination refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
    /// Broker-generated queue that lives as long as the connection that created it
    TemporaryQueue,
}

impl DestinationKind {
    /// Queue semantics: each message goes to exactly one consumer
    pub fn is_queue(&self) -> bool {
        matches!(self, Self::Queue | Self::TemporaryQueue)
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "Queue"),
            Self::Topic => write!(f, "Topic"),
            Self::TemporaryQueue => write!(f, "TemporaryQueue"),
        }
    }
}

/// A named queue or topic on a broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    kind: DestinationKind,
    uri: DestinationUri,
}

impl Destination {
    pub fn new(kind: DestinationKind, uri: DestinationUri) -> Self {
        Self { kind, uri }
    }

    /// Queue destination from a full address
    pub fn queue(uri: &str) -> Result<Self, ConfigurationError> {
        Ok(Self::new(DestinationKind::Queue, DestinationUri::parse(uri)?))
    }

    /// Topic destination from a full address
    pub fn topic(uri: &str) -> Result<Self, ConfigurationError> {
        Ok(Self::new(DestinationKind::Topic, DestinationUri::parse(uri)?))
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn uri(&self) -> &DestinationUri {
        &self.uri
    }

    pub fn host(&self) -> &str {
        self.uri.host()
    }

    pub fn name(&self) -> &str {
        self.uri.name()
    }

    /// Same destination on another broker host
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            uri: self.uri.with_host(host),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.uri)
    }
}

#[cfg(test)]
#[path = "destination_tests.rs"]
mod tests;
