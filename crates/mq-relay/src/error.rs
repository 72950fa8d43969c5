//! Error types for broker operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for client and listener operations
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Error trying to create connection to {destination} after {attempts} attempts")]
    ConnectFailed {
        destination: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Error sending message to {destination} after {attempts} attempts")]
    SendFailed {
        destination: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("No reply for correlation id '{correlation_id}' within {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Correlation id '{correlation_id}' already has a pending reply")]
    DuplicateCorrelationId { correlation_id: String },

    #[error("Reply channel closed before a reply for '{correlation_id}' arrived")]
    ReplyChannelClosed { correlation_id: String },
}

impl MessagingError {
    /// Check if error is transient and the operation may succeed if repeated
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
            Self::Transport(error) => error.is_transient(),
            Self::ConnectFailed { .. } => false,
            Self::SendFailed { .. } => false,
            Self::Timeout { .. } => true,
            Self::DuplicateCorrelationId { .. } => false,
            Self::ReplyChannelClosed { .. } => false,
        }
    }

    /// Check if error was raised after the retry budget was exhausted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::SendFailed { .. })
    }
}

/// Faults reported by the underlying broker transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {host} refused: {message}")]
    ConnectionRefused { host: String, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Send to {destination} failed: {message}")]
    SendFailed {
        destination: String,
        message: String,
    },

    #[error("Client id '{client_id}' rejected: {message}")]
    InvalidClientId { client_id: String, message: String },

    #[error("Broker error: {code} - {message}")]
    Broker { code: String, message: String },
}

impl TransportError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } => true,
            Self::ConnectionClosed => true,
            Self::SessionClosed => true,
            Self::SendFailed { .. } => true,
            Self::InvalidClientId { .. } => false,
            Self::Broker { .. } => true,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid destination uri '{uri}': {message}")]
    InvalidDestinationUri { uri: String, message: String },

    #[error("Destination type {kind} is not supported here")]
    UnsupportedDestination { kind: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
