//! Broker transport implementations.
//!
//! This module contains concrete implementations of the transport traits in
//! [`crate::transport`].

pub mod memory;

pub use memory::{
    InMemoryBroker, InMemoryConnection, InMemoryConsumer, InMemoryDelivery, InMemoryProducer,
    InMemorySession, DEFAULT_MAX_REDELIVERIES, NATIVE_DEAD_LETTER_QUEUE,
};
