//! Listener consuming from a point-to-point queue.

use crate::connection::SharedConnection;
use crate::destination::Destination;
use crate::error::MessagingError;
use crate::listener::ListenerBase;
use crate::settings::{FailoverSettings, ListenerSettings};
use std::ops::Deref;
use std::sync::Arc;
use tracing::instrument;

#[cfg(test)]
#[path = "queue_listener_tests.rs"]
mod tests;

/// Queue listener; the connection id, if configured, becomes the client id
#[derive(Debug, Clone)]
pub struct QueueListener {
    base: ListenerBase,
}

impl QueueListener {
    pub(crate) fn new(
        destination: Destination,
        connection: Arc<SharedConnection>,
        failover: Arc<FailoverSettings>,
        settings: ListenerSettings,
    ) -> Self {
        let client_id = settings.connection_id.clone();
        Self {
            base: ListenerBase::new(destination, connection, failover, settings, client_id),
        }
    }

    /// Connect and register a consumer on the queue
    #[instrument(skip_all, fields(destination = %self.destination()))]
    pub async fn start(&self) -> Result<(), MessagingError> {
        self.base.connect().await?;
        let destination = self.base.destination();
        self.base.register_consumer(&destination).await
    }
}

impl Deref for QueueListener {
    type Target = ListenerBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
