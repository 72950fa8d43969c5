//! Listener subscribing to a publish/subscribe topic.
//!
//! Without a subscriber id the subscription is non-durable and only sees
//! messages published while it is connected. With one, the listener uses a
//! durable subscription and a stable client id of `{subscriber_id}-{topic}`,
//! so messages published while it was away are delivered on reconnect.

use crate::connection::SharedConnection;
use crate::destination::Destination;
use crate::error::MessagingError;
use crate::listener::ListenerBase;
use crate::settings::{FailoverSettings, ListenerSettings};
use std::ops::Deref;
use std::sync::Arc;
use tracing::instrument;

#[cfg(test)]
#[path = "topic_listener_tests.rs"]
mod tests;

#[derive(Debug, Clone)]
pub struct TopicListener {
    base: ListenerBase,
    subscriber_id: Option<String>,
}

impl TopicListener {
    pub(crate) fn new(
        destination: Destination,
        connection: Arc<SharedConnection>,
        failover: Arc<FailoverSettings>,
        settings: ListenerSettings,
        subscriber_id: Option<String>,
    ) -> Self {
        let client_id = settings.connection_id.clone().or_else(|| {
            subscriber_id
                .as_ref()
                .map(|id| durable_client_id(id, destination.name()))
        });
        Self {
            base: ListenerBase::new(destination, connection, failover, settings, client_id),
            subscriber_id,
        }
    }

    pub fn subscriber_id(&self) -> Option<&str> {
        self.subscriber_id.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.subscriber_id.is_some()
    }

    /// Connect and subscribe, durably when a subscriber id is set
    #[instrument(skip_all, fields(destination = %self.destination(), durable = self.is_durable()))]
    pub async fn start(&self) -> Result<(), MessagingError> {
        self.base.connect().await?;
        let topic = self.base.destination();
        match &self.subscriber_id {
            Some(subscriber_id) => {
                self.base
                    .register_durable_consumer(&topic, subscriber_id)
                    .await
            }
            None => self.base.register_consumer(&topic).await,
        }
    }
}

impl Deref for TopicListener {
    type Target = ListenerBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

fn durable_client_id(subscriber_id: &str, topic: &str) -> String {
    format!("{}-{}", subscriber_id, topic)
}
