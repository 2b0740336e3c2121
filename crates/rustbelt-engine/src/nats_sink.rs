//! NATS transport for tick notifications.
//!
//! Every channel maps to one subject, `{prefix}.{channel}`; with the
//! default prefix the engine publishes on `rustbelt.phase`,
//! `rustbelt.world_delta`, `rustbelt.feed` and `rustbelt.tick`. Messages
//! are plain core NATS publishes with a JSON body. Nothing is persisted
//! and nobody acknowledges, so a subscriber that is down misses them.

use rustbelt_core::{NotificationSink, NotifyError};
use rustbelt_types::Channel;
use tracing::{debug, info};

/// Publishes notifications to NATS.
#[derive(Debug, Clone)]
pub struct NatsSink {
    client: async_nats::Client,
    prefix: String,
}

impl NatsSink {
    /// Wrap an already connected client.
    pub fn new(client: async_nats::Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.trim_end_matches('.').to_owned(),
        }
    }

    /// Connect to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Transport`] if the connection fails.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, NotifyError> {
        info!(url = url, "connecting to NATS server");
        let client = async_nats::connect(url).await.map_err(|e| NotifyError::Transport {
            message: format!("failed to connect to NATS at {url}: {e}"),
        })?;
        info!("NATS connection established");
        Ok(Self::new(client, prefix))
    }

    /// The subject a channel publishes on.
    pub fn subject(&self, channel: Channel) -> String {
        subject_for(&self.prefix, channel)
    }

    /// Flush buffered messages; called once on shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Transport`] if the flush fails.
    pub async fn flush(&self) -> Result<(), NotifyError> {
        self.client.flush().await.map_err(|e| NotifyError::Transport {
            message: format!("failed to flush NATS: {e}"),
        })
    }
}

fn subject_for(prefix: &str, channel: Channel) -> String {
    if prefix.is_empty() {
        channel.as_str().to_owned()
    } else {
        format!("{prefix}.{}", channel.as_str())
    }
}

impl NotificationSink for NatsSink {
    async fn publish(&self, channel: Channel, payload: serde_json::Value) -> Result<(), NotifyError> {
        let subject = self.subject(channel);
        let body = serde_json::to_vec(&payload)?;
        let bytes = body.len();
        self.client
            .publish(subject.clone(), body.into())
            .await
            .map_err(|e| NotifyError::Transport {
                message: format!("failed to publish on {subject}: {e}"),
            })?;
        debug!(subject = %subject, bytes, "notification published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_prefixed_channel_names() {
        assert_eq!(subject_for("rustbelt", Channel::Phase), "rustbelt.phase");
        assert_eq!(subject_for("rustbelt", Channel::WorldDelta), "rustbelt.world_delta");
        assert_eq!(subject_for("city.eu", Channel::Tick), "city.eu.tick");
    }

    #[test]
    fn empty_prefix_uses_bare_channel() {
        assert_eq!(subject_for("", Channel::Feed), "feed");
    }
}
