//! Notification sink seam.
//!
//! The core publishes on a fixed set of channels ([`Channel`]). Transport is
//! someone else's problem: the engine publishes over NATS, tests record
//! into memory. Delivery is fire-and-forget.

use std::future::Future;
use std::sync::Mutex;

use serde::Serialize;

use rustbelt_types::Channel;

/// Errors from publishing.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The channel name is not on the allow-list.
    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),

    /// The payload could not be serialized.
    #[error("failed to serialize notification payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The transport rejected the message.
    #[error("notification transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },
}

/// Accepts JSON payloads on allow-listed channels.
pub trait NotificationSink: Send + Sync {
    /// Send an already-serialized payload on a channel.
    fn publish(&self, channel: Channel, payload: serde_json::Value) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Serialize and publish on a typed channel.
pub async fn publish_json<S, T>(sink: &S, channel: Channel, payload: &T) -> Result<(), NotifyError>
where
    S: NotificationSink,
    T: Serialize + Sync,
{
    let value = serde_json::to_value(payload)?;
    sink.publish(channel, value).await
}

/// Publish on a channel given by name, rejecting names off the allow-list.
pub async fn publish_named<S, T>(sink: &S, channel: &str, payload: &T) -> Result<(), NotifyError>
where
    S: NotificationSink,
    T: Serialize + Sync,
{
    let channel: Channel = channel
        .parse()
        .map_err(|_unknown| NotifyError::UnknownChannel(channel.to_owned()))?;
    publish_json(sink, channel, payload).await
}

/// A sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(Channel, serde_json::Value)>>,
}

impl RecordingSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    pub fn messages(&self) -> Vec<(Channel, serde_json::Value)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Payloads published on one channel.
    pub fn on(&self, channel: Channel) -> Vec<serde_json::Value> {
        self.messages()
            .into_iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, v)| v)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    async fn publish(&self, channel: Channel, payload: serde_json::Value) -> Result<(), NotifyError> {
        let mut messages = self.messages.lock().map_err(|e| NotifyError::Transport {
            message: e.to_string(),
        })?;
        messages.push((channel, payload));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn allow_listed_names_publish() {
        let sink = RecordingSink::new();
        for name in ["phase", "world_delta", "feed", "tick"] {
            publish_named(&sink, name, &json!({"n": name})).await.unwrap();
        }
        assert_eq!(sink.messages().len(), 4);
        assert_eq!(sink.on(Channel::Feed), vec![json!({"n": "feed"})]);
    }

    #[tokio::test]
    async fn other_names_rejected() {
        let sink = RecordingSink::new();
        let err = publish_named(&sink, "admin", &json!({})).await;
        assert!(matches!(err, Err(NotifyError::UnknownChannel(name)) if name == "admin"));
        assert!(sink.messages().is_empty());
    }
}
