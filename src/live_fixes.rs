//! In-process pub/sub channel registry for `SUBSCRIBE`/`PSUBSCRIBE` and
//! hook `Delivery::Channel` fanout (spec §4.4 "pub/sub delivery").
//!
//! Adapted from the teacher's `LiveFixService`: same get-or-create-
//! broadcaster-per-key pattern, minus the NATS transport — there is no
//! external message bus in scope here, so publish and subscribe both stay
//! in-process via `tokio::sync::broadcast`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::info;

const CHANNEL_CAPACITY: usize = 256;

pub type ChannelBroadcasters = Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>;

#[derive(Default)]
pub struct PubSub {
    broadcasters: ChannelBroadcasters,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to `channel`; a channel with no subscribers simply
    /// drops the message, matching `broadcast::Sender::send`'s semantics.
    pub async fn publish(&self, channel: &str, message: Value) -> usize {
        let broadcasters = self.broadcasters.read().await;
        match broadcasters.get(channel) {
            Some(tx) => tx.send(message).map(|_| tx.receiver_count()).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to `channel`, creating its broadcaster if this is the
    /// first subscriber.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        let mut broadcasters = self.broadcasters.write().await;
        broadcasters
            .entry(channel.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                tx
            })
            .subscribe()
    }

    /// Names matching a glob pattern that currently have at least one
    /// subscriber, used by `SETCHAN`/`PDELCHAN` fanout to skip dead channels.
    pub async fn matching(&self, pattern: &str) -> Vec<String> {
        let re = crate::command::glob_to_regex(pattern);
        let broadcasters = self.broadcasters.read().await;
        broadcasters
            .iter()
            .filter(|(name, tx)| re.is_match(name) && tx.receiver_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop a channel's broadcaster once nobody is subscribed, mirroring
    /// the teacher's `cleanup_aircraft` idle-cleanup.
    pub async fn cleanup(&self, channel: &str) {
        let mut broadcasters = self.broadcasters.write().await;
        if let Some(tx) = broadcasters.get(channel)
            && tx.receiver_count() == 0
        {
            broadcasters.remove(channel);
            info!(channel, "cleaned up idle pub/sub channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let pubsub = PubSub::new();
        let mut rx = pubsub.subscribe("fleet").await;
        pubsub.publish("fleet", serde_json::json!({"id": "t1"})).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["id"], "t1");
    }

    #[tokio::test]
    async fn publish_to_unknown_channel_is_a_noop() {
        let pubsub = PubSub::new();
        let delivered = pubsub.publish("nobody", serde_json::json!({})).await;
        assert_eq!(delivered, 0);
    }
}
