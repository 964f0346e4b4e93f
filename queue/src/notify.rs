use std::time::Duration;

use futures::StreamExt;

/// A live subscription to one of the queue's pub/sub channels, used to wake
/// the dispatch loop and the delay timer without busy-polling. Holds a
/// dedicated connection: a connection in subscriber mode cannot run
/// ordinary commands and must never come from the shared pool.
pub(crate) struct Subscription {
    pubsub: redis::aio::PubSub,
}

impl Subscription {
    pub(crate) async fn open(client: &redis::Client, channel: &str) -> redis::RedisResult<Self> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(Subscription { pubsub })
    }

    /// Waits up to `timeout` for a message, returning its payload if one
    /// arrived in time.
    pub(crate) async fn wait(&mut self, timeout: Duration) -> Option<String> {
        let mut stream = self.pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(msg)) => msg.get_payload().ok(),
            _ => None,
        }
    }

    /// Waits indefinitely for the next message.
    pub(crate) async fn recv(&mut self) -> Option<String> {
        let mut stream = self.pubsub.on_message();
        let msg = stream.next().await?;
        msg.get_payload().ok()
    }
}
