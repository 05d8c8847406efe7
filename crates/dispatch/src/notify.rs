//! Realtime notification channels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use crate::error::NotifyError;
use crate::ports::Notifier;

/// An emitted event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub payload: JsonValue,
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Emitting with no live subscribers is not an error: notifications are
/// fire-and-forget.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn emit(&self, event: &str, payload: JsonValue) -> Result<(), NotifyError> {
        let _ = self.tx.send(Notification {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_pubsub::RedisPubSubNotifier;

#[cfg(feature = "redis")]
mod redis_pubsub {
    use async_trait::async_trait;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;
    use serde_json::Value as JsonValue;

    use super::Notification;
    use crate::error::NotifyError;
    use crate::ports::Notifier;

    /// Publishes JSON notifications on one Redis pub/sub channel.
    ///
    /// Pub/sub is not durable: subscribers that are offline miss events.
    #[derive(Clone)]
    pub struct RedisPubSubNotifier {
        conn: ConnectionManager,
        channel: String,
    }

    impl RedisPubSubNotifier {
        pub async fn connect(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, NotifyError> {
            let client = redis::Client::open(redis_url.as_ref()).map_err(|e| NotifyError(e.to_string()))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(|e| NotifyError(e.to_string()))?;
            Ok(Self {
                conn,
                channel: channel.into(),
            })
        }
    }

    #[async_trait]
    impl Notifier for RedisPubSubNotifier {
        async fn emit(&self, event: &str, payload: JsonValue) -> Result<(), NotifyError> {
            let message = serde_json::to_string(&Notification {
                event: event.to_string(),
                payload,
            })
            .map_err(|e| NotifyError(e.to_string()))?;

            let mut conn = self.conn.clone();
            let _: i64 = conn
                .publish(&self.channel, message)
                .await
                .map_err(|e| NotifyError(e.to_string()))?;
            Ok(())
        }
    }
}
