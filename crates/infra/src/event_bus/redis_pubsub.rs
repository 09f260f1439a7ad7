//! Redis pub/sub notification bus (feature `redis`).
//!
//! Redis pub/sub drops messages for subscribers that are offline, which is
//! acceptable here: workers poll regardless. Each subscription owns one
//! blocking connection on its own listener thread.

use std::io;
use std::thread::{self, JoinHandle};

use redis::{Commands, Connection};
use tracing::{debug, warn};

use lockstep_events::{Feed, JobNotification, NotifyBus, NotifyError, Subscription, feed};

use super::{DEFAULT_CHANNEL, LISTEN_TICK, decode, encode};

#[derive(Debug, Clone)]
pub struct RedisPubSubNotifyBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubNotifyBus {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;
        Ok(Self {
            client,
            channel: DEFAULT_CHANNEL.to_string(),
        })
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    fn spawn_listener(&self, feed: Feed<JobNotification>) -> io::Result<JoinHandle<()>> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        thread::Builder::new()
            .name("lockstep-redis-listener".to_string())
            .spawn(move || match client.get_connection() {
                Ok(mut conn) => listen(&mut conn, &channel, &feed),
                Err(e) => warn!(error = %e, "redis subscribe connection failed"),
            })
    }
}

/// Relay messages on `channel` into `feed` until the subscriber goes away or
/// the connection fails.
fn listen(conn: &mut Connection, channel: &str, feed: &Feed<JobNotification>) {
    if let Err(e) = conn.set_read_timeout(Some(LISTEN_TICK)) {
        warn!(error = %e, "redis listener cannot bound its reads");
        return;
    }
    let mut pubsub = conn.as_pubsub();
    if let Err(e) = pubsub.subscribe(channel) {
        warn!(%channel, error = %e, "redis subscribe failed");
        return;
    }

    while !feed.is_closed() {
        let message = match pubsub.get_message() {
            Ok(m) => m,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(error = %e, "redis pub/sub connection lost");
                return;
            }
        };
        let Ok(payload) = message.get_payload::<String>() else {
            continue;
        };
        if let Some(notification) = decode(&payload) {
            if feed.send(notification).is_err() {
                break;
            }
        }
    }
    debug!(%channel, "subscriber gone, listener stopped");
}

fn transport(err: redis::RedisError) -> NotifyError {
    NotifyError::Transport(err.to_string())
}

impl NotifyBus for RedisPubSubNotifyBus {
    fn publish(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        let payload = encode(notification)?;
        let mut conn = self.client.get_connection().map_err(transport)?;
        let receivers: i64 = conn.publish(&self.channel, payload).map_err(transport)?;
        debug!(channel = %self.channel, receivers, "notification published");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        let (feed, subscription) = feed();
        // Without a listener the subscriber sees a closed channel and polls.
        if let Err(e) = self.spawn_listener(feed) {
            warn!(error = %e, "failed to spawn redis listener thread");
        }
        subscription
    }
}
