//! Postgres `LISTEN/NOTIFY` notification bus.
//!
//! Uses the same database as the job store, so a deployment needs no extra
//! infrastructure for wake-ups. Like the Postgres store, calls are bridged
//! onto a tokio runtime through its [`Handle`].

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use lockstep_events::{Feed, JobNotification, NotifyBus, NotifyError, Subscription, feed};

use super::{DEFAULT_CHANNEL, LISTEN_TICK, decode, encode};

#[derive(Debug, Clone)]
pub struct PgNotifyBus {
    pool: PgPool,
    runtime: Handle,
    channel: String,
}

impl PgNotifyBus {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool,
            runtime,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    #[instrument(skip(self, payload), fields(channel = %self.channel), err)]
    async fn notify(&self, payload: String) -> Result<(), NotifyError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(())
    }
}

impl NotifyBus for PgNotifyBus {
    fn publish(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        self.runtime.block_on(self.notify(encode(notification)?))
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        let (feed, subscription) = feed();
        self.spawn_listener(feed);
        subscription
    }
}

impl PgNotifyBus {
    /// Relay notifications into `feed` until the subscriber goes away or the
    /// connection is lost. The subscriber then sees a closed channel and
    /// keeps polling.
    fn spawn_listener(&self, feed: Feed<JobNotification>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let channel = self.channel.clone();

        self.runtime.spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "postgres listener connection failed");
                    return;
                }
            };
            if let Err(e) = listener.listen(&channel).await {
                warn!(%channel, error = %e, "LISTEN failed");
                return;
            }

            while !feed.is_closed() {
                let message = match timeout(LISTEN_TICK, listener.recv()).await {
                    Err(_elapsed) => continue,
                    Ok(Ok(m)) => m,
                    Ok(Err(e)) => {
                        warn!(error = %e, "postgres listener connection lost");
                        return;
                    }
                };
                if let Some(notification) = decode(message.payload()) {
                    if feed.send(notification).is_err() {
                        break;
                    }
                }
            }
            debug!(%channel, "subscriber gone, listener stopped");
        })
    }
}
