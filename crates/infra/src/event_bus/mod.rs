//! Infrastructure-backed notification buses.
//!
//! The bus abstraction lives in `lockstep-events` as pure mechanics. These
//! wrap real pub/sub transports; both JSON-encode [`JobNotification`]s on a
//! single channel.
//!
//! Listeners block on their transport for at most [`LISTEN_TICK`] at a time
//! and exit once the subscription is dropped, even if the channel stays
//! quiet.

use std::time::Duration;

use tracing::debug;

use lockstep_events::{JobNotification, NotifyError};

pub mod postgres_notify;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use postgres_notify::PgNotifyBus;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubNotifyBus;

/// Channel name used by every backend unless overridden.
pub const DEFAULT_CHANNEL: &str = "lockstep";

/// Longest a listener waits on its transport before checking its subscriber.
pub const LISTEN_TICK: Duration = Duration::from_millis(500);

fn encode(notification: &JobNotification) -> Result<String, NotifyError> {
    serde_json::to_string(notification).map_err(|e| NotifyError::Encode(e.to_string()))
}

/// Malformed payloads are dropped; another publisher may share the channel.
fn decode(payload: &str) -> Option<JobNotification> {
    match serde_json::from_str(payload) {
        Ok(n) => Some(n),
        Err(e) => {
            debug!(error = %e, "ignoring malformed notification");
            None
        }
    }
}
