//! Change-notification publishing/subscription abstraction (mechanics only).
//!
//! A notification says "new or due work may exist on this queue". It is a
//! liveness hint and nothing more:
//!
//! - **Best-effort**: messages may be dropped (subscriber not yet listening,
//!   transport hiccup). Workers poll on an interval regardless.
//! - **No persistence**: the job store is the source of truth; the bus only
//!   shortens the time between an enqueue and a claim.
//! - **Broadcast**: every subscriber receives every message it manages to see.
//!
//! Because delivery is never a correctness dependency, `publish` failures are
//! reported to the caller so they can be logged, and then ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, SendError, Sender, TryRecvError};
use std::time::Duration;

use thiserror::Error;

use crate::notification::JobNotification;

/// A subscription to the notification stream.
///
/// Designed for single-threaded consumption: one listener thread per
/// subscription, which fans wake-ups out to workers through a
/// [`Doorbell`](crate::Doorbell).
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(notification) => doorbell.ring(),
///         Err(RecvTimeoutError::Timeout) => continue,      // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,    // bus closed
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    closed: Arc<AtomicBool>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Sending half of a [`Subscription`], held by a transport listener.
///
/// A send fails once the subscriber is gone, but a listener on a quiet
/// channel never sends; it checks [`Feed::is_closed`] between waits instead.
#[derive(Debug)]
pub struct Feed<M> {
    sender: Sender<M>,
    closed: Arc<AtomicBool>,
}

impl<M> Feed<M> {
    pub fn send(&self, message: M) -> Result<(), SendError<M>> {
        self.sender.send(message)
    }

    /// True once the matching [`Subscription`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A connected feed and subscription.
pub fn feed<M>() -> (Feed<M>, Subscription<M>) {
    let (sender, receiver) = mpsc::channel();
    let subscription = Subscription::new(receiver);
    let feed = Feed {
        sender,
        closed: subscription.closed.clone(),
    };
    (feed, subscription)
}

/// Failure to publish a notification. Never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// The transport refused or dropped the message.
    #[error("notification transport error: {0}")]
    Transport(String),
    /// The payload could not be encoded for the transport.
    #[error("notification encoding error: {0}")]
    Encode(String),
    /// The bus was shut down or its internal state is unusable.
    #[error("notification bus closed")]
    Closed,
}

/// Broadcast channel carrying [`JobNotification`]s between processes (or
/// threads, for the in-memory implementation).
///
/// Implementations wrap an external pub/sub facility: Postgres
/// `LISTEN/NOTIFY`, Redis pub/sub, or an in-process fan-out for tests.
pub trait NotifyBus: Send + Sync {
    /// Publish a notification to every current subscriber.
    fn publish(&self, notification: &JobNotification) -> Result<(), NotifyError>;

    /// Open a new subscription. Messages published before this call are not
    /// replayed.
    fn subscribe(&self) -> Subscription<JobNotification>;
}

impl<B> NotifyBus for Arc<B>
where
    B: NotifyBus + ?Sized,
{
    fn publish(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        (**self).publish(notification)
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        (**self).subscribe()
    }
}

/// A bus that drops everything. Used when the embedding process has no
/// notifier; workers then rely on polling alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBus;

impl NotifyBus for NullBus {
    fn publish(&self, _notification: &JobNotification) -> Result<(), NotifyError> {
        Ok(())
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        // The sender is dropped immediately, so the subscriber sees a closed
        // channel and its listener loop exits.
        let (_tx, rx) = std::sync::mpsc::channel();
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_sees_a_dropped_subscription_without_sending() {
        let (feed, subscription) = feed::<u32>();
        feed.send(1).unwrap();
        assert_eq!(subscription.recv().unwrap(), 1);
        assert!(!feed.is_closed());

        drop(subscription);
        assert!(feed.is_closed());
        assert!(feed.send(2).is_err());
    }

    #[test]
    fn null_bus_subscription_is_already_disconnected() {
        let subscription = NullBus.subscribe();
        assert!(matches!(
            subscription.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }
}
