//! In-memory notification bus for tests/dev.

use std::sync::{Mutex, mpsc};

use tracing::trace;

use crate::bus::{NotifyBus, NotifyError, Subscription};
use crate::notification::JobNotification;

/// In-process pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out; dead subscribers are pruned on publish
/// - Keeps a log of everything published so tests can assert on it
#[derive(Debug, Default)]
pub struct InMemoryNotifyBus {
    subscribers: Mutex<Vec<mpsc::Sender<JobNotification>>>,
    published: Mutex<Vec<JobNotification>>,
}

impl InMemoryNotifyBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification published so far, in publish order.
    pub fn published(&self) -> Vec<JobNotification> {
        self.published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl NotifyBus for InMemoryNotifyBus {
    fn publish(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        self.published
            .lock()
            .map_err(|_| NotifyError::Closed)?
            .push(notification.clone());

        let mut subs = self.subscribers.lock().map_err(|_| NotifyError::Closed)?;
        let before = subs.len();
        subs.retain(|tx| tx.send(notification.clone()).is_ok());
        if subs.len() < before {
            trace!(pruned = before - subs.len(), "dropped closed subscribers");
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives,
        // and the subscriber falls back to polling.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn fans_out_to_every_subscriber() {
        let bus = InMemoryNotifyBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let n = JobNotification::new("default", 1, Utc::now());
        bus.publish(&n).unwrap();

        assert_eq!(a.recv_timeout(Duration::from_secs(1)).unwrap(), n);
        assert_eq!(b.recv_timeout(Duration::from_secs(1)).unwrap(), n);
        assert_eq!(bus.published(), vec![n]);
    }

    #[test]
    fn late_subscribers_miss_earlier_messages() {
        let bus = InMemoryNotifyBus::new();
        bus.publish(&JobNotification::new("default", 1, Utc::now()))
            .unwrap();

        let late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryNotifyBus::new();
        drop(bus.subscribe());

        bus.publish(&JobNotification::new("default", 1, Utc::now()))
            .unwrap();
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
