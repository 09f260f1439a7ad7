use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of a change notification.
///
/// Emitted once per distinct queue per enqueue call, aggregating how many
/// records were persisted and the earliest time any of them becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub queue_name: String,
    pub count: u64,
    pub scheduled_at: DateTime<Utc>,
}

impl JobNotification {
    pub fn new(queue_name: impl Into<String>, count: u64, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            queue_name: queue_name.into(),
            count,
            scheduled_at,
        }
    }

    /// True when the announced work is already due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Aggregate `(queue, scheduled_at)` pairs into one notification per queue.
    ///
    /// Output order follows the first appearance of each queue in the input,
    /// so the result is deterministic for a given batch.
    pub fn aggregate<'a, I>(items: I) -> Vec<JobNotification>
    where
        I: IntoIterator<Item = (&'a str, DateTime<Utc>)>,
    {
        let mut out: Vec<JobNotification> = Vec::new();
        for (queue, at) in items {
            match out.iter_mut().find(|n| n.queue_name == queue) {
                Some(n) => {
                    n.count += 1;
                    if at < n.scheduled_at {
                        n.scheduled_at = at;
                    }
                }
                None => out.push(JobNotification::new(queue, 1, at)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn aggregates_per_queue_with_earliest_time() {
        let now = Utc::now();
        let later = now + Duration::minutes(10);

        let out = JobNotification::aggregate([
            ("default", later),
            ("mice", now),
            ("default", now),
        ]);

        assert_eq!(
            out,
            vec![
                JobNotification::new("default", 2, now),
                JobNotification::new("mice", 1, now),
            ]
        );
    }

    #[test]
    fn empty_batch_emits_nothing() {
        assert!(JobNotification::aggregate(std::iter::empty()).is_empty());
    }

    #[test]
    fn json_shape_is_flat() {
        let at = Utc::now();
        let value = serde_json::to_value(JobNotification::new("default", 1, at)).unwrap();
        assert_eq!(value["queue_name"], "default");
        assert_eq!(value["count"], 1);
        assert!(value["scheduled_at"].is_string());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: aggregation never loses or invents records, and
            /// yields exactly one notification per distinct queue.
            #[test]
            fn counts_add_up(queues in prop::collection::vec("[a-c]", 0..30)) {
                let now = Utc::now();
                let out = JobNotification::aggregate(queues.iter().map(|q| (q.as_str(), now)));

                let total: u64 = out.iter().map(|n| n.count).sum();
                prop_assert_eq!(total, queues.len() as u64);

                let mut distinct = queues.clone();
                distinct.sort();
                distinct.dedup();
                prop_assert_eq!(out.len(), distinct.len());
            }
        }
    }
}
