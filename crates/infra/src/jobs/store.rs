//! Job record storage: the claim/lease protocol.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use lockstep_core::{JobId, LeaseToken, ProcessId};

use super::types::{ClaimQuery, ClaimedJob, JobRecord, Lease};

/// Durable job state plus the cross-process mutual exclusion protocol.
///
/// Implementations must guarantee that at most one caller anywhere holds a
/// given record's lease at a time, and must offer due records in a
/// deterministic order for a fixed snapshot:
/// `(priority per ClaimQuery::order, due time ascending, id ascending)`.
pub trait JobStore: Send + Sync {
    /// Persist one record, returning its identity.
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError>;

    /// Persist many records. Position `i` of the output is `Some(id)` when
    /// input `i` was stored and `None` when it was refused; one refusal never
    /// aborts the rest of the batch.
    fn insert_batch(&self, records: Vec<JobRecord>) -> Result<Vec<Option<JobId>>, JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Lease the first eligible record: unfinished, due at `query.now`,
    /// unleased, on a selected queue, not in `query.skip`.
    ///
    /// Losing a race to another claimer is not an error, just `None`.
    fn claim_next(&self, query: &ClaimQuery) -> Result<Option<ClaimedJob>, JobStoreError>;

    /// Lease a specific unfinished record, whether or not it is due.
    fn acquire(&self, id: JobId) -> Result<Option<ClaimedJob>, JobStoreError>;

    fn is_locked(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Record that the lease holder is about to run the body.
    fn mark_performing(&self, lease: &Lease) -> Result<(), JobStoreError>;

    /// Move the record to its terminal state. Sets `finished_at` exactly once.
    fn mark_finished(&self, lease: &Lease, error: Option<&str>) -> Result<(), JobStoreError>;

    /// Give up the lease. Releasing an already-released lease is a no-op.
    fn release(&self, lease: &Lease) -> Result<(), JobStoreError>;

    /// Delete up to `limit` finished records older than `cutoff`, returning
    /// how many went. Unfinished records are never touched.
    fn delete_finished(
        &self,
        cutoff: DateTime<Utc>,
        include_discarded: bool,
        limit: usize,
    ) -> Result<usize, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// A uniqueness constraint refused the record (cron key + anchor time).
    #[error("duplicate job: {0}")]
    Duplicate(String),
    /// The lease is not (or no longer) the current holder of the record.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<JobId, JobRecord>,
    leases: HashMap<JobId, LeaseToken>,
    cron_index: HashSet<(String, DateTime<Utc>)>,
}

impl Inner {
    fn check_lease(&self, lease: &Lease) -> Result<(), JobStoreError> {
        match self.leases.get(&lease.job_id) {
            Some(token) if *token == lease.token => Ok(()),
            _ => Err(JobStoreError::LeaseLost(lease.job_id)),
        }
    }

    fn lease(&mut self, id: JobId, owner: ProcessId) -> Option<ClaimedJob> {
        let token = LeaseToken::new();
        let record = self.records.get_mut(&id)?;
        record.locked_by = Some(owner);
        self.leases.insert(id, token);
        Some(ClaimedJob {
            lease: Lease {
                job_id: id,
                token,
                owner,
            },
            record: record.clone(),
        })
    }

    fn insert(&mut self, record: JobRecord) -> Result<JobId, JobStoreError> {
        if self.records.contains_key(&record.id) {
            return Err(JobStoreError::Duplicate(record.id.to_string()));
        }
        if let (Some(key), Some(at)) = (&record.cron_key, record.cron_at) {
            if !self.cron_index.insert((key.clone(), at)) {
                return Err(JobStoreError::Duplicate(format!("{key}@{at}")));
            }
        }
        let id = record.id;
        self.records.insert(id, record);
        Ok(id)
    }
}

/// In-memory job store for tests/dev.
///
/// One mutex guards records and leases together, which is what makes a claim
/// atomic here. Leases belong to this store's process identity.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    process_id: ProcessId,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            process_id: ProcessId::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every record, oldest first.
    pub fn all(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = match self.lock() {
            Ok(inner) => inner.records.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    pub fn unfinished_count(&self) -> usize {
        self.all().iter().filter(|r| !r.is_finished()).count()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        self.lock()?.insert(record)
    }

    fn insert_batch(&self, records: Vec<JobRecord>) -> Result<Vec<Option<JobId>>, JobStoreError> {
        let mut inner = self.lock()?;
        Ok(records
            .into_iter()
            .map(|record| inner.insert(record).ok())
            .collect())
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    fn claim_next(&self, query: &ClaimQuery) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut inner = self.lock()?;

        let next = inner
            .records
            .values()
            .filter(|r| {
                r.is_due(query.now)
                    && !inner.leases.contains_key(&r.id)
                    && query.queues.matches(&r.queue_name)
                    && !query.skip.contains(&r.id)
            })
            .min_by(|a, b| {
                query
                    .order
                    .compare(a.priority, b.priority)
                    .then_with(|| a.due_at().cmp(&b.due_at()))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|r| r.id);

        Ok(next.and_then(|id| inner.lease(id, self.process_id)))
    }

    fn acquire(&self, id: JobId) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut inner = self.lock()?;
        let available = match inner.records.get(&id) {
            Some(record) => !record.is_finished() && !inner.leases.contains_key(&id),
            None => return Err(JobStoreError::NotFound(id)),
        };
        Ok(if available {
            inner.lease(id, self.process_id)
        } else {
            None
        })
    }

    fn is_locked(&self, id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.lock()?.leases.contains_key(&id))
    }

    fn mark_performing(&self, lease: &Lease) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        inner.check_lease(lease)?;
        let record = inner
            .records
            .get_mut(&lease.job_id)
            .ok_or(JobStoreError::NotFound(lease.job_id))?;
        record.performed_at = Some(Utc::now());
        record.executions_count += 1;
        Ok(())
    }

    fn mark_finished(&self, lease: &Lease, error: Option<&str>) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        inner.check_lease(lease)?;
        let record = inner
            .records
            .get_mut(&lease.job_id)
            .ok_or(JobStoreError::NotFound(lease.job_id))?;
        if record.finished_at.is_none() {
            record.finished_at = Some(Utc::now());
            record.error = error.map(str::to_string);
        }
        Ok(())
    }

    fn release(&self, lease: &Lease) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        if inner.check_lease(lease).is_ok() {
            inner.leases.remove(&lease.job_id);
            if let Some(record) = inner.records.get_mut(&lease.job_id) {
                record.locked_by = None;
            }
        }
        Ok(())
    }

    fn delete_finished(
        &self,
        cutoff: DateTime<Utc>,
        include_discarded: bool,
        limit: usize,
    ) -> Result<usize, JobStoreError> {
        let mut inner = self.lock()?;
        let doomed: Vec<JobId> = inner
            .records
            .values()
            .filter(|r| {
                r.finished_at.is_some_and(|at| at < cutoff)
                    && (include_discarded || r.error.is_none())
                    && !inner.leases.contains_key(&r.id)
            })
            .map(|r| r.id)
            .take(limit)
            .collect();

        for id in &doomed {
            if let Some(record) = inner.records.remove(id) {
                if let (Some(key), Some(at)) = (record.cron_key, record.cron_at) {
                    inner.cron_index.remove(&(key, at));
                }
            }
        }
        Ok(doomed.len())
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        (**self).insert(record)
    }

    fn insert_batch(&self, records: Vec<JobRecord>) -> Result<Vec<Option<JobId>>, JobStoreError> {
        (**self).insert_batch(records)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id)
    }

    fn claim_next(&self, query: &ClaimQuery) -> Result<Option<ClaimedJob>, JobStoreError> {
        (**self).claim_next(query)
    }

    fn acquire(&self, id: JobId) -> Result<Option<ClaimedJob>, JobStoreError> {
        (**self).acquire(id)
    }

    fn is_locked(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).is_locked(id)
    }

    fn mark_performing(&self, lease: &Lease) -> Result<(), JobStoreError> {
        (**self).mark_performing(lease)
    }

    fn mark_finished(&self, lease: &Lease, error: Option<&str>) -> Result<(), JobStoreError> {
        (**self).mark_finished(lease, error)
    }

    fn release(&self, lease: &Lease) -> Result<(), JobStoreError> {
        (**self).release(lease)
    }

    fn delete_finished(
        &self,
        cutoff: DateTime<Utc>,
        include_discarded: bool,
        limit: usize,
    ) -> Result<usize, JobStoreError> {
        (**self).delete_finished(cutoff, include_discarded, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queues::QueueSelector;
    use crate::jobs::types::{NewJob, PriorityOrder};
    use chrono::Duration;

    fn record(queue: &str, priority: i32) -> JobRecord {
        NewJob::new("ExampleJob", serde_json::json!({}))
            .on_queue(queue)
            .with_priority(priority)
            .to_record(Utc::now())
    }

    fn any_queue() -> ClaimQuery {
        ClaimQuery::new(QueueSelector::All, PriorityOrder::SmallerFirst)
    }

    #[test]
    fn insert_and_claim() {
        let store = InMemoryJobStore::new();
        let id = store.insert(record("default", 0)).unwrap();

        let claimed = store.claim_next(&any_queue()).unwrap().unwrap();
        assert_eq!(claimed.record.id, id);
        assert!(store.is_locked(id).unwrap());

        // Leased records are not offered again.
        assert!(store.claim_next(&any_queue()).unwrap().is_none());

        store.release(&claimed.lease).unwrap();
        assert!(!store.is_locked(id).unwrap());
        assert!(store.claim_next(&any_queue()).unwrap().is_some());
    }

    #[test]
    fn finished_records_are_never_reclaimed() {
        let store = InMemoryJobStore::new();
        let id = store.insert(record("default", 0)).unwrap();

        let claimed = store.claim_next(&any_queue()).unwrap().unwrap();
        store.mark_finished(&claimed.lease, None).unwrap();
        store.release(&claimed.lease).unwrap();

        assert!(store.claim_next(&any_queue()).unwrap().is_none());
        assert!(store.acquire(id).unwrap().is_none());
        assert!(store.get(id).unwrap().unwrap().finished_at.is_some());
    }

    #[test]
    fn finished_at_is_set_exactly_once() {
        let store = InMemoryJobStore::new();
        let id = store.insert(record("default", 0)).unwrap();
        let claimed = store.claim_next(&any_queue()).unwrap().unwrap();

        store.mark_finished(&claimed.lease, Some("boom")).unwrap();
        let first = store.get(id).unwrap().unwrap();
        store.mark_finished(&claimed.lease, None).unwrap();
        let second = store.get(id).unwrap().unwrap();

        assert_eq!(first.finished_at, second.finished_at);
        assert_eq!(second.error.as_deref(), Some("boom"));
    }

    #[test]
    fn future_records_wait_for_their_time() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut future = record("default", 0);
        future.scheduled_at = Some(now + Duration::minutes(1));
        store.insert(future).unwrap();

        assert!(store.claim_next(&any_queue().at(now)).unwrap().is_none());
        assert!(
            store
                .claim_next(&any_queue().at(now + Duration::minutes(2)))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn ordering_is_priority_then_due_time() {
        let store = InMemoryJobStore::new();
        let low = store.insert(record("default", 10)).unwrap();
        let high = store.insert(record("default", -10)).unwrap();

        let first = store.claim_next(&any_queue()).unwrap().unwrap();
        assert_eq!(first.record.id, high);

        let larger_first = ClaimQuery::new(QueueSelector::All, PriorityOrder::LargerFirst);
        store.release(&first.lease).unwrap();
        let first = store.claim_next(&larger_first).unwrap().unwrap();
        assert_eq!(first.record.id, low);
    }

    #[test]
    fn queue_filter_and_skip_list_apply() {
        let store = InMemoryJobStore::new();
        let mice = store.insert(record("mice", 0)).unwrap();
        let elephants = store.insert(record("elephants", 0)).unwrap();

        let only_mice = ClaimQuery::new(QueueSelector::only(["mice"]), PriorityOrder::SmallerFirst);
        assert_eq!(
            store.claim_next(&only_mice.clone().skipping(vec![])).unwrap().unwrap().record.id,
            mice
        );

        let skip_mice = any_queue().skipping(vec![mice]);
        assert_eq!(store.claim_next(&skip_mice).unwrap().unwrap().record.id, elephants);
    }

    #[test]
    fn stale_leases_cannot_finish_or_release() {
        let store = InMemoryJobStore::new();
        let id = store.insert(record("default", 0)).unwrap();

        let first = store.claim_next(&any_queue()).unwrap().unwrap();
        store.release(&first.lease).unwrap();
        let second = store.claim_next(&any_queue()).unwrap().unwrap();

        assert_eq!(
            store.mark_finished(&first.lease, None),
            Err(JobStoreError::LeaseLost(id))
        );
        store.release(&first.lease).unwrap();
        assert!(store.is_locked(id).unwrap(), "stale release must not drop the new lease");
        store.release(&second.lease).unwrap();
    }

    #[test]
    fn cron_key_and_anchor_are_unique() {
        let store = InMemoryJobStore::new();
        let at = Utc::now();
        let job = NewJob::new("ExampleJob", serde_json::json!({})).from_cron("nightly", at);

        store.insert(job.to_record(at)).unwrap();
        assert!(matches!(
            store.insert(job.to_record(at)),
            Err(JobStoreError::Duplicate(_))
        ));
    }

    #[test]
    fn batch_insert_reports_per_position() {
        let store = InMemoryJobStore::new();
        let at = Utc::now();
        let cron = NewJob::new("ExampleJob", serde_json::json!({})).from_cron("nightly", at);

        let ids = store
            .insert_batch(vec![cron.to_record(at), cron.to_record(at), record("default", 0)])
            .unwrap();

        assert!(ids[0].is_some());
        assert!(ids[1].is_none());
        assert!(ids[2].is_some());
        assert_eq!(store.all().len(), 2);
    }

    #[test]
    fn delete_finished_respects_cutoff_and_discard_flag() {
        let store = InMemoryJobStore::new();
        let ok = store.insert(record("default", 0)).unwrap();
        let failed = store.insert(record("default", 0)).unwrap();
        let pending = store.insert(record("default", 0)).unwrap();

        for (id, error) in [(ok, None), (failed, Some("boom"))] {
            let claimed = store.acquire(id).unwrap().unwrap();
            store.mark_finished(&claimed.lease, error).unwrap();
            store.release(&claimed.lease).unwrap();
        }

        let future_cutoff = Utc::now() + Duration::seconds(1);
        assert_eq!(store.delete_finished(Utc::now() - Duration::days(1), true, 100).unwrap(), 0);
        assert_eq!(store.delete_finished(future_cutoff, false, 100).unwrap(), 1);
        assert_eq!(store.delete_finished(future_cutoff, true, 100).unwrap(), 1);

        assert!(store.get(ok).unwrap().is_none());
        assert!(store.get(failed).unwrap().is_none());
        assert!(store.get(pending).unwrap().is_some());
    }
}
