//! Job store
//!
//! Job records keyed by job id, plus a fingerprint-keyed result cache.
//! Only the pipeline controller writes; status readers never mutate.

use crate::error::StoreError;
use crate::types::{AnalysisResult, Fingerprint, JobId, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Job record and result cache storage
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a pending record
    async fn create(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Current record
    async fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError>;

    /// Move to `status` and overwrite progress text
    ///
    /// Only non-terminal targets are accepted here; terminal states go through
    /// [`JobStore::set_result`] and [`JobStore::fail`].
    async fn set_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        progress: Option<String>,
    ) -> Result<(), StoreError>;

    /// Store the final result and mark the job complete in one step
    async fn set_result(
        &self,
        job_id: &JobId,
        result: AnalysisResult,
        warning: Option<String>,
    ) -> Result<(), StoreError>;

    /// Mark the job failed with a human-readable cause
    async fn fail(&self, job_id: &JobId, error: String) -> Result<(), StoreError>;

    /// Cached result for a fingerprint
    async fn get_cached(&self, fingerprint: &Fingerprint) -> Option<AnalysisResult>;

    /// Cache a completed result
    async fn put_cached(&self, fingerprint: Fingerprint, result: AnalysisResult, ttl: Duration);
}

#[derive(Debug, Clone)]
struct CachedEntry {
    result: Arc<AnalysisResult>,
    ttl: Duration,
}

/// Each cache entry expires after the TTL it was inserted with
struct PerEntryTtl;

impl Expiry<Fingerprint, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process job store
///
/// Records live in a `DashMap`; every mutation happens under the entry's
/// shard lock, so status, progress and result change atomically.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    jobs: Arc<DashMap<JobId, JobRecord>>,
    cache: Cache<Fingerprint, CachedEntry>,
}

impl InMemoryJobStore {
    /// Create store with max cache capacity
    #[must_use]
    pub fn new(cache_capacity: u64) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            cache: Cache::builder()
                .max_capacity(cache_capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    /// Number of job records
    #[inline]
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Drop every cached result (manual cache clear)
    #[inline]
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }

    fn update<F>(&self, job_id: &JobId, to: JobStatus, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut record = self
            .jobs
            .get_mut(job_id)
            .ok_or(StoreError::NotFound(*job_id))?;
        if !record.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                job: *job_id,
                from: record.status,
                to,
            });
        }
        record.status = to;
        apply(&mut *record);
        Ok(())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job_id: JobId) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.jobs.entry(job_id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(job_id)),
            Entry::Vacant(slot) => {
                slot.insert(JobRecord::pending(job_id));
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        self.jobs
            .get(job_id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::NotFound(*job_id))
    }

    async fn set_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        progress: Option<String>,
    ) -> Result<(), StoreError> {
        if status.is_terminal() {
            return Err(StoreError::PayloadRequired {
                job: *job_id,
                status,
            });
        }
        self.update(job_id, status, |record| record.progress = progress)
    }

    async fn set_result(
        &self,
        job_id: &JobId,
        result: AnalysisResult,
        warning: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(job_id, JobStatus::Complete, |record| {
            record.result = Some(result);
            record.warning = warning;
            record.progress = Some("Analysis complete".to_string());
            record.completed_at = Some(Utc::now());
        })
    }

    async fn fail(&self, job_id: &JobId, error: String) -> Result<(), StoreError> {
        self.update(job_id, JobStatus::Failed, |record| {
            record.error = Some(error);
            record.completed_at = Some(Utc::now());
        })
    }

    async fn get_cached(&self, fingerprint: &Fingerprint) -> Option<AnalysisResult> {
        self.cache
            .get(fingerprint)
            .await
            .map(|entry| entry.result.as_ref().clone())
    }

    async fn put_cached(&self, fingerprint: Fingerprint, result: AnalysisResult, ttl: Duration) {
        let entry = CachedEntry {
            result: Arc::new(result),
            ttl,
        };
        self.cache.insert(fingerprint, entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisRequest, RepositoryStats};

    fn sample_result() -> AnalysisResult {
        let req = AnalysisRequest::new("https://github.com/a/b", "Team", "Proj");
        AnalysisResult::empty(&req, RepositoryStats::default())
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryJobStore::default();
        let id = JobId::new();
        store.create(id).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.error.is_none());

        assert!(matches!(
            store.create(id).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.get(&JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn progress_is_latest_wins() {
        let store = InMemoryJobStore::default();
        let id = JobId::new();
        store.create(id).await.unwrap();

        store
            .set_status(&id, JobStatus::Analyzing, Some("[Iteration 1] listing .".into()))
            .await
            .unwrap();
        store
            .set_status(&id, JobStatus::Analyzing, Some("[Iteration 2] reading file a".into()))
            .await
            .unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.progress.as_deref(), Some("[Iteration 2] reading file a"));
    }

    #[tokio::test]
    async fn transitions_are_monotonic() {
        let store = InMemoryJobStore::default();
        let id = JobId::new();
        store.create(id).await.unwrap();
        store.set_status(&id, JobStatus::Analyzing, None).await.unwrap();
        store.set_result(&id, sample_result(), None).await.unwrap();

        let err = store
            .set_status(&id, JobStatus::Analyzing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let err = store.fail(&id, "late".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Complete);
        assert!(record.result.is_some());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn pending_jobs_cannot_skip_analyzing() {
        let store = InMemoryJobStore::default();
        let id = JobId::new();
        store.create(id).await.unwrap();

        let err = store.set_result(&id, sample_result(), None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Complete, .. }
        ));
        let err = store.fail(&id, "too early".into()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Failed, .. }
        ));

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn terminal_status_requires_payload() {
        let store = InMemoryJobStore::default();
        let id = JobId::new();
        store.create(id).await.unwrap();
        let err = store
            .set_status(&id, JobStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PayloadRequired { .. }));
    }

    #[tokio::test]
    async fn failure_sets_error() {
        let store = InMemoryJobStore::default();
        let id = JobId::new();
        store.create(id).await.unwrap();
        store.set_status(&id, JobStatus::Analyzing, None).await.unwrap();
        store.fail(&id, "repository not found".into()).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("repository not found"));
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn cache_round_trip_and_clear() {
        let store = InMemoryJobStore::default();
        let fp = Fingerprint::compute("https://github.com/a/b", None);
        assert!(store.get_cached(&fp).await.is_none());

        store
            .put_cached(fp.clone(), sample_result(), Duration::from_secs(60))
            .await;
        let cached = store.get_cached(&fp).await.unwrap();
        assert_eq!(cached.project_name, "Proj");

        store.clear_cache();
        assert!(store.get_cached(&fp).await.is_none());
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let store = InMemoryJobStore::default();
        let fp = Fingerprint::compute("https://github.com/a/b", None);
        store
            .put_cached(fp.clone(), sample_result(), Duration::from_millis(50))
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get_cached(&fp).await.is_none());
    }
}
