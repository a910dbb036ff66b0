//! Short-lived cache of job observations.
//!
//! Several pollers watching the same job (two windows, a CLI and a UI)
//! would otherwise each hit the backend every tick. [`ObservationCache`]
//! wraps a [`JobStatusSource`] and serves repeat requests for the same
//! job from memory until the entry is older than the TTL. The backend
//! request is made while holding the map lock, so concurrent misses for
//! one job collapse into a single request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::backend::JobStatusSource;
use crate::clock::{Clock, elapsed};
use crate::config::JobsConfig;
use crate::error::ServiceError;
use crate::job::{JobId, Observation};

#[derive(Debug, Clone)]
struct CachedObservation {
    observation: Observation,
    fetched_at: DateTime<Utc>,
}

/// [`JobStatusSource`] that deduplicates requests within a TTL.
pub struct ObservationCache<S> {
    source: S,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<JobId, CachedObservation>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: JobStatusSource> ObservationCache<S> {
    /// Cache in front of `source` with the TTL and capacity from `config`.
    pub fn new(source: S, clock: Arc<dyn Clock>, config: &JobsConfig) -> Self {
        Self {
            source,
            clock,
            ttl: config.cache_ttl,
            capacity: config.cache_capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The wrapped source.
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Forget the cached observation of `id`.
    pub fn invalidate(&self, id: JobId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Number of cached entries, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests served from memory.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Requests forwarded to the source.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn make_room(&self, entries: &mut HashMap<JobId, CachedObservation>, now: DateTime<Utc>) {
        if entries.len() < self.capacity {
            return;
        }
        entries.retain(|_, entry| elapsed(entry.fetched_at, now) < self.ttl);
        if entries.len() < self.capacity {
            return;
        }
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.fetched_at)
            .map(|(&id, _)| id);
        if let Some(id) = oldest {
            entries.remove(&id);
        }
    }
}

impl<S: JobStatusSource> JobStatusSource for ObservationCache<S> {
    fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(&id)
            && elapsed(entry.fetched_at, now) < self.ttl
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.observation.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(job_id = %id, "observation cache miss");
        let observation = self.source.job_status(id)?;
        entries.remove(&id);
        self.make_room(&mut entries, now);
        entries.insert(
            id,
            CachedObservation {
                observation: observation.clone(),
                fetched_at: now,
            },
        );
        Ok(observation)
    }
}

impl<S> std::fmt::Debug for ObservationCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU8;

    use super::*;
    use crate::clock::ManualClock;
    use crate::job::JobStatus;

    /// Source whose progress advances by one on every request.
    #[derive(Default)]
    struct Counting {
        calls: AtomicU8,
    }

    impl JobStatusSource for Counting {
        fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
            let progress = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Observation {
                job_id: id,
                status: JobStatus::Started,
                progress,
                result_ref: None,
                error: None,
            })
        }
    }

    struct Missing;

    impl JobStatusSource for Missing {
        fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
            Err(ServiceError::UnknownJob(id))
        }
    }

    fn config(capacity: usize) -> JobsConfig {
        JobsConfig {
            cache_ttl: Duration::from_secs(1),
            cache_capacity: capacity,
            ..JobsConfig::default()
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH))
    }

    #[test]
    fn repeat_requests_within_ttl_are_deduplicated() {
        let clock = clock();
        let cache = ObservationCache::new(Counting::default(), clock.clone(), &config(8));
        let id = JobId::new();

        assert_eq!(cache.job_status(id).unwrap().progress, 1);
        clock.advance(Duration::from_millis(500));
        assert_eq!(cache.job_status(id).unwrap().progress, 1);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        clock.advance(Duration::from_millis(500));
        assert_eq!(cache.job_status(id).unwrap().progress, 2);
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn concurrent_pollers_share_one_request() {
        let clock = clock();
        let cache = ObservationCache::new(Counting::default(), clock, &config(8));
        let id = JobId::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| cache.job_status(id).unwrap());
            }
        });
        assert_eq!(cache.source().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_refetch() {
        let cache = ObservationCache::new(Counting::default(), clock(), &config(8));
        let id = JobId::new();
        cache.job_status(id).unwrap();
        cache.invalidate(id);
        assert_eq!(cache.job_status(id).unwrap().progress, 2);
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = ObservationCache::new(Missing, clock(), &config(8));
        let id = JobId::new();
        assert!(cache.job_status(id).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let clock = clock();
        let cache = ObservationCache::new(Counting::default(), clock.clone(), &config(2));
        let first = JobId::new();
        cache.job_status(first).unwrap();
        clock.advance(Duration::from_millis(100));
        cache.job_status(JobId::new()).unwrap();
        clock.advance(Duration::from_millis(100));
        cache.job_status(JobId::new()).unwrap();
        assert_eq!(cache.len(), 2);

        let misses = cache.misses();
        cache.job_status(first).unwrap();
        assert_eq!(cache.misses(), misses + 1);
    }
}
