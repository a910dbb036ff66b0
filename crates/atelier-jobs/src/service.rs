//! Job orchestration: submission, execution, and lookup.
//!
//! [`AnalysisService`] owns the job table. Submission validates the
//! single-slot invariant synchronously and hands execution to a
//! [`Spawner`]; the spawned task is the only writer of job progress and
//! terminal state.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use atelier_pipeline::pipeline::{STAGE_COUNT, panic_message};
use atelier_pipeline::{AnalysisOutput, BinaryThreshold, PipelineError, RgbImage, StageId};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, elapsed};
use crate::config::JobsConfig;
use crate::error::{ConflictReason, ServiceError};
use crate::executor::Spawner;
use crate::job::{AnalysisJob, JobId, Observation, OutstandingJob, OwnerId, ResultRef, TransitionError};
use crate::store::{InMemoryResultStore, Quota, QuotaGate, ResultStore, StoreError, Unlimited};

/// Progress reported once the input has been decoded.
pub const PROGRESS_DECODED: u8 = 10;

/// Failure cause prefix for a job whose worker panicked.
pub const WORKER_PANICKED: &str = "analysis worker panicked";

/// Progress share spread evenly over the pipeline stages.
const PROGRESS_STAGES: usize = 80;

/// Progress after `done` of the stages have finished.
#[allow(clippy::cast_possible_truncation)]
const fn stage_progress(done: usize) -> u8 {
    let done = if done > STAGE_COUNT { STAGE_COUNT } else { done };
    PROGRESS_DECODED + (done * PROGRESS_STAGES / STAGE_COUNT) as u8
}

/// Runs every stage on a decoded image, reporting each finished stage.
pub type PipelineFn = fn(
    &RgbImage,
    BinaryThreshold,
    &(dyn Fn(StageId) + Sync),
) -> Result<AnalysisOutput, PipelineError>;

struct Inner {
    jobs: Mutex<HashMap<JobId, AnalysisJob>>,
    store: Arc<dyn ResultStore>,
    quota: Arc<dyn QuotaGate>,
    clock: Arc<dyn Clock>,
    config: JobsConfig,
}

/// Accepts analysis submissions and runs them through `S`.
pub struct AnalysisService<S> {
    inner: Arc<Inner>,
    spawner: S,
    pipeline: PipelineFn,
}

impl<S: Spawner> AnalysisService<S> {
    /// Service over explicit collaborators.
    pub fn new(
        spawner: S,
        store: Arc<dyn ResultStore>,
        quota: Arc<dyn QuotaGate>,
        clock: Arc<dyn Clock>,
        config: JobsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                store,
                quota,
                clock,
                config,
            }),
            spawner,
            pipeline: atelier_pipeline::run_with_progress,
        }
    }

    /// Service with an in-memory store, no quota, and the system clock.
    pub fn in_memory(spawner: S, config: JobsConfig) -> Self {
        Self::new(
            spawner,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(Unlimited),
            Arc::new(SystemClock),
            config,
        )
    }

    /// Replace the stage runner used by jobs submitted from now on.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineFn) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// The executor jobs are handed to.
    #[must_use]
    pub const fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Service configuration.
    #[must_use]
    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }

    /// Current time according to the service clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Accept `image_bytes` for analysis on behalf of `owner`.
    ///
    /// Returns as soon as the job is recorded and handed to the spawner.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::EmptyInput`] for empty bytes
    /// - [`ServiceError::Conflict`] if the owner has an outstanding job or
    ///   a stored result
    /// - [`ServiceError::QuotaExhausted`] if the quota gate refuses
    /// - [`ServiceError::Spawn`] if the executor could not be started; the
    ///   job is recorded as failed and the quota unit is refunded
    pub fn submit(
        &self,
        owner: &OwnerId,
        image_bytes: Vec<u8>,
        threshold: BinaryThreshold,
    ) -> Result<JobId, ServiceError> {
        if image_bytes.is_empty() {
            return Err(ServiceError::EmptyInput);
        }

        let id = {
            let now = self.now();
            let mut jobs = self.inner.lock_jobs();
            self.inner.expire_stale_locked(&mut jobs, now);

            if let Some(job) = jobs
                .values()
                .find(|job| job.owner() == owner && !job.status().is_terminal())
            {
                return Err(ServiceError::Conflict(ConflictReason::OutstandingJob(job.id())));
            }
            if let Some(result) = self.inner.store.find(owner) {
                return Err(ServiceError::Conflict(ConflictReason::RetainedOutput(result)));
            }
            if !self.inner.quota.try_consume(owner) {
                return Err(ServiceError::QuotaExhausted);
            }

            let job = AnalysisJob::new(owner.clone(), threshold, now);
            let id = job.id();
            jobs.insert(id, job);
            id
        };
        info!(job_id = %id, %owner, %threshold, bytes = image_bytes.len(), "analysis submitted");

        let inner = Arc::clone(&self.inner);
        let pipeline = self.pipeline;
        let spawned = self.spawner.spawn(Box::new(move || {
            inner.execute(id, &image_bytes, threshold, pipeline);
        }));
        if let Err(err) = spawned {
            warn!(job_id = %id, error = %err, "could not start analysis worker");
            self.inner.quota.refund(owner);
            let message = format!("could not start analysis worker: {err}");
            if let Err(fail_err) = self.inner.update(id, |job, now| job.fail(message, now)) {
                warn!(job_id = %id, error = %fail_err, "could not record analysis outcome");
            }
            return Err(ServiceError::Spawn(err.to_string()));
        }
        Ok(id)
    }

    /// Like [`submit`](Self::submit), taking the threshold as a raw level.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidThreshold`] if `level` is not a preset, plus
    /// everything [`submit`](Self::submit) returns.
    pub fn submit_level(
        &self,
        owner: &OwnerId,
        image_bytes: Vec<u8>,
        level: u32,
    ) -> Result<JobId, ServiceError> {
        let threshold =
            BinaryThreshold::try_from(level).map_err(|_| ServiceError::InvalidThreshold(level))?;
        self.submit(owner, image_bytes, threshold)
    }

    /// Current observation of a job.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownJob`] if the id was never issued or has been
    /// pruned.
    pub fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
        self.inner
            .lock_jobs()
            .get(&id)
            .map(AnalysisJob::observe)
            .ok_or(ServiceError::UnknownJob(id))
    }

    /// Snapshot of the full job record.
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<AnalysisJob> {
        self.inner.lock_jobs().get(&id).cloned()
    }

    /// The owner's non-terminal job, if any. Reported as-is; deciding
    /// whether it is too old to resume is up to the caller.
    #[must_use]
    pub fn outstanding_job(&self, owner: &OwnerId) -> Option<OutstandingJob> {
        self.inner
            .lock_jobs()
            .values()
            .filter(|job| job.owner() == owner)
            .find_map(AnalysisJob::outstanding)
    }

    /// Load a stored output.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownResult`] for unknown references.
    pub fn fetch_result(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, ServiceError> {
        self.inner.store.get(result).map_err(|err| match err {
            StoreError::NotFound(r) => ServiceError::UnknownResult(r),
            other => ServiceError::Store(other),
        })
    }

    /// Delete a stored output, freeing its owner's slot.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownResult`] for unknown references.
    pub fn delete_result(&self, result: ResultRef) -> Result<(), ServiceError> {
        self.inner.store.delete(result).map_err(|err| match err {
            StoreError::NotFound(r) => ServiceError::UnknownResult(r),
            other => ServiceError::Store(other),
        })?;
        info!(%result, "analysis result deleted");
        Ok(())
    }

    /// The owner's remaining quota.
    #[must_use]
    pub fn check_quota(&self, owner: &OwnerId) -> Quota {
        self.inner.quota.check(owner)
    }

    /// Fail every `Pending` job older than the configured stale age.
    /// Returns the ids that expired.
    pub fn expire_stale(&self) -> Vec<JobId> {
        let now = self.now();
        let mut jobs = self.inner.lock_jobs();
        self.inner.expire_stale_locked(&mut jobs, now)
    }

    /// Expire stale jobs, then drop terminal jobs whose last update is
    /// older than the retention window. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let now = self.now();
        let retention = self.inner.config.retention;
        let mut jobs = self.inner.lock_jobs();
        self.inner.expire_stale_locked(&mut jobs, now);
        let before = jobs.len();
        jobs.retain(|_, job| {
            !job.status().is_terminal() || elapsed(job.updated_at(), now) <= retention
        });
        let pruned = before - jobs.len();
        if pruned > 0 {
            info!(pruned, remaining = jobs.len(), "pruned finished jobs");
        }
        pruned
    }
}

impl<S> std::fmt::Debug for AnalysisService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisService")
            .field("jobs", &self.inner.lock_jobs().len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, AnalysisJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire_stale_locked(
        &self,
        jobs: &mut HashMap<JobId, AnalysisJob>,
        now: DateTime<Utc>,
    ) -> Vec<JobId> {
        let expired: Vec<JobId> = jobs
            .values_mut()
            .filter_map(|job| {
                job.expire_if_stale(now, self.config.stale_after)
                    .then_some(job.id())
            })
            .collect();
        for id in &expired {
            warn!(job_id = %id, "pending analysis expired as stale");
        }
        expired
    }

    /// Apply one state-machine transition to a recorded job.
    fn update<T>(
        &self,
        id: JobId,
        transition: impl FnOnce(&mut AnalysisJob, DateTime<Utc>) -> Result<T, TransitionError>,
    ) -> Result<T, ServiceError> {
        let now = self.clock.now();
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id).ok_or(ServiceError::UnknownJob(id))?;
        Ok(transition(job, now)?)
    }

    /// Body of a spawned job. A panic anywhere past `start` still ends
    /// the job in `Failure`.
    fn execute(
        &self,
        id: JobId,
        image_bytes: &[u8],
        threshold: BinaryThreshold,
        pipeline: PipelineFn,
    ) {
        if let Err(err) = self.update(id, |job, now| job.start(now)) {
            warn!(job_id = %id, error = %err, "analysis not started");
            return;
        }
        debug!(job_id = %id, "analysis started");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.analyze(id, image_bytes, threshold, pipeline)
                .map_err(|err| err.to_string())
                .and_then(|output| self.persist(id, output).map_err(|err| err.to_string()))
        }))
        .unwrap_or_else(|payload| {
            Err(format!(
                "{WORKER_PANICKED}: {}",
                panic_message(payload.as_ref())
            ))
        });

        let recorded = match outcome {
            Ok(result) => self
                .update(id, |job, now| job.succeed(result, now))
                .map(|()| info!(job_id = %id, %result, "analysis succeeded")),
            Err(cause) => {
                warn!(job_id = %id, %cause, "analysis failed");
                self.update(id, |job, now| job.fail(cause, now))
            }
        };
        if let Err(err) = recorded {
            warn!(job_id = %id, error = %err, "could not record analysis outcome");
        }
    }

    fn analyze(
        &self,
        id: JobId,
        image_bytes: &[u8],
        threshold: BinaryThreshold,
        pipeline: PipelineFn,
    ) -> Result<AnalysisOutput, PipelineError> {
        let image = atelier_pipeline::decode::decode(image_bytes)?;
        self.report(id, PROGRESS_DECODED);

        let done = AtomicUsize::new(0);
        pipeline(&image, threshold, &|stage: StageId| {
            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(job_id = %id, stage = stage.name(), finished, "stage done");
            self.report(id, stage_progress(finished));
        })
    }

    fn report(&self, id: JobId, progress: u8) {
        if let Err(err) = self.update(id, |job, now| job.report_progress(progress, now)) {
            debug!(job_id = %id, progress, error = %err, "progress not recorded");
        }
    }

    fn persist(&self, id: JobId, output: AnalysisOutput) -> Result<ResultRef, ServiceError> {
        let owner = self
            .lock_jobs()
            .get(&id)
            .map(|job| job.owner().clone())
            .ok_or(ServiceError::UnknownJob(id))?;
        Ok(self.store.put(&owner, output)?)
    }
}
