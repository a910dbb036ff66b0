//! Caller-side polling of one job.
//!
//! A [`PollingSession`] never sleeps and owns no timer. The caller
//! decides when to call [`poll`](PollingSession::poll) (every
//! [`PollPolicy::interval`] by default); each call makes exactly one
//! status request and classifies the answer. Tests drive sessions by
//! calling `poll` in a loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::JobStatusSource;
use crate::clock::elapsed;
use crate::config::PollPolicy;
use crate::error::{PollError, TimeoutCause};
use crate::job::{JobId, JobStatus, Observation, OutstandingJob, ResultRef};

/// Outcome of one [`PollingSession::poll`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// The job is still running. Progress never decreases across the
    /// steps of one session.
    Progress(Observation),
    /// The session is over.
    Finished(Result<ResultRef, PollError>),
}

/// Stops a [`PollingSession`] from another thread or callback.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Ask the session to stop. The job itself keeps running.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observation state for one job.
#[derive(Debug)]
pub struct PollingSession {
    job_id: JobId,
    policy: PollPolicy,
    observations: u32,
    pending_streak: u32,
    last_progress: u8,
    cancelled: CancelHandle,
    resolution: Option<Result<ResultRef, PollError>>,
}

impl PollingSession {
    /// Fresh session for a job just submitted.
    #[must_use]
    pub fn new(job_id: JobId, policy: PollPolicy) -> Self {
        Self {
            job_id,
            policy,
            observations: 0,
            pending_streak: 0,
            last_progress: 0,
            cancelled: CancelHandle(Arc::new(AtomicBool::new(false))),
            resolution: None,
        }
    }

    /// Reattach to a job found outstanding after a restart.
    ///
    /// # Errors
    ///
    /// [`PollError::Timeout`] with [`TimeoutCause::Age`] if the job is
    /// older than [`PollPolicy::max_age`]; no status request is made.
    pub fn resume(
        outstanding: OutstandingJob,
        now: DateTime<Utc>,
        policy: PollPolicy,
    ) -> Result<Self, PollError> {
        let age = elapsed(outstanding.created_at, now);
        if age > policy.max_age {
            info!(
                job_id = %outstanding.job_id,
                age_secs = age.as_secs(),
                "outstanding analysis too old to resume"
            );
            return Err(PollError::Timeout(TimeoutCause::Age));
        }
        debug!(job_id = %outstanding.job_id, progress = outstanding.progress, "resuming analysis");
        let mut session = Self::new(outstanding.job_id, policy);
        session.last_progress = outstanding.progress.min(100);
        Ok(session)
    }

    /// Job being polled.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Limits this session polls under.
    #[must_use]
    pub const fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Status requests made so far.
    #[must_use]
    pub const fn observations(&self) -> u32 {
        self.observations
    }

    /// Highest progress seen.
    #[must_use]
    pub const fn last_progress(&self) -> u8 {
        self.last_progress
    }

    /// The final outcome, once there is one.
    #[must_use]
    pub const fn resolution(&self) -> Option<&Result<ResultRef, PollError>> {
        self.resolution.as_ref()
    }

    /// Whether the session has resolved.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.resolution.is_some()
    }

    /// Stop polling. The next [`poll`](Self::poll) resolves as
    /// [`PollError::Cancelled`] without a request.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Handle that cancels this session from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancelled.clone()
    }

    fn resolve(&mut self, outcome: Result<ResultRef, PollError>) -> PollStep {
        match &outcome {
            Ok(result) => info!(job_id = %self.job_id, %result, "analysis finished"),
            Err(err) => warn!(
                job_id = %self.job_id,
                observations = self.observations,
                error = %err,
                "polling ended without a result"
            ),
        }
        self.resolution = Some(outcome.clone());
        PollStep::Finished(outcome)
    }

    /// Make one status request and classify it.
    ///
    /// Once the session has finished every call returns the same
    /// resolution without touching `source`.
    pub fn poll(&mut self, source: &impl JobStatusSource) -> PollStep {
        if let Some(resolution) = &self.resolution {
            return PollStep::Finished(resolution.clone());
        }
        if self.cancelled.is_cancelled() {
            return self.resolve(Err(PollError::Cancelled));
        }

        let mut observation = match source.job_status(self.job_id) {
            Ok(observation) => observation,
            Err(err) => return self.resolve(Err(PollError::Backend(err))),
        };
        self.observations += 1;

        match observation.status {
            JobStatus::Success => {
                self.last_progress = 100;
                return self.resolve(observation.result_ref.ok_or_else(|| {
                    PollError::Failed("analysis reported success without a result".to_owned())
                }));
            }
            JobStatus::Failure => {
                let cause = observation
                    .error
                    .unwrap_or_else(|| "analysis failed without a reported cause".to_owned());
                return self.resolve(Err(PollError::Failed(cause)));
            }
            JobStatus::Pending if observation.progress == 0 => self.pending_streak += 1,
            JobStatus::Pending | JobStatus::Started => self.pending_streak = 0,
        }

        self.last_progress = self.last_progress.max(observation.progress.min(100));
        observation.progress = self.last_progress;

        if self.pending_streak >= self.policy.stall_limit {
            return self.resolve(Err(PollError::Stalled {
                observations: self.pending_streak,
            }));
        }
        if self.observations >= self.policy.max_observations {
            return self.resolve(Err(PollError::Timeout(TimeoutCause::ObservationCap(
                self.observations,
            ))));
        }
        PollStep::Progress(observation)
    }
}
