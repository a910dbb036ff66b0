//! Analysis job records and their state machine.
//!
//! ```text
//! Pending --start--> Started
//! Started --progress(p)--> Started
//! Started --succeed(ref)--> Success
//! Started | Pending --fail(err)--> Failure
//! Pending --expire--> Failure("stale")
//! ```
//!
//! `Success` and `Failure` are terminal: every transition attempt on a
//! terminal job returns [`TransitionError::AlreadyTerminal`] and leaves
//! the record untouched.

use std::fmt;
use std::time::Duration;

use atelier_pipeline::BinaryThreshold;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::elapsed;

/// Error string recorded on jobs that expired while still pending.
pub const STALE_ERROR: &str = "stale";

/// Opaque handle to an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to a stored [`AnalysisOutput`](atelier_pipeline::AnalysisOutput).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(Uuid);

impl ResultRef {
    /// Fresh random reference.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResultRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The requester a job or stored result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wrap an opaque owner identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet picked up by the executor.
    Pending,
    /// The pipeline is running.
    Started,
    /// Finished; output stored.
    Success,
    /// Finished with an error.
    Failure,
}

impl JobStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

/// A transition the state machine refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The job already reached `Success` or `Failure`.
    #[error("job is already {0} and cannot change")]
    AlreadyTerminal(JobStatus),

    /// The transition is not defined from the current state.
    #[error("cannot {action} a job that is {from}")]
    Invalid {
        /// Current state.
        from: JobStatus,
        /// Attempted transition.
        action: &'static str,
    },
}

/// Point-in-time view of a job returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Which job.
    pub job_id: JobId,
    /// Current state.
    pub status: JobStatus,
    /// Percent complete, `0..=100`.
    pub progress: u8,
    /// Set only on `Success`.
    pub result_ref: Option<ResultRef>,
    /// Set only on `Failure`.
    pub error: Option<String>,
}

/// Summary of a requester's non-terminal job, used to resume polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingJob {
    /// Which job.
    pub job_id: JobId,
    /// When it was submitted.
    pub created_at: DateTime<Utc>,
    /// Last reported progress.
    pub progress: u8,
}

/// One analysis job.
///
/// Fields are private so the state-machine invariants (result only on
/// success, error only on failure, progress never decreasing) hold for
/// every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    id: JobId,
    owner: OwnerId,
    threshold: BinaryThreshold,
    status: JobStatus,
    progress: u8,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    result: Option<ResultRef>,
    error: Option<String>,
}

impl AnalysisJob {
    /// New `Pending` job created at `now`.
    #[must_use]
    pub fn new(owner: OwnerId, threshold: BinaryThreshold, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            owner,
            threshold,
            status: JobStatus::Pending,
            progress: 0,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        }
    }

    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Requester that submitted the job.
    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Binary threshold the job was submitted with.
    #[must_use]
    pub const fn threshold(&self) -> BinaryThreshold {
        self.threshold
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> JobStatus {
        self.status
    }

    /// Completion percentage, 0..=100.
    #[must_use]
    pub const fn progress(&self) -> u8 {
        self.progress
    }

    /// Submission time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last transition or progress report.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Stored output, set once the job succeeds.
    #[must_use]
    pub const fn result(&self) -> Option<ResultRef> {
        self.result
    }

    /// Failure cause, set once the job fails.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Time since submission.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.created_at, now)
    }

    fn guard(&self, action: &'static str, allowed: &[JobStatus]) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                from: self.status,
                action,
            })
        }
    }

    /// `Pending -> Started`.
    ///
    /// # Errors
    ///
    /// Fails unless the job is `Pending`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard("start", &[JobStatus::Pending])?;
        self.status = JobStatus::Started;
        self.updated_at = now;
        Ok(())
    }

    /// Record progress while `Started`.
    ///
    /// Values above 100 are clamped. A value below the current progress
    /// is ignored and `Ok(false)` is returned; `Ok(true)` means the
    /// record changed.
    ///
    /// # Errors
    ///
    /// Fails unless the job is `Started`.
    pub fn report_progress(&mut self, progress: u8, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        self.guard("report progress on", &[JobStatus::Started])?;
        let progress = progress.min(100);
        if progress <= self.progress {
            return Ok(false);
        }
        self.progress = progress;
        self.updated_at = now;
        Ok(true)
    }

    /// `Started -> Success`, attaching the stored output.
    ///
    /// # Errors
    ///
    /// Fails unless the job is `Started`.
    pub fn succeed(&mut self, result: ResultRef, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard("complete", &[JobStatus::Started])?;
        self.status = JobStatus::Success;
        self.progress = 100;
        self.result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    /// `Pending | Started -> Failure`.
    ///
    /// # Errors
    ///
    /// Fails if the job is already terminal.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard("fail", &[JobStatus::Pending, JobStatus::Started])?;
        self.status = JobStatus::Failure;
        self.error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// Fail a job that has sat in `Pending` for longer than
    /// `stale_after`. Returns whether the job expired.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.status != JobStatus::Pending || self.age(now) <= stale_after {
            return false;
        }
        self.fail(STALE_ERROR, now).is_ok()
    }

    /// Current view for pollers.
    #[must_use]
    pub fn observe(&self) -> Observation {
        Observation {
            job_id: self.id,
            status: self.status,
            progress: self.progress,
            result_ref: self.result,
            error: self.error.clone(),
        }
    }

    /// Summary for resume, or `None` once terminal.
    #[must_use]
    pub fn outstanding(&self) -> Option<OutstandingJob> {
        (!self.status.is_terminal()).then_some(OutstandingJob {
            job_id: self.id,
            created_at: self.created_at,
            progress: self.progress,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn job() -> AnalysisJob {
        AnalysisJob::new(OwnerId::new("painter"), BinaryThreshold::L140, t0())
    }

    #[test]
    fn happy_path() {
        let mut job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        job.start(t0()).unwrap();
        assert!(job.report_progress(40, t0()).unwrap());
        let result = ResultRef::new();
        job.succeed(result, t0()).unwrap();

        let observation = job.observe();
        assert_eq!(observation.status, JobStatus::Success);
        assert_eq!(observation.progress, 100);
        assert_eq!(observation.result_ref, Some(result));
        assert_eq!(observation.error, None);
        assert!(job.outstanding().is_none());
    }

    #[test]
    fn progress_never_regresses() {
        let mut job = job();
        job.start(t0()).unwrap();
        job.report_progress(60, t0()).unwrap();
        assert!(!job.report_progress(30, t0()).unwrap());
        assert_eq!(job.progress(), 60);
        job.report_progress(250, t0()).unwrap();
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn progress_requires_started() {
        let mut job = job();
        assert_eq!(
            job.report_progress(10, t0()),
            Err(TransitionError::Invalid {
                from: JobStatus::Pending,
                action: "report progress on",
            })
        );
        assert!(job.succeed(ResultRef::new(), t0()).is_err());
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut failed = job();
        failed.fail("boom", t0()).unwrap();
        let snapshot = failed.clone();
        let later = t0() + TimeDelta::seconds(5);

        assert_eq!(
            failed.start(later),
            Err(TransitionError::AlreadyTerminal(JobStatus::Failure))
        );
        assert!(failed.report_progress(50, later).is_err());
        assert!(failed.succeed(ResultRef::new(), later).is_err());
        assert!(failed.fail("again", later).is_err());
        assert!(!failed.expire_if_stale(later + TimeDelta::days(1), Duration::ZERO));
        assert_eq!(failed, snapshot);

        let mut succeeded = job();
        succeeded.start(t0()).unwrap();
        succeeded.succeed(ResultRef::new(), t0()).unwrap();
        assert_eq!(
            succeeded.fail("late", later),
            Err(TransitionError::AlreadyTerminal(JobStatus::Success))
        );
        assert_eq!(succeeded.error(), None);
    }

    #[test]
    fn pending_job_expires_after_threshold() {
        let mut job = job();
        let limit = Duration::from_secs(1800);
        assert!(!job.expire_if_stale(t0() + TimeDelta::minutes(30), limit));
        assert!(job.expire_if_stale(t0() + TimeDelta::minutes(31), limit));
        assert_eq!(job.status(), JobStatus::Failure);
        assert_eq!(job.error(), Some(STALE_ERROR));
    }

    #[test]
    fn started_job_does_not_expire() {
        let mut job = job();
        job.start(t0()).unwrap();
        assert!(!job.expire_if_stale(t0() + TimeDelta::hours(2), Duration::from_secs(1800)));
        assert_eq!(job.status(), JobStatus::Started);
    }

    #[test]
    fn outstanding_reports_progress() {
        let mut job = job();
        job.start(t0()).unwrap();
        job.report_progress(25, t0()).unwrap();
        let outstanding = job.outstanding().unwrap();
        assert_eq!(outstanding.job_id, job.id());
        assert_eq!(outstanding.progress, 25);
        assert_eq!(outstanding.created_at, t0());
    }

    #[test]
    fn observation_serializes_snake_case_status() {
        let json = serde_json::to_value(job().observe()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0);
    }
}
