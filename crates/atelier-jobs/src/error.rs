//! Service-side and client-side error types.

use crate::job::{JobId, ResultRef, TransitionError};
use crate::store::StoreError;

/// Why a submission conflicts with existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The requester already has a job in flight.
    OutstandingJob(JobId),
    /// The requester already has a stored output.
    RetainedOutput(ResultRef),
}

/// Errors returned by [`AnalysisService`](crate::AnalysisService).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Only one outstanding job and one retained output per requester.
    #[error("{}", conflict_message(.0))]
    Conflict(ConflictReason),

    /// The quota gate refused the submission.
    #[error("analysis quota exhausted")]
    QuotaExhausted,

    /// The submitted image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// An integer that is not one of the threshold presets.
    #[error("threshold {0} is not one of the presets 200, 170, 140, 110, 80, 50")]
    InvalidThreshold(u32),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("unknown result {0}")]
    UnknownResult(ResultRef),

    /// The result store failed.
    #[error("result store: {0}")]
    Store(#[from] StoreError),

    /// The executor could not be started for an accepted job.
    #[error("could not start analysis worker: {0}")]
    Spawn(String),

    /// An internal state-machine violation.
    #[error("job transition rejected: {0}")]
    Transition(#[from] TransitionError),
}

fn conflict_message(reason: &ConflictReason) -> String {
    match reason {
        ConflictReason::OutstandingJob(id) => {
            format!("an analysis is already running (job {id}); wait for it to finish")
        }
        ConflictReason::RetainedOutput(result) => {
            format!("an analysis result already exists ({result}); delete it before starting another")
        }
    }
}

/// Why a polling session timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// The observation cap was reached without a terminal state.
    ObservationCap(u32),
    /// The outstanding job was already too old to resume.
    Age,
}

/// Client-side classification of how a polling session ended without
/// a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The job is probably still running but polling gave up.
    #[error("{}", timeout_message(.0))]
    Timeout(TimeoutCause),

    /// The job never left `Pending` at progress 0.
    #[error("analysis did not start after {observations} checks")]
    Stalled {
        /// Consecutive pending observations seen.
        observations: u32,
    },

    /// The job reached `Failure`; carries the recorded cause verbatim.
    #[error("analysis failed: {0}")]
    Failed(String),

    /// The caller cancelled the session.
    #[error("polling cancelled")]
    Cancelled,

    /// The backend rejected a request.
    #[error(transparent)]
    Backend(#[from] ServiceError),
}

fn timeout_message(cause: &TimeoutCause) -> String {
    match cause {
        TimeoutCause::ObservationCap(n) => format!("analysis still not finished after {n} checks"),
        TimeoutCause::Age => "outstanding analysis is too old to resume".to_owned(),
    }
}

impl PollError {
    /// User-facing guidance for this outcome.
    #[must_use]
    pub const fn remediation(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "The analysis is likely still running; try again later.",
            Self::Stalled { .. } => {
                "The analysis never started; the analysis worker may be down. Check backend health."
            }
            Self::Failed(_) => "The analysis failed; try a different image or threshold.",
            Self::Cancelled => "Polling was cancelled; the analysis continues in the background.",
            Self::Backend(ServiceError::Conflict(_)) => {
                "Delete the existing analysis result before starting a new one."
            }
            Self::Backend(ServiceError::QuotaExhausted) => "No analyses remaining in your quota.",
            Self::Backend(_) => "The analysis service rejected the request.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_stall_guidance_differ() {
        let timeout = PollError::Timeout(TimeoutCause::ObservationCap(180));
        let stalled = PollError::Stalled { observations: 30 };
        assert_ne!(timeout.remediation(), stalled.remediation());
        assert!(timeout.remediation().contains("try again later"));
        assert!(stalled.remediation().contains("worker may be down"));
    }

    #[test]
    fn conflict_message_asks_for_deletion() {
        let err = ServiceError::Conflict(ConflictReason::RetainedOutput(ResultRef::new()));
        assert!(err.to_string().contains("delete it"));
    }

    #[test]
    fn failure_cause_is_verbatim() {
        let err = PollError::Failed("stage 'clusters' failed: stage panicked".to_owned());
        assert_eq!(
            err.to_string(),
            "analysis failed: stage 'clusters' failed: stage panicked"
        );
    }
}
