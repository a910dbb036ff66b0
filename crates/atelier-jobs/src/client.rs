//! Blocking client driver for CLIs and tools.
//!
//! [`AnalysisClient`] strings the backend calls together in the order a
//! front end makes them: look for an outstanding job to resume, check
//! quota, submit, poll until finished, and fetch the output.

use std::sync::Arc;
use std::time::Duration;

use atelier_pipeline::{AnalysisOutput, BinaryThreshold};
use tracing::info;

use crate::backend::{AnalysisBackend, JobStatusSource};
use crate::clock::Clock;
use crate::config::PollPolicy;
use crate::error::{PollError, ServiceError};
use crate::job::{Observation, OwnerId, ResultRef};
use crate::polling::{PollStep, PollingSession};

/// How [`AnalysisClient::begin`] obtained its session.
#[derive(Debug)]
pub enum Begin {
    /// Reattached to a job that was already running.
    Resumed(PollingSession),
    /// Submitted a new job.
    Submitted(PollingSession),
}

impl Begin {
    /// The session, however it was obtained.
    #[must_use]
    pub fn into_session(self) -> PollingSession {
        match self {
            Self::Resumed(session) | Self::Submitted(session) => session,
        }
    }
}

/// Client bound to one owner.
pub struct AnalysisClient<B> {
    backend: B,
    owner: OwnerId,
    policy: PollPolicy,
    clock: Arc<dyn Clock>,
}

impl<B: AnalysisBackend> AnalysisClient<B> {
    /// Client acting for `owner` against `backend`.
    pub fn new(backend: B, owner: OwnerId, policy: PollPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            owner,
            policy,
            clock,
        }
    }

    /// Backend requests go to.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Owner this client acts for.
    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Resume the owner's outstanding job if there is one, otherwise
    /// submit `image_bytes`.
    ///
    /// # Errors
    ///
    /// - [`PollError::Timeout`] if an outstanding job exists but is too
    ///   old to resume
    /// - [`PollError::Backend`] with [`ServiceError::QuotaExhausted`] when
    ///   the quota check fails, or any submission error
    pub fn begin(&self, image_bytes: Vec<u8>, threshold: BinaryThreshold) -> Result<Begin, PollError> {
        if let Some(outstanding) = self.backend.outstanding_job(&self.owner)? {
            let session = PollingSession::resume(outstanding, self.clock.now(), self.policy)?;
            info!(job_id = %session.job_id(), owner = %self.owner, "resumed outstanding analysis");
            return Ok(Begin::Resumed(session));
        }

        let quota = self.backend.check_quota(&self.owner)?;
        if !quota.allows_submission() {
            return Err(PollError::Backend(ServiceError::QuotaExhausted));
        }

        let job_id = self
            .backend
            .submit_analysis(&self.owner, image_bytes, threshold)?;
        Ok(Begin::Submitted(PollingSession::new(job_id, self.policy)))
    }

    /// Poll the backend until `session` finishes, then fetch the output.
    ///
    /// `sleep` is called with the poll interval between requests and
    /// `on_progress` with every non-final observation.
    ///
    /// # Errors
    ///
    /// The session's [`PollError`], or [`PollError::Backend`] if the
    /// output cannot be fetched.
    pub fn drive(
        &self,
        session: &mut PollingSession,
        sleep: impl FnMut(Duration),
        on_progress: impl FnMut(&Observation),
    ) -> Result<Arc<AnalysisOutput>, PollError> {
        self.drive_with(&self.backend, session, sleep, on_progress)
    }

    /// Like [`drive`](Self::drive) but polling through `source`, such as
    /// an [`ObservationCache`](crate::ObservationCache) shared with other
    /// pollers.
    ///
    /// # Errors
    ///
    /// See [`drive`](Self::drive).
    pub fn drive_with(
        &self,
        source: &impl JobStatusSource,
        session: &mut PollingSession,
        mut sleep: impl FnMut(Duration),
        mut on_progress: impl FnMut(&Observation),
    ) -> Result<Arc<AnalysisOutput>, PollError> {
        let interval = session.policy().interval;
        loop {
            match session.poll(source) {
                PollStep::Progress(observation) => {
                    on_progress(&observation);
                    sleep(interval);
                }
                PollStep::Finished(outcome) => {
                    return Ok(self.backend.fetch_result(outcome?)?);
                }
            }
        }
    }

    /// Delete a fetched output so the owner can submit again.
    ///
    /// # Errors
    ///
    /// [`PollError::Backend`] if the backend rejects the deletion.
    pub fn discard(&self, result: ResultRef) -> Result<(), PollError> {
        Ok(self.backend.delete_result(result)?)
    }

    /// The owner's stored output, if any, found through the job that
    /// produced it.
    ///
    /// # Errors
    ///
    /// [`PollError::Backend`] if the status request fails.
    pub fn result_of(&self, session: &PollingSession) -> Result<Option<ResultRef>, PollError> {
        if let Some(resolution) = session.resolution() {
            return Ok(resolution.as_ref().ok().copied());
        }
        Ok(self.backend.job_status(session.job_id())?.result_ref)
    }
}

impl<B> std::fmt::Debug for AnalysisClient<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisClient")
            .field("owner", &self.owner)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
