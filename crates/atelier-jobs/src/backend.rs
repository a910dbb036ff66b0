//! The interface clients use to reach an analysis service.
//!
//! A remote deployment would implement these traits over HTTP; in this
//! workspace [`AnalysisService`] implements them directly.

use std::sync::Arc;

use atelier_pipeline::{AnalysisOutput, BinaryThreshold};

use crate::error::ServiceError;
use crate::executor::Spawner;
use crate::job::{JobId, Observation, OutstandingJob, OwnerId, ResultRef};
use crate::service::AnalysisService;
use crate::store::Quota;

/// Anything that can answer "what is job X doing right now".
pub trait JobStatusSource {
    /// One status request. Never blocks waiting for the job.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownJob`] for ids the source does not know.
    fn job_status(&self, id: JobId) -> Result<Observation, ServiceError>;
}

impl<T: JobStatusSource + ?Sized> JobStatusSource for &T {
    fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
        (**self).job_status(id)
    }
}

impl<T: JobStatusSource + ?Sized> JobStatusSource for Arc<T> {
    fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
        (**self).job_status(id)
    }
}

/// Full set of operations a client needs.
pub trait AnalysisBackend: JobStatusSource {
    /// Submit an image for analysis.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Conflict`] while the owner has an outstanding job
    /// or a stored result, among others.
    fn submit_analysis(
        &self,
        owner: &OwnerId,
        image_bytes: Vec<u8>,
        threshold: BinaryThreshold,
    ) -> Result<JobId, ServiceError>;

    /// The owner's in-flight job, for resuming after a restart.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    fn outstanding_job(&self, owner: &OwnerId) -> Result<Option<OutstandingJob>, ServiceError>;

    /// Load a finished output.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownResult`] for unknown references.
    fn fetch_result(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, ServiceError>;

    /// Delete a finished output.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownResult`] for unknown references.
    fn delete_result(&self, result: ResultRef) -> Result<(), ServiceError>;

    /// Remaining submissions for the owner.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    fn check_quota(&self, owner: &OwnerId) -> Result<Quota, ServiceError>;
}

impl<S: Spawner> JobStatusSource for AnalysisService<S> {
    fn job_status(&self, id: JobId) -> Result<Observation, ServiceError> {
        Self::job_status(self, id)
    }
}

impl<S: Spawner> AnalysisBackend for AnalysisService<S> {
    fn submit_analysis(
        &self,
        owner: &OwnerId,
        image_bytes: Vec<u8>,
        threshold: BinaryThreshold,
    ) -> Result<JobId, ServiceError> {
        self.submit(owner, image_bytes, threshold)
    }

    fn outstanding_job(&self, owner: &OwnerId) -> Result<Option<OutstandingJob>, ServiceError> {
        Ok(Self::outstanding_job(self, owner))
    }

    fn fetch_result(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, ServiceError> {
        Self::fetch_result(self, result)
    }

    fn delete_result(&self, result: ResultRef) -> Result<(), ServiceError> {
        Self::delete_result(self, result)
    }

    fn check_quota(&self, owner: &OwnerId) -> Result<Quota, ServiceError> {
        Ok(Self::check_quota(self, owner))
    }
}

impl<B: AnalysisBackend + ?Sized> AnalysisBackend for Arc<B> {
    fn submit_analysis(
        &self,
        owner: &OwnerId,
        image_bytes: Vec<u8>,
        threshold: BinaryThreshold,
    ) -> Result<JobId, ServiceError> {
        (**self).submit_analysis(owner, image_bytes, threshold)
    }

    fn outstanding_job(&self, owner: &OwnerId) -> Result<Option<OutstandingJob>, ServiceError> {
        (**self).outstanding_job(owner)
    }

    fn fetch_result(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, ServiceError> {
        (**self).fetch_result(result)
    }

    fn delete_result(&self, result: ResultRef) -> Result<(), ServiceError> {
        (**self).delete_result(result)
    }

    fn check_quota(&self, owner: &OwnerId) -> Result<Quota, ServiceError> {
        (**self).check_quota(owner)
    }
}
