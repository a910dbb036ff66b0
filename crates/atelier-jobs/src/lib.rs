//! atelier-jobs: Asynchronous analysis jobs and client-side polling.
//!
//! The server half is [`AnalysisService`]: it accepts an image for a
//! requester, enforces one outstanding job and one stored output per
//! requester, and runs the `atelier-pipeline` analysis off the caller's
//! path while recording progress on an [`AnalysisJob`].
//!
//! The client half is [`PollingSession`]: a synchronous request/response
//! state machine that turns repeated status observations into either a
//! [`ResultRef`] or a classified [`PollError`] (timeout, stall, failure,
//! cancellation). It owns no timer; [`AnalysisClient`] supplies a
//! blocking driver loop for tools.

pub mod backend;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod polling;
pub mod service;
pub mod store;

pub use backend::{AnalysisBackend, JobStatusSource};
pub use cache::ObservationCache;
pub use client::{AnalysisClient, Begin};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{JobsConfig, PollPolicy};
pub use error::{ConflictReason, PollError, ServiceError, TimeoutCause};
pub use executor::{ManualSpawner, Spawner, Task, ThreadSpawner};
pub use job::{
    AnalysisJob, JobId, JobStatus, Observation, OutstandingJob, OwnerId, ResultRef,
    TransitionError,
};
pub use polling::{CancelHandle, PollStep, PollingSession};
pub use service::{AnalysisService, PipelineFn, WORKER_PANICKED};
pub use store::{
    FixedQuota, InMemoryResultStore, Quota, QuotaGate, ResultStore, StoreError, Unlimited,
};
