//! Configuration for job execution and client polling.
//!
//! Every field has a default, so a partial JSON document such as
//! `{"poll": {"stall_limit": 10}}` is a valid configuration. Durations
//! are written as fractional seconds.

use std::time::Duration;

use atelier_pipeline::diagnostics::duration_serde;
use serde::{Deserialize, Serialize};

/// Default poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default cap on observations per session (about six minutes at the
/// default cadence).
pub const DEFAULT_MAX_OBSERVATIONS: u32 = 180;

/// Default number of consecutive pending-at-zero observations before a
/// session is classified as stalled.
pub const DEFAULT_STALL_LIMIT: u32 = 30;

/// Age after which a job that never left `Pending` is presumed
/// abandoned. Used both when resuming on the client and when expiring
/// jobs on the server.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Default retention for terminal jobs.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 60 * 60);

/// Default lifetime of a cached observation.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);

/// Default maximum number of cached observations.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Client-side polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay between polls. Only used by drivers that sleep; a
    /// [`PollingSession`](crate::PollingSession) itself never waits.
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Give up with a timeout after this many observations.
    pub max_observations: u32,
    /// Give up as stalled after this many consecutive `Pending`
    /// observations at progress 0.
    pub stall_limit: u32,
    /// Outstanding jobs older than this are not resumed.
    #[serde(with = "duration_serde")]
    pub max_age: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_observations: DEFAULT_MAX_OBSERVATIONS,
            stall_limit: DEFAULT_STALL_LIMIT,
            max_age: DEFAULT_STALE_AFTER,
        }
    }
}

/// Configuration for [`AnalysisService`](crate::AnalysisService) and
/// its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Client polling policy.
    pub poll: PollPolicy,
    /// Pending jobs older than this are failed as stale.
    #[serde(with = "duration_serde")]
    pub stale_after: Duration,
    /// Terminal jobs are pruned once this much time has passed since
    /// their last update.
    #[serde(with = "duration_serde")]
    pub retention: Duration,
    /// Lifetime of a cached observation.
    #[serde(with = "duration_serde")]
    pub cache_ttl: Duration,
    /// Maximum number of cached observations.
    pub cache_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            stale_after: DEFAULT_STALE_AFTER,
            retention: DEFAULT_RETENTION,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl JobsConfig {
    /// Parse a (possibly partial) JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed JSON, unknown types,
    /// or negative durations.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
