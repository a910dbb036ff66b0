//! End-to-end submit / poll / fetch lifecycles against an in-process
//! service. Execution is driven by hand with `ManualSpawner` and time by
//! `ManualClock`, so nothing here sleeps on the happy paths.

#![allow(clippy::unwrap_used, clippy::panic, clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::Duration;

use atelier_jobs::{
    AnalysisClient, AnalysisService, Begin, ConflictReason, InMemoryResultStore, JobStatus,
    JobsConfig, ManualClock, ManualSpawner, ObservationCache, OwnerId, PollError, PollPolicy,
    PollStep, PollingSession, ResultRef, ResultStore, ServiceError, StoreError, ThreadSpawner,
    TimeoutCause, Unlimited, WORKER_PANICKED,
};
use atelier_pipeline::{AnalysisOutput, BinaryThreshold, RgbImage};
use chrono::{DateTime, Utc};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb};

fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .unwrap();
    bytes
}

fn gradient_png() -> Vec<u8> {
    encode_png(&RgbImage::from_fn(24, 16, |x, y| {
        Rgb([(x * 10) as u8, (y * 15) as u8, 120])
    }))
}

struct Harness {
    service: Arc<AnalysisService<ManualSpawner>>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH));
        let service = Arc::new(AnalysisService::new(
            ManualSpawner::new(),
            Arc::new(InMemoryResultStore::new()),
            Arc::new(Unlimited),
            clock.clone(),
            JobsConfig::default(),
        ));
        Self { service, clock }
    }

    fn client(&self, owner: &str) -> AnalysisClient<Arc<AnalysisService<ManualSpawner>>> {
        AnalysisClient::new(
            Arc::clone(&self.service),
            OwnerId::new(owner),
            PollPolicy::default(),
            self.clock.clone(),
        )
    }
}

#[test]
fn submit_poll_fetch_succeeds() {
    let harness = Harness::new();
    let owner = OwnerId::new("painter");
    let id = harness
        .service
        .submit(&owner, gradient_png(), BinaryThreshold::L140)
        .unwrap();

    let mut session = PollingSession::new(id, PollPolicy::default());
    match session.poll(&*harness.service) {
        PollStep::Progress(observation) => {
            assert_eq!(observation.status, JobStatus::Pending);
            assert_eq!(observation.progress, 0);
        }
        PollStep::Finished(outcome) => panic!("finished early: {outcome:?}"),
    }

    harness.service.spawner().run_all();

    let PollStep::Finished(Ok(result)) = session.poll(&*harness.service) else {
        panic!("expected success");
    };
    let output = harness.service.fetch_result(result).unwrap();
    assert!(!output.binary.is_empty());
    assert_eq!(output.binary.dimensions(), (24, 16));
    assert_eq!(output.threshold, BinaryThreshold::L140);
    assert_eq!(session.last_progress(), 100);
}

#[test]
fn client_drive_reports_monotonic_progress() {
    let harness = Harness::new();
    let client = harness.client("painter");
    let mut session = client
        .begin(gradient_png(), BinaryThreshold::L110)
        .unwrap()
        .into_session();

    let mut seen = Vec::new();
    let output = client
        .drive(
            &mut session,
            |_| {
                harness.service.spawner().run_next();
            },
            |observation| seen.push(observation.progress),
        )
        .unwrap();

    assert_eq!(output.palette_12.len(), 12);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn second_submission_conflicts_while_outstanding() {
    let harness = Harness::new();
    let owner = OwnerId::new("painter");
    let first = harness
        .service
        .submit(&owner, gradient_png(), BinaryThreshold::L140)
        .unwrap();
    assert_eq!(
        harness
            .service
            .submit(&owner, gradient_png(), BinaryThreshold::L200),
        Err(ServiceError::Conflict(ConflictReason::OutstandingJob(first)))
    );
    assert_eq!(harness.service.spawner().pending(), 1);
}

#[test]
fn retained_output_conflicts_until_deleted() {
    let harness = Harness::new();
    let client = harness.client("painter");
    let mut session = client
        .begin(gradient_png(), BinaryThreshold::L140)
        .unwrap()
        .into_session();
    harness.service.spawner().run_all();
    client.drive(&mut session, |_| {}, |_| {}).unwrap();
    let result = client.result_of(&session).unwrap().unwrap();

    let err = client
        .begin(gradient_png(), BinaryThreshold::L140)
        .unwrap_err();
    assert_eq!(
        err,
        PollError::Backend(ServiceError::Conflict(ConflictReason::RetainedOutput(
            result
        )))
    );
    assert!(err.remediation().contains("Delete"));

    client.discard(result).unwrap();
    assert!(matches!(
        client.begin(gradient_png(), BinaryThreshold::L140).unwrap(),
        Begin::Submitted(_)
    ));
}

#[test]
fn job_never_started_is_stalled() {
    let harness = Harness::new();
    let owner = OwnerId::new("painter");
    let id = harness
        .service
        .submit(&owner, gradient_png(), BinaryThreshold::L140)
        .unwrap();
    harness.service.spawner().discard_all();

    let mut session = PollingSession::new(id, PollPolicy::default());
    let mut polls = 0;
    let outcome = loop {
        polls += 1;
        harness.clock.advance(Duration::from_secs(2));
        if let PollStep::Finished(outcome) = session.poll(&*harness.service) {
            break outcome;
        }
    };
    assert_eq!(polls, 30);
    let err = outcome.unwrap_err();
    assert_eq!(err, PollError::Stalled { observations: 30 });
    assert!(err.remediation().contains("worker may be down"));
    assert_eq!(
        harness.service.job_status(id).unwrap().status,
        JobStatus::Pending
    );
}

#[test]
fn old_outstanding_job_times_out_without_polling() {
    let harness = Harness::new();
    let owner = OwnerId::new("painter");
    let id = harness
        .service
        .submit(&owner, gradient_png(), BinaryThreshold::L140)
        .unwrap();
    harness.service.spawner().discard_all();
    harness.clock.advance(Duration::from_secs(45 * 60));

    let outstanding = harness.service.outstanding_job(&owner).unwrap();
    assert_eq!(outstanding.job_id, id);

    let err = harness
        .client("painter")
        .begin(gradient_png(), BinaryThreshold::L140)
        .unwrap_err();
    assert_eq!(err, PollError::Timeout(TimeoutCause::Age));
    assert!(err.remediation().contains("try again later"));
    assert_eq!(harness.service.spawner().pending(), 0);
}

#[test]
fn recent_outstanding_job_is_resumed() {
    let harness = Harness::new();
    let client = harness.client("painter");
    let first = client
        .begin(gradient_png(), BinaryThreshold::L140)
        .unwrap()
        .into_session();
    harness.clock.advance(Duration::from_secs(10 * 60));

    let Begin::Resumed(mut resumed) = client.begin(gradient_png(), BinaryThreshold::L50).unwrap()
    else {
        panic!("expected resume");
    };
    assert_eq!(resumed.job_id(), first.job_id());

    harness.service.spawner().run_all();
    let output = client.drive(&mut resumed, |_| {}, |_| {}).unwrap();
    assert_eq!(output.threshold, BinaryThreshold::L140);
}

#[test]
fn single_color_image_yields_duplicate_palette() {
    let harness = Harness::new();
    let client = harness.client("painter");
    let png = encode_png(&RgbImage::from_pixel(10, 10, Rgb([30, 160, 90])));
    let mut session = client
        .begin(png, BinaryThreshold::L140)
        .unwrap()
        .into_session();
    harness.service.spawner().run_all();
    let output = client.drive(&mut session, |_| {}, |_| {}).unwrap();

    for palette in [&output.palette_8, &output.palette_12] {
        assert!((palette.total_ratio() - 1.0).abs() < 1e-3);
        assert!(palette.entries().iter().all(|e| e.color == [30, 160, 90]));
    }
    assert_eq!(output.palette_8.len(), 8);
    assert_eq!(output.palette_12.len(), 12);
}

#[test]
fn cached_pollers_share_terminal_outcome() {
    let harness = Harness::new();
    let owner = OwnerId::new("painter");
    let id = harness
        .service
        .submit(&owner, gradient_png(), BinaryThreshold::L80)
        .unwrap();
    let cache = ObservationCache::new(
        Arc::clone(&harness.service),
        harness.clock.clone(),
        harness.service.config(),
    );
    let mut tab_a = PollingSession::new(id, PollPolicy::default());
    let mut tab_b = PollingSession::new(id, PollPolicy::default());

    assert!(matches!(tab_a.poll(&cache), PollStep::Progress(_)));
    harness.service.spawner().run_all();
    // Within the TTL tab B still sees the cached pending observation.
    assert!(matches!(tab_b.poll(&cache), PollStep::Progress(_)));

    harness.clock.advance(Duration::from_secs(2));
    let a = tab_a.poll(&cache);
    let b = tab_b.poll(&cache);
    assert_eq!(a, b);
    assert!(matches!(a, PollStep::Finished(Ok(_))));
    assert_eq!(cache.misses(), 2);
}

#[test]
fn threaded_execution_progress_is_monotonic() {
    let service = AnalysisService::in_memory(ThreadSpawner, JobsConfig::default());
    let owner = OwnerId::new("painter");
    let id = service
        .submit(&owner, gradient_png(), BinaryThreshold::L170)
        .unwrap();

    let policy = PollPolicy {
        max_observations: 100_000,
        stall_limit: 100_000,
        ..PollPolicy::default()
    };
    let mut session = PollingSession::new(id, policy);
    let mut seen = Vec::new();
    let outcome = loop {
        match session.poll(&service) {
            PollStep::Progress(observation) => seen.push(observation.progress),
            PollStep::Finished(outcome) => break outcome,
        }
        std::thread::sleep(Duration::from_millis(1));
    };

    assert!(outcome.is_ok());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    let job = service.job(id).unwrap();
    assert_eq!(job.status(), JobStatus::Success);
    assert_eq!(job.progress(), 100);
}

/// Result store that panics on every write.
struct CrashingStore;

impl ResultStore for CrashingStore {
    fn put(&self, _owner: &OwnerId, _output: AnalysisOutput) -> Result<ResultRef, StoreError> {
        panic!("database connection lost");
    }

    fn get(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, StoreError> {
        Err(StoreError::NotFound(result))
    }

    fn delete(&self, result: ResultRef) -> Result<(), StoreError> {
        Err(StoreError::NotFound(result))
    }

    fn find(&self, _owner: &OwnerId) -> Option<ResultRef> {
        None
    }
}

#[test]
fn worker_panic_fails_job_and_owner_can_resubmit() {
    let clock = Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH));
    let service = AnalysisService::new(
        ThreadSpawner,
        Arc::new(CrashingStore),
        Arc::new(Unlimited),
        clock.clone(),
        JobsConfig::default(),
    );
    let owner = OwnerId::new("painter");
    let id = service
        .submit(&owner, gradient_png(), BinaryThreshold::L140)
        .unwrap();

    let policy = PollPolicy {
        max_observations: 100_000,
        stall_limit: 100_000,
        ..PollPolicy::default()
    };
    let mut session = PollingSession::new(id, policy);
    let outcome = loop {
        if let PollStep::Finished(outcome) = session.poll(&service) {
            break outcome;
        }
        std::thread::sleep(Duration::from_millis(1));
    };

    let Err(PollError::Failed(cause)) = outcome else {
        panic!("expected a failed job, got {outcome:?}");
    };
    assert!(cause.starts_with(WORKER_PANICKED));
    assert!(cause.contains("database connection lost"));
    assert_eq!(service.job(id).unwrap().status(), JobStatus::Failure);
    assert!(service.outstanding_job(&owner).is_none());

    clock.advance(Duration::from_secs(24 * 60 * 60));
    service.prune();
    assert!(
        service
            .submit(&owner, gradient_png(), BinaryThreshold::L140)
            .is_ok()
    );
}
