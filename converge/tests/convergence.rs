//! End-to-end convergence tests against a scripted in-memory cloud.
//!
//! All tests run on tokio's paused clock, so backoff and poll intervals cost
//! no wall time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeCloud, FakeError, Recorder, Status, fast_config};
use converge::{Converger, Error, Event, PageCursor, TagSet};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn tags(pairs: &[(&str, &str)]) -> TagSet {
    pairs.iter().copied().collect()
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_survives_ambiguous_failure() {
    let cloud = FakeCloud::new();
    cloud.ambiguous_creates(1);
    let recorder = Recorder::new();
    let converger = Converger::new(cloud.clone(), fast_config())
        .unwrap()
        .with_observer(recorder.clone());

    let (id, status) = assert_ok!(converger.create(&"web".to_string()).await);

    assert_eq!(status, Status::Available);
    assert_eq!(cloud.instance_count(), 1);

    // Two create attempts, one token.
    let tokens = cloud.create_tokens();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0], tokens[1]);
    assert!(tokens[0].as_str().starts_with("converge-CreateInstance-"));

    assert_eq!(
        recorder.probes(),
        vec![
            Some("Creating".to_string()),
            Some("Creating".to_string()),
            Some("Available".to_string()),
        ]
    );
    assert_eq!(id, "i-0001");
}

#[tokio::test(start_paused = true)]
async fn test_create_retries_throttling() {
    let cloud = FakeCloud::new();
    cloud.fail_next_creates(vec![FakeError::Throttled, FakeError::Throttled]);
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();
    let start = Instant::now();

    let (_, status) = assert_ok!(converger.create(&"web".to_string()).await);

    assert_eq!(status, Status::Available);
    assert_eq!(cloud.create_tokens().len(), 3);
    // 1s + 2s of backoff, then two 1s poll intervals
    assert_eq!(start.elapsed().as_secs(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_create_rejected_is_not_retried() {
    let cloud = FakeCloud::new();
    cloud.fail_next_creates(vec![FakeError::Invalid("InstanceType".into())]);
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    let err = assert_err!(converger.create(&"web".to_string()).await);

    assert!(matches!(err, Error::Fatal(FakeError::Invalid(_))));
    assert_eq!(cloud.create_tokens().len(), 1);
    assert_eq!(cloud.describes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_create_reports_failure_state() {
    let cloud = FakeCloud::new();
    cloud.script_creates(vec![Some(Status::Creating), Some(Status::Failed)]);
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    let err = assert_err!(converger.create(&"web".to_string()).await);

    match err {
        Error::FailureState { id, status } => {
            assert_eq!(id, "i-0001");
            assert_eq!(status, "Failed");
        }
        other => panic!("expected FailureState, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_times_out_with_last_status() {
    let cloud = FakeCloud::new();
    cloud.script_creates(vec![Some(Status::Creating)]);
    let mut config = fast_config();
    config.timeouts.create_secs = 10;
    let converger = Converger::new(cloud.clone(), config).unwrap();

    let err = assert_err!(converger.create(&"web".to_string()).await);

    assert!(err.is_timeout());
    assert!(matches!(
        err,
        Error::ConvergeTimeout { last_status: Some(ref s), .. } if s == "Creating"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_bounds_describe_retries() {
    let cloud = FakeCloud::new();
    cloud.fail_next_describes(vec![FakeError::Throttled; 1000]);
    let mut config = fast_config();
    config.timeouts.create_secs = 10;
    config.timeouts.read_secs = 300;
    let converger = Converger::new(cloud.clone(), config).unwrap();
    let start = Instant::now();

    let err = assert_err!(converger.create(&"web".to_string()).await);

    // Throttled describes inside a probe give up with the create deadline.
    assert!(matches!(err, Error::ConvergeTimeout { last_status: None, .. }));
    assert!(start.elapsed() <= Duration::from_secs(10));
    assert!(cloud.describes() <= 11);
}

#[tokio::test(start_paused = true)]
async fn test_probe_retries_throttled_describe() {
    let cloud = FakeCloud::new();
    cloud.fail_next_describes(vec![FakeError::Throttled, FakeError::Timeout]);
    let recorder = Recorder::new();
    let converger = Converger::new(cloud.clone(), fast_config())
        .unwrap()
        .with_observer(recorder.clone());

    assert_ok!(converger.create(&"web".to_string()).await);

    // Retries happen inside a probe; the poller still sees three observations.
    assert_eq!(recorder.probes().len(), 3);
    assert_eq!(cloud.describes(), 5);
    let retries = recorder
        .events()
        .iter()
        .filter(|e| {
            matches!(e, Event::RetryScheduled { operation, .. } if operation == "DescribeInstance")
        })
        .count();
    assert_eq!(retries, 2);
}

// =============================================================================
// Update / Read / Delete
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_update_waits_for_available() {
    let cloud = FakeCloud::new();
    cloud.seed("i-1", vec![Some(Status::Available)], TagSet::new());
    let recorder = Recorder::new();
    let converger = Converger::new(cloud.clone(), fast_config())
        .unwrap()
        .with_observer(recorder.clone());

    let status = assert_ok!(converger.update("i-1", &"bigger".to_string()).await);

    assert_eq!(status, Status::Available);
    assert_eq!(cloud.calls(), vec!["update i-1".to_string()]);
    assert_eq!(
        recorder.probes(),
        vec![Some("Modifying".to_string()), Some("Available".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_missing_is_none() {
    let cloud = FakeCloud::new();
    cloud.seed("i-1", vec![Some(Status::Available)], TagSet::new());
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    assert_eq!(converger.read("i-1").await.unwrap(), Some(Status::Available));
    assert_eq!(converger.read("i-404").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_delete_waits_until_gone() {
    let cloud = FakeCloud::new();
    cloud.seed("i-1", vec![Some(Status::Available)], TagSet::new());
    let recorder = Recorder::new();
    let converger = Converger::new(cloud.clone(), fast_config())
        .unwrap()
        .with_observer(recorder.clone());

    assert_ok!(converger.delete("i-1").await);

    assert_eq!(cloud.instance_count(), 0);
    assert_eq!(recorder.probes(), vec![Some("Deleting".to_string()), None]);
}

#[tokio::test(start_paused = true)]
async fn test_delete_missing_is_success() {
    let cloud = FakeCloud::new();
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();
    let start = Instant::now();

    assert_ok!(converger.delete("i-404").await);

    assert_eq!(cloud.describes(), 0);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

// =============================================================================
// List
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_list_walks_every_page() {
    let cloud = FakeCloud::new();
    cloud.set_listing((0..237).collect());
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    let items = assert_ok!(converger.list().await);

    assert_eq!(items.len(), 237);
    assert_eq!(
        cloud.list_calls(),
        vec![PageCursor::Index(1), PageCursor::Index(2), PageCursor::Index(3)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_list_where_filters_items() {
    let cloud = FakeCloud::new();
    cloud.set_listing((0..200).collect());
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    let items = assert_ok!(converger.list_where(|n| *n < 5).await);

    assert_eq!(items, vec![0, 1, 2, 3, 4]);
    // 200 items fill two pages exactly; the empty third page ends the listing.
    assert_eq!(cloud.list_calls().len(), 3);
}

// =============================================================================
// Tags
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconcile_tags_removes_then_creates() {
    let cloud = FakeCloud::new();
    cloud.seed(
        "i-1",
        vec![Some(Status::Available)],
        tags(&[("env", "prod"), ("team", "a"), ("acs:rm:rgId", "rg-1")]),
    );
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    let declared = tags(&[("env", "prod"), ("team", "b"), ("cost", "x")]);
    let diff = assert_ok!(converger.reconcile_tags("i-1", &declared).await);

    assert_eq!(diff.removed_keys(), vec!["team".to_string()]);
    assert_eq!(cloud.calls(), vec!["untag team".to_string(), "tag cost,team".to_string()]);
    assert_eq!(
        cloud.tags_of("i-1"),
        tags(&[("env", "prod"), ("team", "b"), ("cost", "x"), ("acs:rm:rgId", "rg-1")])
    );

    // A second pass has nothing left to do.
    let diff = assert_ok!(converger.reconcile_tags("i-1", &declared).await);
    assert!(diff.is_empty());
    assert_eq!(cloud.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_tags_on_missing_resource_fails() {
    let cloud = FakeCloud::new();
    let converger = Converger::new(cloud.clone(), fast_config()).unwrap();

    let err = assert_err!(converger.reconcile_tags("i-404", &tags(&[("env", "dev")])).await);
    assert!(matches!(err, Error::Fatal(FakeError::NotFound)));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_create_stops_polling() {
    let cloud = FakeCloud::new();
    cloud.script_creates(vec![Some(Status::Creating)]);
    let token = tokio_util::sync::CancellationToken::new();
    let converger = Arc::new(
        Converger::new(cloud.clone(), fast_config())
            .unwrap()
            .with_cancellation(token.clone()),
    );

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        canceller.cancel();
    });

    let err = assert_err!(converger.create(&"web".to_string()).await);
    assert!(matches!(err, Error::Cancelled { .. }));
    assert!(cloud.describes() <= 4);
}
