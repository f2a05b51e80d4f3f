use std::sync::Arc;

use serde_json::Value;
use tablesink::{
    CheckpointBarrier, Committer, CommitterOperatorBuilder, EmptyCommitPolicy, FaultPoint,
    InMemoryTableStore, JsonLineLogger, LogLevel, LogRotationPolicy, ManualClock, RetryPolicy,
    StoreCommitter, StoreError, StreamElement, TableStore,
};

#[test]
fn json_logger_serializes_entries() {
    let policy = LogRotationPolicy {
        max_bytes: 256,
        max_files: 2,
    };
    let mut logger = JsonLineLogger::new(policy);
    logger
        .log(100, LogLevel::Info, "committer", Some(4), "first entry")
        .unwrap();
    logger
        .log(101, LogLevel::Info, "committer", None, "no checkpoint")
        .unwrap();
    let lines: Vec<_> = logger.lines().collect();
    assert_eq!(lines.len(), 2);
    let parsed: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["ts"], 100);
    assert_eq!(parsed["level"], "INFO");
    assert_eq!(parsed["stage"], "committer");
    assert_eq!(parsed["checkpoint_id"], 4);
    let parsed: Value = serde_json::from_str(lines[1]).unwrap();
    assert!(parsed.get("checkpoint_id").is_none());
}

#[test]
fn loglevel_override_filters_entries() {
    let policy = LogRotationPolicy {
        max_bytes: 512,
        max_files: 1,
    };
    let mut logger = JsonLineLogger::new(policy);
    logger.set_level(LogLevel::Warn);
    assert_eq!(logger.level(), LogLevel::Warn);
    logger
        .log(0, LogLevel::Info, "committer", Some(1), "info suppressed")
        .unwrap();
    logger
        .log(1, LogLevel::Warn, "committer", Some(2), "warn visible")
        .unwrap();
    let lines: Vec<_> = logger.lines().collect();
    assert_eq!(lines.len(), 1);
    let parsed: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["level"], "WARN");
    assert_eq!(parsed["message"], "warn visible");
}

#[test]
fn rotation_discards_old_segments() {
    let policy = LogRotationPolicy {
        max_bytes: 64,
        max_files: 2,
    };
    let mut logger = JsonLineLogger::new(policy);
    for idx in 0..10 {
        logger
            .log(0, LogLevel::Info, "sorter", Some(idx), "payload")
            .unwrap();
    }
    let segments: Vec<_> = logger.files().collect();
    assert!(segments.len() <= 3, "active + rotated segments retained");
    assert!(segments.iter().any(|file| !file.lines().is_empty()));
    assert!(logger.lines().count() < 10);
}

#[test]
fn committer_audit_trail_records_failures_at_error_level() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let shared: Arc<dyn TableStore> = store.clone();
    let mut audit = JsonLineLogger::default();
    audit.set_level(LogLevel::Error);
    let mut op = CommitterOperatorBuilder::new("job-a", move |user| {
        Box::new(StoreCommitter::new(
            shared,
            user,
            RetryPolicy::none(),
            EmptyCommitPolicy::CreateSnapshot,
        )) as Box<dyn Committer>
    })
    .clock(ManualClock::new(vec![10, 20, 30]))
    .audit_log(audit)
    .build();
    op.initialize().expect("initialize");

    op.process(0, StreamElement::Barrier(CheckpointBarrier::checkpoint(1)))
        .expect("empty snapshot");
    store.fail_next(
        FaultPoint::Apply,
        StoreError::Integrity {
            reason: "bad manifest".into(),
        },
    );
    assert!(op
        .process(0, StreamElement::Barrier(CheckpointBarrier::checkpoint(2)))
        .is_err());

    let lines: Vec<_> = op.audit_log().lines().collect();
    assert_eq!(lines.len(), 1);
    let parsed: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["level"], "ERROR");
    assert_eq!(parsed["checkpoint_id"], 2);
    assert_eq!(parsed["ts"], 20);
    assert!(parsed["message"]
        .as_str()
        .is_some_and(|message| message.contains("bad manifest")));
}
