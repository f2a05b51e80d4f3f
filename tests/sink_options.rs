use std::time::Duration;

use tablesink::{
    parse_duration, parse_memory_size, ChangelogProducer, CheckpointingMode, ConfigError,
    EmptyCommitPolicy, ExecutionConfig, Options, RetryPolicy, SinkOptions, TagCreationMode,
};

#[test]
fn defaults_apply_when_options_are_empty() {
    let options = SinkOptions::from_options(&Options::new()).expect("defaults");
    assert_eq!(options, SinkOptions::default());
    assert!(!options.precommit_compact);
    assert_eq!(options.target_file_size, 128 << 20);
    assert_eq!(options.num_buckets, 1);
    assert_eq!(options.empty_commit, EmptyCommitPolicy::Skip);
    assert_eq!(options.retry, RetryPolicy::default());
    assert!(options.committer_chaining);
}

#[test]
fn recognised_keys_are_parsed() {
    let raw = Options::from_pairs([
        ("changelog.precommit-compact", "true"),
        ("target-file-size", "8 mb"),
        ("bucket", "4"),
        ("changelog-producer", "input"),
        ("sink.parallelism", "3"),
        ("sink.operator-uid.suffix", "v2"),
        ("sink.use-managed-memory-allocator", "true"),
        ("sink.managed.writer-buffer-memory", "64mb"),
        ("sink.committer-cpu", "0.5"),
        ("sink.committer-memory", "1 gb"),
        ("sink.committer-operator-chaining", "false"),
        ("sink.auto-tag-for-savepoint", "true"),
        ("tag.automatic-creation", "batch"),
        ("tag.default-time-retained", "2 d"),
        ("tag.num-retained-max", "5"),
        ("end-input.watermark", "1700000000000"),
        ("commit.force-create-snapshot", "true"),
        ("commit.max-retries", "3"),
        ("commit.min-retry-wait", "5 ms"),
        ("commit.max-retry-wait", "1 s"),
        ("commit.restart-after-recommit", "true"),
    ]);
    let options = SinkOptions::from_options(&raw).expect("parse");

    assert!(options.precommit_compact);
    assert_eq!(options.target_file_size, 8 << 20);
    assert_eq!(options.num_buckets, 4);
    assert_eq!(options.changelog_producer, ChangelogProducer::Input);
    assert_eq!(options.sink_parallelism, Some(3));
    assert_eq!(options.operator_uid_suffix.as_deref(), Some("v2"));
    assert!(options.use_managed_memory);
    assert_eq!(options.managed_writer_buffer_memory, 64 << 20);
    assert_eq!(options.committer_cpu, 0.5);
    assert_eq!(options.committer_memory, Some(1 << 30));
    assert!(!options.committer_chaining);
    assert!(options.auto_tag_for_savepoint);
    assert_eq!(options.tag_creation_mode, TagCreationMode::Batch);
    assert_eq!(
        options.tag_time_retained,
        Some(Duration::from_secs(2 * 86_400))
    );
    assert_eq!(options.tag_num_retained_max, Some(5));
    assert_eq!(options.end_input_watermark, Some(1_700_000_000_000));
    assert_eq!(options.empty_commit, EmptyCommitPolicy::CreateSnapshot);
    assert_eq!(
        options.retry,
        RetryPolicy {
            max_retries: 3,
            min_wait: Duration::from_millis(5),
            max_wait: Duration::from_secs(1),
        }
    );
    assert!(options.restart_after_recommit);
}

#[test]
fn invalid_values_name_the_offending_key() {
    let cases = [
        ("bucket", "0"),
        ("bucket", "many"),
        ("changelog.precommit-compact", "yes"),
        ("changelog-producer", "lookup"),
        ("target-file-size", "12 parsecs"),
        ("tag.automatic-creation", "hourly"),
        ("commit.min-retry-wait", "soon"),
        ("sink.parallelism", "0"),
    ];
    for (key, value) in cases {
        let raw = Options::from_pairs([(key, value)]);
        match SinkOptions::from_options(&raw) {
            Err(ConfigError::InvalidValue { key: reported, .. }) => assert_eq!(reported, key),
            other => panic!("unexpected result for {key}={value}: {:?}", other),
        }
    }
}

#[test]
fn dynamic_options_override_and_report_changes() {
    let mut table = Options::from_pairs([("bucket", "2"), ("write-only", "false")]);
    let overlay = Options::from_pairs([("bucket", "2"), ("write-only", "true"), ("sink.parallelism", "4")]);

    let changed = table.merge(&overlay);
    assert_eq!(changed, vec!["sink.parallelism".to_string(), "write-only".to_string()]);
    assert_eq!(table.get("write-only"), Some("true"));
    let options = SinkOptions::from_options(&table).expect("parse merged");
    assert!(options.write_only);
    assert_eq!(options.sink_parallelism, Some(4));
}

#[test]
fn memory_sizes_and_durations_accept_common_units() {
    assert_eq!(parse_memory_size("4096"), Ok(4096));
    assert_eq!(parse_memory_size("2kb"), Ok(2048));
    assert_eq!(parse_memory_size(" 3 MB "), Ok(3 << 20));
    assert!(parse_memory_size("mb").is_err());
    assert!(parse_memory_size("99999999999 tb").is_err());

    assert_eq!(parse_duration("250 ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
    assert_eq!(parse_duration("5 min"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7_200)));
    assert!(parse_duration("1 fortnight").is_err());
}

#[test]
fn streaming_checkpoints_must_be_aligned_and_exactly_once() {
    let mut execution = ExecutionConfig::streaming(2);
    execution.assert_streaming_configuration().expect("default is valid");

    execution.unaligned_checkpoints = true;
    assert!(matches!(
        execution.assert_streaming_configuration(),
        Err(ConfigError::UnsupportedEnvironment(_))
    ));

    execution.unaligned_checkpoints = false;
    execution.checkpointing_mode = CheckpointingMode::AtLeastOnce;
    assert!(execution.assert_streaming_configuration().is_err());

    execution.checkpointing_enabled = false;
    execution
        .assert_streaming_configuration()
        .expect("nothing to check without checkpointing");
}

#[test]
fn adaptive_batch_parallelism_needs_explicit_sink_parallelism() {
    let mut execution = ExecutionConfig::batch(4);
    assert!(!execution.checkpointing_enabled);
    execution.adaptive_parallelism = true;

    match execution.assert_batch_adaptive_parallelism(None) {
        Err(ConfigError::UnsupportedEnvironment(reason)) => {
            assert!(reason.contains("sink.parallelism"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    execution
        .assert_batch_adaptive_parallelism(Some(4))
        .expect("explicit parallelism");
    ExecutionConfig::streaming(4)
        .assert_batch_adaptive_parallelism(None)
        .expect("streaming is unaffected");
}

#[test]
fn execution_config_reads_kebab_case_json() {
    let execution: ExecutionConfig = serde_json::from_str(
        r#"{"runtime-mode":"streaming","checkpointing-enabled":true,"input-parallelism":3}"#,
    )
    .expect("decode");
    assert_eq!(execution, ExecutionConfig::streaming(3));
}
