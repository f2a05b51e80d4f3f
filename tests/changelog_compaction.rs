use std::sync::Arc;

use tablesink::{
    ChangelogCompactCoordinator, ChangelogCompactSorter, ChangelogCompactTask,
    ChangelogCompactWorker, ChangelogProducer, CheckpointBarrier, CommitMessage, Committable,
    CommittableKind, Committer, CommitterOperatorBuilder, DataFileMeta, EmptyCommitPolicy,
    FaultPoint, FileKind, InMemoryTableStore, ManualClock, RetryPolicy, Row, SinkError,
    SinkOptions, SinkRecord, StoreCommitter, StoreError, StoreSinkWriter, StreamElement,
    TableStore,
};

fn options(target_file_size: u64) -> SinkOptions {
    SinkOptions {
        precommit_compact: true,
        changelog_producer: ChangelogProducer::Input,
        num_buckets: 4,
        target_file_size,
        ..SinkOptions::default()
    }
}

/// Two writers each flushing `records` rows for checkpoint 1.
fn written(
    store: &Arc<InMemoryTableStore>,
    options: &SinkOptions,
    records: u32,
) -> (Vec<Committable>, Vec<Row>) {
    let mut committables = Vec::new();
    let mut rows = Vec::new();
    for producer in 0..2u32 {
        let mut writer = StoreSinkWriter::with_clock(
            producer,
            "job-a",
            store.clone(),
            options,
            true,
            ManualClock::fixed(1_000 + u64::from(producer)),
        );
        for idx in 0..records {
            let key = format!("k-{producer}-{idx}");
            let value = format!("v{idx}");
            rows.push(Row::insert(key.clone(), value.clone()));
            writer
                .write(SinkRecord::insert("p", key, value))
                .expect("write record");
        }
        committables.extend(writer.prepare_commit(1).expect("prepare commit"));
    }
    (committables, rows)
}

fn changelog_files(committables: &[Committable]) -> Vec<DataFileMeta> {
    committables
        .iter()
        .filter_map(Committable::message)
        .flat_map(|message| {
            message
                .changelog_files
                .iter()
                .chain(&message.compact_changelog_files)
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Runs coordinator, one worker and the sorter for checkpoint 1.
fn compact(
    store: &Arc<InMemoryTableStore>,
    target_file_size: u64,
    committables: Vec<Committable>,
) -> Vec<Committable> {
    let mut coordinator = ChangelogCompactCoordinator::new(target_file_size);
    let mut worker = ChangelogCompactWorker::new(0, store.clone(), target_file_size);
    let mut sorter = ChangelogCompactSorter::new();

    let mut routed = Vec::new();
    for committable in committables {
        routed.extend(coordinator.process(committable).expect("coordinator"));
    }
    routed.extend(coordinator.prepare_snapshot_pre_barrier(1));
    assert_eq!(coordinator.pending_partitions(), 0);

    for committable in routed {
        for produced in worker.process(committable).expect("worker") {
            sorter.process(produced).expect("sorter");
        }
    }
    let sorted = sorter.flush(1);
    assert!(sorter.is_empty());
    sorted
}

fn commit(store: &Arc<InMemoryTableStore>, committables: Vec<Committable>) {
    let shared: Arc<dyn TableStore> = store.clone();
    let mut op = CommitterOperatorBuilder::new("job-a", move |user| {
        Box::new(StoreCommitter::new(
            shared,
            user,
            RetryPolicy::none(),
            EmptyCommitPolicy::Skip,
        )) as Box<dyn Committer>
    })
    .build();
    op.initialize().expect("initialize");
    for committable in committables {
        op.process(0, StreamElement::Committable(committable))
            .expect("committable");
    }
    let outcomes = op
        .process(0, StreamElement::Barrier(CheckpointBarrier::checkpoint(1)))
        .expect("barrier");
    assert_eq!(outcomes.len(), 1);
}

fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort();
    rows
}

#[test]
fn compacted_changelog_holds_exactly_the_written_rows() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let options = options(1 << 20);
    let (committables, rows) = written(&store, &options, 25);
    let inputs = changelog_files(&committables);
    assert!(inputs.len() > 1);

    let compacted = compact(&store, options.target_file_size, committables);
    let outputs = changelog_files(&compacted);
    assert_eq!(outputs.len(), 1);
    for input in &inputs {
        assert!(!store.file_exists(&input.file_name));
    }

    commit(&store, compacted);
    assert_eq!(sorted(store.live_rows(FileKind::Changelog)), sorted(rows.clone()));
    assert_eq!(sorted(store.live_rows(FileKind::Data)), sorted(rows));
}

#[test]
fn small_target_rolls_several_outputs_but_fewer_than_inputs() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let (committables, rows) = written(&store, &options(1 << 20), 40);
    let inputs = changelog_files(&committables);
    let largest = inputs
        .iter()
        .map(|file| file.file_size)
        .max()
        .expect("changelog files");
    let target = largest * 2;

    let compacted = compact(&store, target, committables);
    let outputs = changelog_files(&compacted);
    assert!(outputs.len() > 1);
    assert!(outputs.len() < inputs.len());
    let total: u64 = outputs.iter().map(|file| file.file_size).sum();
    assert_eq!(total, inputs.iter().map(|file| file.file_size).sum::<u64>());

    commit(&store, compacted);
    assert_eq!(sorted(store.live_rows(FileKind::Changelog)), sorted(rows));
}

#[test]
fn sorter_output_is_independent_of_arrival_order() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let (committables, _) = written(&store, &options(1 << 20), 10);

    let mut forward = ChangelogCompactSorter::new();
    for committable in committables.iter().cloned() {
        forward.process(committable).expect("sorter");
    }
    let mut reverse = ChangelogCompactSorter::new();
    for committable in committables.iter().rev().cloned() {
        reverse.process(committable).expect("sorter");
    }

    let first = forward.flush(1);
    let second = reverse.flush(1);
    assert_eq!(first, second);
    for committable in &first {
        let message = committable.message().expect("message");
        let times: Vec<u64> = message
            .new_files
            .iter()
            .map(|file| file.creation_time_ms)
            .collect();
        let mut ordered = times.clone();
        ordered.sort();
        assert_eq!(times, ordered);
    }
}

#[test]
fn sorter_holds_later_checkpoints_back() {
    let mut sorter = ChangelogCompactSorter::new();
    sorter
        .process(Committable::file(1, 0, CommitMessage::new("p", 0)))
        .expect("epoch 1");
    sorter
        .process(Committable::file(2, 0, CommitMessage::new("p", 0)))
        .expect("epoch 2");

    let flushed = sorter.flush(1);
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].checkpoint_id(), 1);
    assert!(!sorter.is_empty());
    assert_eq!(sorter.end_input().len(), 1);
    assert!(sorter.is_empty());
}

#[test]
fn messages_without_changelog_pass_the_coordinator_unchanged() {
    let mut coordinator = ChangelogCompactCoordinator::new(1);
    let message = CommitMessage::new("p", 2).with_new_files(vec![DataFileMeta {
        file_name: "data-2-00000001".into(),
        kind: FileKind::Data,
        file_size: 10,
        row_count: 1,
        creation_time_ms: 5,
    }]);
    let input = Committable::file(3, 1, message);

    let out = coordinator.process(input.clone()).expect("coordinator");
    assert_eq!(out, vec![input]);
    assert_eq!(coordinator.pending_partitions(), 0);
    assert!(coordinator.end_input().is_empty());
}

#[test]
fn worker_surfaces_read_failures_as_compaction_failure() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let file = store
        .write_file("p", 0, FileKind::Changelog, vec![Row::insert("a", "v")], 1)
        .expect("write changelog");
    let mut task = ChangelogCompactTask::new(9, "p");
    task.add_new_file_changelogs(0, vec![file.clone()]);
    store.fail_next(
        FaultPoint::ReadFile,
        StoreError::Io {
            reason: "disk gone".into(),
        },
    );

    let mut worker = ChangelogCompactWorker::new(3, store.clone(), 1 << 20);
    let err = worker
        .process(Committable::new(9, 0, CommittableKind::CompactTask(task)))
        .expect_err("read fails");
    match err {
        SinkError::CompactionFailure {
            checkpoint_id,
            partition,
            source,
        } => {
            assert_eq!(checkpoint_id, 9);
            assert_eq!(partition, "p");
            assert!(source.is_retryable());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(store.file_exists(&file.file_name));
    assert_eq!(worker.executed(), 0);
}

#[test]
fn misrouted_committables_are_rejected() {
    let task = || {
        Committable::new(
            4,
            0,
            CommittableKind::CompactTask(ChangelogCompactTask::new(4, "p")),
        )
    };

    let mut coordinator = ChangelogCompactCoordinator::new(1);
    match coordinator.process(task()) {
        Err(SinkError::UnexpectedCommittable { stage, .. }) => {
            assert_eq!(stage, "changelog-compact-coordinator");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let mut sorter = ChangelogCompactSorter::new();
    match sorter.process(task()) {
        Err(SinkError::UnexpectedCommittable { stage, .. }) => {
            assert_eq!(stage, "changelog-compact-sorter");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
