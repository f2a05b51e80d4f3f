use std::sync::Arc;

use tablesink::{
    ChangelogProducer, CommittableKind, FaultPoint, FileKind, InMemoryTableStore, ManualClock,
    RowKind, SinkError, SinkOptions, SinkRecord, StoreError, StoreSinkWriter, TableStore,
    END_INPUT_CHECKPOINT_ID,
};

fn writer(
    store: &Arc<InMemoryTableStore>,
    options: &SinkOptions,
    has_primary_keys: bool,
) -> StoreSinkWriter<ManualClock> {
    StoreSinkWriter::with_clock(
        2,
        "job-a",
        store.clone(),
        options,
        has_primary_keys,
        ManualClock::fixed(500),
    )
}

fn changelog_input(num_buckets: u32) -> SinkOptions {
    SinkOptions {
        num_buckets,
        changelog_producer: ChangelogProducer::Input,
        ..SinkOptions::default()
    }
}

#[test]
fn prepare_commit_emits_one_committable_per_bucket() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let options = SinkOptions {
        num_buckets: 3,
        ..SinkOptions::default()
    };
    let mut writer = writer(&store, &options, false);
    let mut buckets = std::collections::BTreeSet::new();
    for idx in 0..30u32 {
        let key = idx.to_be_bytes().to_vec();
        buckets.insert(writer.bucket_of(&key));
        writer
            .write(SinkRecord::insert("p", key, "v"))
            .expect("write");
    }
    assert_eq!(writer.records_written(), 30);

    let committables = writer.prepare_commit(4).expect("prepare commit");
    assert_eq!(committables.len(), buckets.len());
    let mut rows = 0;
    for committable in &committables {
        assert_eq!(committable.checkpoint_id(), 4);
        assert_eq!(committable.producer(), 2);
        assert!(matches!(committable.kind(), CommittableKind::File(_)));
        let message = committable.message().expect("file message");
        assert!(buckets.contains(&message.bucket));
        assert_eq!(message.new_files.len(), 1);
        assert!(message.changelog_files.is_empty());
        rows += message.new_files[0].row_count;
    }
    assert_eq!(rows, 30);
}

#[test]
fn primary_key_table_with_input_producer_writes_changelog_files() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let mut writer = writer(&store, &changelog_input(1), true);
    writer
        .write(SinkRecord::insert("p", "a", "1"))
        .expect("insert");
    writer.write(SinkRecord::delete("p", "b")).expect("delete");

    let committables = writer.prepare_commit(1).expect("prepare commit");
    assert_eq!(committables.len(), 1);
    let message = committables[0].message().expect("file message");
    assert_eq!(message.changelog_files.len(), 1);
    let changelog = &message.changelog_files[0];
    assert_eq!(changelog.kind, FileKind::Changelog);
    assert_eq!(changelog.row_count, 2);
    assert!(changelog.creation_time_ms > message.new_files[0].creation_time_ms);
    let rows = store.read_file(changelog).expect("read");
    assert_eq!(rows[1].kind, RowKind::Delete);
}

#[test]
fn append_tables_never_write_changelog_files() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let mut writer = writer(&store, &changelog_input(1), false);
    writer
        .write(SinkRecord::insert("p", "a", "1"))
        .expect("insert");
    let committables = writer.prepare_commit(1).expect("prepare commit");
    let message = committables[0].message().expect("file message");
    assert!(message.changelog_files.is_empty());
}

#[test]
fn empty_buffer_yields_no_committables() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let mut writer = writer(&store, &SinkOptions::default(), false);
    assert!(writer.prepare_commit(1).expect("prepare").is_empty());
    assert!(writer.prepare_commit(2).expect("prepare").is_empty());
    assert!(store.live_files().is_empty());
}

#[test]
fn checkpoint_ids_must_increase() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let mut writer = writer(&store, &SinkOptions::default(), false);
    writer.prepare_commit(5).expect("prepare 5");

    match writer.prepare_commit(5) {
        Err(SinkError::Write { producer, reason }) => {
            assert_eq!(producer, 2);
            assert!(reason.contains("does not follow"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn end_input_flushes_under_the_end_identifier_and_closes_the_writer() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let mut writer = writer(&store, &SinkOptions::default(), false);
    writer
        .write(SinkRecord::insert("p", "a", "1"))
        .expect("insert");

    let committables = writer.end_input().expect("end input");
    assert_eq!(committables.len(), 1);
    assert_eq!(committables[0].checkpoint_id(), END_INPUT_CHECKPOINT_ID);
    assert!(matches!(
        writer.write(SinkRecord::insert("p", "b", "2")),
        Err(SinkError::Write { .. })
    ));
}

#[test]
fn store_failures_surface_as_write_errors() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let mut writer = writer(&store, &SinkOptions::default(), false);
    writer
        .write(SinkRecord::insert("p", "a", "1"))
        .expect("insert");
    store.fail_next(
        FaultPoint::WriteFile,
        StoreError::Io {
            reason: "no space left".into(),
        },
    );

    match writer.prepare_commit(1) {
        Err(SinkError::Write { reason, .. }) => assert!(reason.contains("no space left")),
        other => panic!("unexpected result: {:?}", other),
    }
}
