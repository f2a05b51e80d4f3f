use std::sync::{Arc, Mutex};

use tablesink::{
    CheckpointBarrier, CheckpointId, CommitMessage, CommitStatus, Committable, Committer,
    CommitterOperator, CommitterOperatorBuilder, EmptyCommitPolicy, EpochPhase, FaultPoint,
    FileKind, InMemoryTableStore, MemoryStateBackend, PersistedState,
    RestoreCommittableStateManager, RetryPolicy, Row, SinkError, StateBackend, StateError,
    StoreCommitter, StoreError, StreamElement, TableStore,
};

#[derive(Clone, Default)]
struct RecordingBackend {
    records: Arc<Mutex<Vec<PersistedState>>>,
}

impl RecordingBackend {
    fn handle(&self) -> Arc<Mutex<Vec<PersistedState>>> {
        self.records.clone()
    }
}

impl StateBackend for RecordingBackend {
    fn persist(&mut self, record: PersistedState) -> Result<(), StateError> {
        self.records.lock().expect("records lock").push(record);
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedState>, StateError> {
        Ok(self.records.lock().expect("records lock").last().cloned())
    }
}

fn builder(store: &Arc<InMemoryTableStore>, commit_user: &str) -> CommitterOperatorBuilder {
    let shared: Arc<dyn TableStore> = store.clone();
    CommitterOperatorBuilder::new(commit_user, move |user| {
        Box::new(StoreCommitter::new(
            shared,
            user,
            RetryPolicy::none(),
            EmptyCommitPolicy::Skip,
        )) as Box<dyn Committer>
    })
}

fn restored(
    store: &Arc<InMemoryTableStore>,
    backend: &MemoryStateBackend,
    commit_user: &str,
) -> CommitterOperator {
    builder(store, commit_user)
        .state_manager(RestoreCommittableStateManager::new(backend.clone()))
        .build()
}

fn committable(store: &InMemoryTableStore, checkpoint_id: CheckpointId) -> StreamElement {
    let file = store
        .write_file(
            "p",
            0,
            FileKind::Data,
            vec![Row::insert(checkpoint_id.to_be_bytes().to_vec(), "v")],
            checkpoint_id,
        )
        .expect("write data file");
    StreamElement::Committable(Committable::file(
        checkpoint_id,
        0,
        CommitMessage::new("p", 0).with_new_files(vec![file]),
    ))
}

fn commit_epoch(
    op: &mut CommitterOperator,
    store: &InMemoryTableStore,
    checkpoint_id: CheckpointId,
) -> Result<(), SinkError> {
    op.process(0, committable(store, checkpoint_id))?;
    op.process(
        0,
        StreamElement::Barrier(CheckpointBarrier::checkpoint(checkpoint_id)),
    )?;
    Ok(())
}

fn identifiers(store: &InMemoryTableStore) -> Vec<CheckpointId> {
    store
        .snapshots()
        .iter()
        .map(|snapshot| snapshot.commit_identifier)
        .collect()
}

#[test]
fn fatal_apply_keeps_epoch_pending_and_restart_recommits_it() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let backend = MemoryStateBackend::new();
    let mut op = restored(&store, &backend, "job-a");
    op.initialize().expect("initialize");
    commit_epoch(&mut op, &store, 5).expect("epoch 5");
    commit_epoch(&mut op, &store, 6).expect("epoch 6");

    store.fail_next(
        FaultPoint::Apply,
        StoreError::Integrity {
            reason: "schema mismatch".into(),
        },
    );
    let err = commit_epoch(&mut op, &store, 7).expect_err("apply rejected");
    match err {
        SinkError::FatalApply {
            checkpoint_id,
            source,
        } => {
            assert_eq!(checkpoint_id, 7);
            assert!(!source.is_retryable());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(op.last_committed(), Some(6));
    assert_eq!(op.phase(7), Some(EpochPhase::Failed));
    assert_eq!(op.pending_checkpoints(), vec![7]);
    assert_eq!(identifiers(&store), vec![5, 6]);
    drop(op);

    let mut restarted = restored(&store, &backend, "job-a");
    let outcomes = restarted.initialize().expect("restore");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].checkpoint_id, 7);
    assert_eq!(outcomes[0].status, CommitStatus::Committed);
    assert_eq!(restarted.last_committed(), Some(7));
    assert_eq!(restarted.metrics().recommitted, 1);
    assert!(restarted.pending_checkpoints().is_empty());
    assert_eq!(identifiers(&store), vec![5, 6, 7]);

    commit_epoch(&mut restarted, &store, 7).expect("redelivered epoch 7");
    assert_eq!(restarted.metrics().duplicates_discarded, 2);
    assert_eq!(identifiers(&store), vec![5, 6, 7]);
    commit_epoch(&mut restarted, &store, 8).expect("epoch 8");
    assert_eq!(identifiers(&store), vec![5, 6, 7, 8]);
}

#[test]
fn restart_after_apply_but_before_state_update_does_not_reapply() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let recording = RecordingBackend::default();
    let handle = recording.handle();
    let mut op = builder(&store, "job-a")
        .state_manager(RestoreCommittableStateManager::new(recording))
        .build();
    op.initialize().expect("initialize");
    commit_epoch(&mut op, &store, 5).expect("epoch 5");
    drop(op);

    let records = handle.lock().expect("records lock").clone();
    assert_eq!(records.len(), 3);
    let before_confirmation = records[1].clone();
    let backend = MemoryStateBackend::new();
    backend.overwrite(before_confirmation);

    let mut restarted = restored(&store, &backend, "job-a");
    let outcomes = restarted.initialize().expect("restore");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, CommitStatus::AlreadyCommitted);
    assert_eq!(restarted.last_committed(), Some(5));
    assert_eq!(restarted.metrics().recommitted, 0);
    assert_eq!(identifiers(&store), vec![5]);
    assert_eq!(store.apply_attempts(), 1);
}

#[test]
fn restored_commit_user_wins_over_new_one() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let backend = MemoryStateBackend::new();
    let mut op = restored(&store, &backend, "user-a");
    op.initialize().expect("initialize");
    commit_epoch(&mut op, &store, 1).expect("epoch 1");
    drop(op);

    let mut restarted = restored(&store, &backend, "user-b");
    restarted.initialize().expect("restore");
    assert_eq!(restarted.commit_user(), Some("user-a"));
    commit_epoch(&mut restarted, &store, 2).expect("epoch 2");
    let users: Vec<String> = store
        .snapshots()
        .into_iter()
        .map(|snapshot| snapshot.commit_user)
        .collect();
    assert_eq!(users, vec!["user-a".to_string(), "user-a".to_string()]);
}

#[test]
fn restart_after_recommit_fails_once_then_resumes() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let backend = MemoryStateBackend::new();
    let mut op = restored(&store, &backend, "job-a");
    op.initialize().expect("initialize");
    store.fail_next(
        FaultPoint::Apply,
        StoreError::Integrity {
            reason: "manifest unreadable".into(),
        },
    );
    assert!(commit_epoch(&mut op, &store, 2).is_err());
    drop(op);

    let mut first = builder(&store, "job-a")
        .state_manager(
            RestoreCommittableStateManager::new(backend.clone()).with_restart_after_recommit(true),
        )
        .build();
    match first.initialize() {
        Err(SinkError::RestartAfterRecommit { recommitted }) => assert_eq!(recommitted, 1),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(identifiers(&store), vec![2]);

    let mut second = builder(&store, "job-a")
        .state_manager(
            RestoreCommittableStateManager::new(backend.clone()).with_restart_after_recommit(true),
        )
        .build();
    let outcomes = second.initialize().expect("second restore");
    assert!(outcomes.is_empty());
    assert_eq!(second.last_committed(), Some(2));
}

#[test]
fn replayed_input_after_restore_is_discarded() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let backend = MemoryStateBackend::new();
    let mut op = restored(&store, &backend, "job-a");
    op.initialize().expect("initialize");
    commit_epoch(&mut op, &store, 5).expect("epoch 5");
    commit_epoch(&mut op, &store, 6).expect("epoch 6");
    drop(op);

    let mut restarted = restored(&store, &backend, "job-a");
    restarted.initialize().expect("restore");
    restarted
        .process(0, committable(&store, 6))
        .expect("replayed committable");
    assert_eq!(restarted.metrics().duplicates_discarded, 1);

    let outcomes = restarted
        .process(0, StreamElement::Barrier(CheckpointBarrier::checkpoint(6)))
        .expect("barrier at committed epoch");
    assert!(outcomes.is_empty());
    assert_eq!(restarted.metrics().duplicates_discarded, 2);
    assert_eq!(restarted.last_committed(), Some(6));
    assert_eq!(identifiers(&store), vec![5, 6]);

    commit_epoch(&mut restarted, &store, 7).expect("epoch 7");
    assert_eq!(identifiers(&store), vec![5, 6, 7]);
}

#[test]
fn pending_epochs_are_persisted_before_apply() {
    let store = Arc::new(InMemoryTableStore::new("orders"));
    let backend = MemoryStateBackend::new();
    let mut op = restored(&store, &backend, "job-a");
    op.initialize().expect("initialize");
    assert_eq!(backend.writes(), 1);

    commit_epoch(&mut op, &store, 1).expect("epoch 1");
    assert_eq!(backend.writes(), 3);
    let latest = backend.latest().expect("state persisted");
    assert_eq!(latest.sequence, 2);
}
