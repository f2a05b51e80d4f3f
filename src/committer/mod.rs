//! Global committer: aggregation, apply, state and commit hooks.
//!
//! The [`Committer`] trait is the seam between the committer operator's epoch
//! bookkeeping and the table store. [`StoreCommitter`] applies one
//! [`ManifestCommittable`] per checkpoint with a bounded retry budget for
//! transient failures. Hooks ([`CommitHook`]) observe checkpoints and successful
//! commits and add independently failable side effects such as tags.

mod auto_tag;
mod batch_tag;
mod hooks;
mod manifest;
mod operator;
mod state;

pub use auto_tag::{AutoTagForSavepoint, SAVEPOINT_TAG_PREFIX};
pub use batch_tag::{BatchTagGenerator, BATCH_TAG_PREFIX};
pub use hooks::CommitHook;
pub use manifest::ManifestCommittable;
pub use operator::{CommitterMetrics, CommitterOperator, CommitterOperatorBuilder, EpochPhase};
pub use state::{
    CommittableStateManager, CommitterState, FileStateBackend, MemoryStateBackend,
    NoopCommittableStateManager, PersistedState, RestoreCommittableStateManager, StateBackend,
    STATE_FORMAT_VERSION,
};

use crate::committable::{CheckpointId, Committable, CommittableKind};
use crate::config::{EmptyCommitPolicy, RetryPolicy};
use crate::error::SinkError;
use crate::store::{Snapshot, TableStore};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// How a checkpoint's commit concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// A new snapshot was created.
    Committed,
    /// Nothing to apply and empty snapshots are not requested.
    SkippedEmpty,
    /// The store already holds this checkpoint for the same commit user.
    AlreadyCommitted,
}

/// Result of committing one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub checkpoint_id: CheckpointId,
    pub status: CommitStatus,
    pub snapshot: Option<Snapshot>,
    pub attempts: u32,
    /// Non-fatal hook failures reported after the commit became durable.
    pub hook_failures: Vec<String>,
}

impl CommitOutcome {
    fn new(
        checkpoint_id: CheckpointId,
        status: CommitStatus,
        snapshot: Option<Snapshot>,
        attempts: u32,
    ) -> Self {
        Self {
            checkpoint_id,
            status,
            snapshot,
            attempts,
            hook_failures: Vec::new(),
        }
    }
}

/// Turns checkpoint committables into applied snapshots.
pub trait Committer: Send {
    fn commit_user(&self) -> &str;

    /// Merges the committables of one checkpoint into a single commit unit.
    fn combine(
        &self,
        checkpoint_id: CheckpointId,
        watermark: Option<i64>,
        committables: Vec<Committable>,
    ) -> Result<ManifestCommittable, SinkError>;

    fn commit(&mut self, committable: &ManifestCommittable) -> Result<CommitOutcome, SinkError>;

    /// Commits restored units, skipping those the store already recorded for this user.
    fn filter_and_commit(
        &mut self,
        committables: Vec<ManifestCommittable>,
    ) -> Result<Vec<CommitOutcome>, SinkError>;
}

/// Committer applying units to a [`TableStore`].
pub struct StoreCommitter {
    store: Arc<dyn TableStore>,
    commit_user: String,
    retry: RetryPolicy,
    empty_commit: EmptyCommitPolicy,
}

impl StoreCommitter {
    pub fn new(
        store: Arc<dyn TableStore>,
        commit_user: impl Into<String>,
        retry: RetryPolicy,
        empty_commit: EmptyCommitPolicy,
    ) -> Self {
        Self {
            store,
            commit_user: commit_user.into(),
            retry,
            empty_commit,
        }
    }

    /// Snapshot of this user covering `checkpoint_id`, when an earlier attempt already landed it.
    fn landed_snapshot(&self, checkpoint_id: CheckpointId) -> Option<Snapshot> {
        self.store
            .latest_snapshot_of(&self.commit_user)
            .filter(|snapshot| checkpoint_id <= snapshot.commit_identifier)
    }
}

impl Committer for StoreCommitter {
    fn commit_user(&self) -> &str {
        &self.commit_user
    }

    fn combine(
        &self,
        checkpoint_id: CheckpointId,
        watermark: Option<i64>,
        committables: Vec<Committable>,
    ) -> Result<ManifestCommittable, SinkError> {
        let mut manifest = ManifestCommittable::new(checkpoint_id, watermark);
        for committable in committables {
            let stamped = committable.checkpoint_id();
            match committable.into_kind() {
                CommittableKind::File(message) | CommittableKind::CompactResult(message) => {
                    manifest.add_message(message);
                }
                kind @ CommittableKind::CompactTask(_) => {
                    return Err(SinkError::UnexpectedCommittable {
                        stage: "committer",
                        kind: kind.as_str(),
                        checkpoint_id: stamped,
                    });
                }
            }
        }
        Ok(manifest)
    }

    fn commit(&mut self, committable: &ManifestCommittable) -> Result<CommitOutcome, SinkError> {
        let checkpoint_id = committable.identifier();
        if committable.is_empty() && self.empty_commit == EmptyCommitPolicy::Skip {
            debug!(checkpoint_id, "skipping empty commit");
            return Ok(CommitOutcome::new(
                checkpoint_id,
                CommitStatus::SkippedEmpty,
                None,
                0,
            ));
        }
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > 1 {
                if let Some(snapshot) = self.landed_snapshot(checkpoint_id) {
                    info!(
                        checkpoint_id,
                        attempts,
                        snapshot_id = snapshot.id,
                        "commit landed on an earlier attempt"
                    );
                    return Ok(CommitOutcome::new(
                        checkpoint_id,
                        CommitStatus::AlreadyCommitted,
                        Some(snapshot),
                        attempts,
                    ));
                }
            }
            match self.store.apply_commit(committable, &self.commit_user) {
                Ok(snapshot) => {
                    info!(
                        checkpoint_id,
                        snapshot_id = snapshot.id,
                        files = committable.file_count(),
                        attempts,
                        "committed snapshot"
                    );
                    return Ok(CommitOutcome::new(
                        checkpoint_id,
                        CommitStatus::Committed,
                        Some(snapshot),
                        attempts,
                    ));
                }
                Err(err) if err.is_retryable() && attempts <= self.retry.max_retries => {
                    let wait = self.retry.backoff(attempts);
                    warn!(checkpoint_id, attempts, ?wait, error = %err, "retrying commit");
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                }
                Err(err) if err.is_retryable() => {
                    return Err(SinkError::TransientApplyConflict {
                        checkpoint_id,
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    return Err(SinkError::FatalApply {
                        checkpoint_id,
                        source: err,
                    });
                }
            }
        }
    }

    fn filter_and_commit(
        &mut self,
        mut committables: Vec<ManifestCommittable>,
    ) -> Result<Vec<CommitOutcome>, SinkError> {
        committables.sort_by_key(ManifestCommittable::identifier);
        let latest = self.store.latest_committed_identifier(&self.commit_user);
        let mut outcomes = Vec::with_capacity(committables.len());
        for committable in committables {
            let checkpoint_id = committable.identifier();
            if latest.is_some_and(|latest| checkpoint_id <= latest) {
                info!(checkpoint_id, "restored checkpoint already in table, not reapplying");
                outcomes.push(CommitOutcome::new(
                    checkpoint_id,
                    CommitStatus::AlreadyCommitted,
                    None,
                    0,
                ));
                continue;
            }
            outcomes.push(self.commit(&committable)?);
        }
        Ok(outcomes)
    }
}
