use super::{CommitHook, ManifestCommittable};
use crate::committable::CheckpointId;
use crate::error::{SinkError, StoreError};
use crate::gate::CheckpointBarrier;
use crate::store::{Snapshot, TableStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SAVEPOINT_TAG_PREFIX: &str = "savepoint-";

/// Tags the snapshot produced by every savepoint checkpoint.
///
/// A savepoint whose epoch is skipped as empty produces no snapshot and so no
/// tag; set `commit.force-create-snapshot` to tag every savepoint.
pub struct AutoTagForSavepoint {
    store: Arc<dyn TableStore>,
    time_retained: Option<Duration>,
    savepoints: BTreeSet<CheckpointId>,
    tagged: BTreeSet<CheckpointId>,
}

impl AutoTagForSavepoint {
    pub fn new(store: Arc<dyn TableStore>, time_retained: Option<Duration>) -> Self {
        Self {
            store,
            time_retained,
            savepoints: BTreeSet::new(),
            tagged: BTreeSet::new(),
        }
    }

    pub fn tag_name(checkpoint_id: CheckpointId) -> String {
        format!("{SAVEPOINT_TAG_PREFIX}{checkpoint_id}")
    }

    /// Savepoints seen but not yet tagged or aborted.
    pub fn tracked(&self) -> Vec<CheckpointId> {
        self.savepoints.iter().copied().collect()
    }

    /// Savepoints tagged whose tag an abort may still remove.
    pub fn tagged(&self) -> Vec<CheckpointId> {
        self.tagged.iter().copied().collect()
    }
}

impl CommitHook for AutoTagForSavepoint {
    fn name(&self) -> &'static str {
        "auto-tag-for-savepoint"
    }

    fn on_checkpoint(&mut self, barrier: &CheckpointBarrier) {
        if barrier.is_savepoint() {
            self.savepoints.insert(barrier.checkpoint_id);
        }
    }

    fn on_checkpoint_aborted(&mut self, checkpoint_id: CheckpointId) -> Result<(), SinkError> {
        self.savepoints.remove(&checkpoint_id);
        if !self.tagged.remove(&checkpoint_id) {
            return Ok(());
        }
        let name = Self::tag_name(checkpoint_id);
        match self.store.delete_tag(&name) {
            Ok(()) => {
                info!(checkpoint_id, tag = %name, "removed tag of aborted savepoint");
                Ok(())
            }
            Err(StoreError::TagNotFound { .. }) => Ok(()),
            Err(err) => Err(SinkError::TagCreation {
                name,
                reason: err.to_string(),
            }),
        }
    }

    fn on_checkpoint_committed(&mut self, checkpoint_id: CheckpointId) {
        if self.savepoints.contains(&checkpoint_id) {
            debug!(checkpoint_id, "savepoint produced no snapshot, no tag");
        }
        self.savepoints.retain(|id| *id > checkpoint_id);
        self.tagged.retain(|id| *id >= checkpoint_id);
    }

    fn post_commit(
        &mut self,
        committable: &ManifestCommittable,
        snapshot: &Snapshot,
    ) -> Result<(), SinkError> {
        let checkpoint_id = committable.identifier();
        if !self.savepoints.remove(&checkpoint_id) {
            return Ok(());
        }
        let name = Self::tag_name(checkpoint_id);
        match self.store.create_tag(snapshot, &name, self.time_retained) {
            Ok(tag) => {
                info!(checkpoint_id, tag = %tag.name, snapshot_id = tag.snapshot_id, "tagged savepoint");
                self.tagged.insert(checkpoint_id);
                Ok(())
            }
            Err(StoreError::TagExists { .. }) => {
                warn!(checkpoint_id, tag = %name, "savepoint tag already exists");
                self.tagged.insert(checkpoint_id);
                Ok(())
            }
            Err(err) => Err(SinkError::TagCreation {
                name,
                reason: err.to_string(),
            }),
        }
    }
}
