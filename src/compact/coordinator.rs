use super::ChangelogCompactTask;
use crate::committable::{
    CheckpointId, Committable, CommittableKind, DataFileMeta, END_INPUT_CHECKPOINT_ID,
};
use crate::error::SinkError;
use std::collections::BTreeMap;
use tracing::debug;

const STAGE: &str = "changelog-compact-coordinator";
const PRODUCER: u32 = 0;

/// Single-instance stage deciding which changelog files get merged.
#[derive(Debug)]
pub struct ChangelogCompactCoordinator {
    target_file_size: u64,
    pending: BTreeMap<(CheckpointId, String), ChangelogCompactTask>,
}

impl ChangelogCompactCoordinator {
    pub fn new(target_file_size: u64) -> Self {
        Self {
            target_file_size,
            pending: BTreeMap::new(),
        }
    }

    /// Strips changelog files from `committable`, forwarding the rest.
    ///
    /// Returns the forwarded message, if anything remains of it, and a task
    /// when the partition's accumulated changelogs reached the target size.
    /// Changelog files already at the target size stay in the forwarded message.
    pub fn process(&mut self, committable: Committable) -> Result<Vec<Committable>, SinkError> {
        let checkpoint_id = committable.checkpoint_id();
        let producer = committable.producer();
        let mut message = match committable.into_kind() {
            CommittableKind::File(message) if message.has_changelog() => message,
            CommittableKind::File(message) => {
                return Ok(vec![Committable::file(checkpoint_id, producer, message)]);
            }
            other => {
                return Err(SinkError::UnexpectedCommittable {
                    stage: STAGE,
                    kind: other.as_str(),
                    checkpoint_id,
                });
            }
        };

        let (new_changelogs, compact_changelogs) = message.take_changelogs();
        let (large, new_changelogs) = self.split_large(new_changelogs);
        message.changelog_files = large;
        let (large, compact_changelogs) = self.split_large(compact_changelogs);
        message.compact_changelog_files = large;

        let mut out = Vec::new();
        let partition = message.partition.clone();
        let bucket = message.bucket;
        if !message.is_empty() {
            out.push(Committable::file(checkpoint_id, producer, message));
        }
        if new_changelogs.is_empty() && compact_changelogs.is_empty() {
            return Ok(out);
        }

        let key = (checkpoint_id, partition);
        let task = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| ChangelogCompactTask::new(checkpoint_id, key.1.clone()));
        task.add_new_file_changelogs(bucket, new_changelogs);
        task.add_compact_changelogs(bucket, compact_changelogs);
        if task.total_file_size() >= self.target_file_size {
            if let Some(task) = self.pending.remove(&key) {
                debug!(
                    checkpoint_id,
                    partition = %task.partition,
                    files = task.file_count(),
                    "partition changelogs reached target size"
                );
                out.push(Self::emit(task));
            }
        }
        Ok(out)
    }

    /// Emits tasks for everything accumulated up to `checkpoint_id`.
    pub fn prepare_snapshot_pre_barrier(&mut self, checkpoint_id: CheckpointId) -> Vec<Committable> {
        let keep = match checkpoint_id.checked_add(1) {
            Some(next) => self.pending.split_off(&(next, String::new())),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.pending, keep);
        ready.into_values().map(Self::emit).collect()
    }

    pub fn end_input(&mut self) -> Vec<Committable> {
        self.prepare_snapshot_pre_barrier(END_INPUT_CHECKPOINT_ID)
    }

    /// Partitions with changelogs not yet turned into tasks.
    pub fn pending_partitions(&self) -> usize {
        self.pending.len()
    }

    /// Splits `files` into `(large, small)`. Files already at the target size are left alone.
    fn split_large(&self, files: Vec<DataFileMeta>) -> (Vec<DataFileMeta>, Vec<DataFileMeta>) {
        files
            .into_iter()
            .partition(|file| file.file_size >= self.target_file_size)
    }

    fn emit(task: ChangelogCompactTask) -> Committable {
        Committable::new(task.checkpoint_id, PRODUCER, CommittableKind::CompactTask(task))
    }
}
