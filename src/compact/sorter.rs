use super::by_creation_time;
use crate::committable::{
    CheckpointId, CommitMessage, Committable, CommittableKind, END_INPUT_CHECKPOINT_ID,
};
use crate::error::SinkError;
use std::collections::BTreeMap;

const STAGE: &str = "changelog-compact-sorter";
const PRODUCER: u32 = 0;

/// Single-instance stage restoring a deterministic file order per checkpoint.
///
/// Buffers every message until its checkpoint closes, merging messages of the
/// same partition and bucket, then emits them in key order with every file list
/// sorted by creation time.
#[derive(Debug, Default)]
pub struct ChangelogCompactSorter {
    buffered: BTreeMap<(CheckpointId, String, u32), CommitMessage>,
}

impl ChangelogCompactSorter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, committable: Committable) -> Result<(), SinkError> {
        let checkpoint_id = committable.checkpoint_id();
        let message = match committable.into_kind() {
            CommittableKind::File(message) | CommittableKind::CompactResult(message) => message,
            other => {
                return Err(SinkError::UnexpectedCommittable {
                    stage: STAGE,
                    kind: other.as_str(),
                    checkpoint_id,
                });
            }
        };
        let key = (checkpoint_id, message.partition.clone(), message.bucket);
        match self.buffered.get_mut(&key) {
            Some(existing) => existing.absorb(message),
            None => {
                self.buffered.insert(key, message);
            }
        }
        Ok(())
    }

    /// Emits everything buffered for checkpoints up to `checkpoint_id`.
    pub fn flush(&mut self, checkpoint_id: CheckpointId) -> Vec<Committable> {
        let keep = match checkpoint_id.checked_add(1) {
            Some(next) => self.buffered.split_off(&(next, String::new(), 0)),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.buffered, keep);
        ready
            .into_iter()
            .map(|((checkpoint_id, _, _), mut message)| {
                message.new_files.sort_by(by_creation_time);
                message.changelog_files.sort_by(by_creation_time);
                message.compact_before.sort_by(by_creation_time);
                message.compact_after.sort_by(by_creation_time);
                message.compact_changelog_files.sort_by(by_creation_time);
                Committable::file(checkpoint_id, PRODUCER, message)
            })
            .collect()
    }

    pub fn end_input(&mut self) -> Vec<Committable> {
        self.flush(END_INPUT_CHECKPOINT_ID)
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}
