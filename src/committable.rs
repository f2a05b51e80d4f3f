//! Messages flowing from the write stage toward the global committer.
//!
//! Every [`Committable`] is stamped with the checkpoint it belongs to and the
//! instance that produced it. The payload is one of three kinds: file changes
//! produced by a writer, a changelog compaction task issued by the coordinator,
//! or the file changes produced by executing such a task.

use crate::compact::ChangelogCompactTask;
use serde::{Deserialize, Serialize};

/// Checkpoint epoch identifier assigned by the execution substrate.
pub type CheckpointId = u64;

/// Identifier used for the commit issued at end of input in bounded runs.
pub const END_INPUT_CHECKPOINT_ID: CheckpointId = u64::MAX;

/// Index of the parallel instance that produced a committable.
pub type ProducerId = u32;

/// Change type carried by a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowKind {
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

/// Logical row stored in data and changelog files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Row {
    pub kind: RowKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Row {
    pub fn new(kind: RowKind, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(RowKind::Insert, key, value)
    }

    /// Approximate encoded size used for file sizing decisions.
    pub fn encoded_len(&self) -> u64 {
        (self.key.len() + self.value.len() + 1) as u64
    }
}

/// Whether a file holds table data or changelog rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Data,
    Changelog,
}

/// Metadata of one physical file written into the table's storage area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFileMeta {
    pub file_name: String,
    pub kind: FileKind,
    pub file_size: u64,
    pub row_count: u64,
    pub creation_time_ms: u64,
}

/// File-level changes for one bucket of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub partition: String,
    pub bucket: u32,
    pub new_files: Vec<DataFileMeta>,
    pub changelog_files: Vec<DataFileMeta>,
    pub compact_before: Vec<DataFileMeta>,
    pub compact_after: Vec<DataFileMeta>,
    pub compact_changelog_files: Vec<DataFileMeta>,
}

impl CommitMessage {
    pub fn new(partition: impl Into<String>, bucket: u32) -> Self {
        Self {
            partition: partition.into(),
            bucket,
            ..Self::default()
        }
    }

    pub fn with_new_files(mut self, files: Vec<DataFileMeta>) -> Self {
        self.new_files = files;
        self
    }

    pub fn with_changelog_files(mut self, files: Vec<DataFileMeta>) -> Self {
        self.changelog_files = files;
        self
    }

    pub fn with_compact_changelog_files(mut self, files: Vec<DataFileMeta>) -> Self {
        self.compact_changelog_files = files;
        self
    }

    pub fn has_changelog(&self) -> bool {
        !self.changelog_files.is_empty() || !self.compact_changelog_files.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.compact_before.is_empty()
            && self.compact_after.is_empty()
            && !self.has_changelog()
    }

    /// Number of files this message adds to the table.
    pub fn file_count(&self) -> usize {
        self.new_files.len()
            + self.changelog_files.len()
            + self.compact_after.len()
            + self.compact_changelog_files.len()
    }

    /// Splits changelog files off, returning them as `(new, compact)` and leaving the rest.
    pub fn take_changelogs(&mut self) -> (Vec<DataFileMeta>, Vec<DataFileMeta>) {
        (
            std::mem::take(&mut self.changelog_files),
            std::mem::take(&mut self.compact_changelog_files),
        )
    }

    /// Appends every file list of `other` into `self`.
    pub fn absorb(&mut self, other: CommitMessage) {
        self.new_files.extend(other.new_files);
        self.changelog_files.extend(other.changelog_files);
        self.compact_before.extend(other.compact_before);
        self.compact_after.extend(other.compact_after);
        self.compact_changelog_files
            .extend(other.compact_changelog_files);
    }
}

/// Payload carried by a [`Committable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommittableKind {
    File(CommitMessage),
    CompactTask(ChangelogCompactTask),
    CompactResult(CommitMessage),
}

impl CommittableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommittableKind::File(_) => "file",
            CommittableKind::CompactTask(_) => "compact-task",
            CommittableKind::CompactResult(_) => "compact-result",
        }
    }
}

/// Immutable, checkpoint-stamped unit flowing toward the committer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committable {
    checkpoint_id: CheckpointId,
    producer: ProducerId,
    kind: CommittableKind,
}

impl Committable {
    pub fn new(checkpoint_id: CheckpointId, producer: ProducerId, kind: CommittableKind) -> Self {
        Self {
            checkpoint_id,
            producer,
            kind,
        }
    }

    pub fn file(checkpoint_id: CheckpointId, producer: ProducerId, message: CommitMessage) -> Self {
        Self::new(checkpoint_id, producer, CommittableKind::File(message))
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    pub fn kind(&self) -> &CommittableKind {
        &self.kind
    }

    pub fn into_kind(self) -> CommittableKind {
        self.kind
    }

    /// Returns the file changes when this committable carries any.
    pub fn message(&self) -> Option<&CommitMessage> {
        match &self.kind {
            CommittableKind::File(message) | CommittableKind::CompactResult(message) => {
                Some(message)
            }
            CommittableKind::CompactTask(_) => None,
        }
    }
}
