//! Table Store collaborator consumed by the commit path.
//!
//! The store owns physical files, snapshots and tags. The sink only asks it to
//! write or read files, atomically apply one [`ManifestCommittable`] as a new
//! snapshot, and manage tags.

mod memory;

pub use memory::{FaultPoint, InMemoryTableStore};

use crate::committable::{CheckpointId, DataFileMeta, FileKind, Row};
use crate::committer::ManifestCommittable;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of change recorded by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    Append,
    Compact,
}

/// Immutable result of one successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub commit_user: String,
    pub commit_identifier: CheckpointId,
    pub commit_kind: CommitKind,
    pub time_millis: u64,
    pub watermark: Option<i64>,
    pub added_files: usize,
}

/// Named, retained pointer to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub snapshot_id: u64,
    pub created_at_ms: u64,
    pub time_retained: Option<Duration>,
}

/// Storage operations the commit protocol depends on.
pub trait TableStore: Send + Sync {
    fn table_name(&self) -> &str;

    /// Writes `rows` as a new, not yet committed file.
    fn write_file(
        &self,
        partition: &str,
        bucket: u32,
        kind: FileKind,
        rows: Vec<Row>,
        creation_time_ms: u64,
    ) -> Result<DataFileMeta, StoreError>;

    fn read_file(&self, file: &DataFileMeta) -> Result<Vec<Row>, StoreError>;

    /// Removes a file that no snapshot references.
    fn delete_file(&self, file: &DataFileMeta) -> Result<(), StoreError>;

    /// Atomically applies one commit unit, producing the next snapshot.
    fn apply_commit(
        &self,
        committable: &ManifestCommittable,
        commit_user: &str,
    ) -> Result<Snapshot, StoreError>;

    fn latest_snapshot(&self) -> Option<Snapshot>;

    /// Newest snapshot created by `commit_user`, if any.
    fn latest_snapshot_of(&self, commit_user: &str) -> Option<Snapshot>;

    /// Highest commit identifier recorded by `commit_user`, if any.
    fn latest_committed_identifier(&self, commit_user: &str) -> Option<CheckpointId> {
        self.latest_snapshot_of(commit_user)
            .map(|snapshot| snapshot.commit_identifier)
    }

    fn create_tag(
        &self,
        snapshot: &Snapshot,
        name: &str,
        time_retained: Option<Duration>,
    ) -> Result<Tag, StoreError>;

    fn list_tags(&self) -> Result<Vec<Tag>, StoreError>;

    fn delete_tag(&self, name: &str) -> Result<(), StoreError>;
}
