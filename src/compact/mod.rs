//! Pre-commit changelog compaction.
//!
//! Writers emit one small changelog file per bucket and checkpoint. The
//! [`ChangelogCompactCoordinator`] (single instance) strips changelog files out
//! of every message, forwards the remainder, and groups the files per partition
//! into [`ChangelogCompactTask`]s once they reach the target size or the
//! checkpoint closes. [`ChangelogCompactWorker`]s merge the files of a task into
//! fewer, larger ones. The [`ChangelogCompactSorter`] (single instance) buffers
//! everything of a checkpoint and re-emits it ordered by file creation time.

mod coordinator;
mod sorter;
mod task;
mod worker;

pub use coordinator::ChangelogCompactCoordinator;
pub use sorter::ChangelogCompactSorter;
pub use task::ChangelogCompactTask;
pub use worker::ChangelogCompactWorker;

use crate::committable::DataFileMeta;
use std::cmp::Ordering;

/// Orders files by creation time, then by name for ties.
pub(crate) fn by_creation_time(a: &DataFileMeta, b: &DataFileMeta) -> Ordering {
    a.creation_time_ms
        .cmp(&b.creation_time_ms)
        .then_with(|| a.file_name.cmp(&b.file_name))
}
