use crate::committable::{Committable, CommittableKind, ProducerId};
use crate::error::SinkError;
use crate::store::TableStore;
use std::sync::Arc;
use tracing::error;

/// One parallel instance executing compaction tasks.
///
/// Anything that is not a task is forwarded unchanged so the sorter sees the
/// full output of a checkpoint.
pub struct ChangelogCompactWorker {
    producer: ProducerId,
    store: Arc<dyn TableStore>,
    target_file_size: u64,
    executed: u64,
}

impl ChangelogCompactWorker {
    pub fn new(producer: ProducerId, store: Arc<dyn TableStore>, target_file_size: u64) -> Self {
        Self {
            producer,
            store,
            target_file_size,
            executed: 0,
        }
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    /// Number of tasks executed so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn process(&mut self, committable: Committable) -> Result<Vec<Committable>, SinkError> {
        let results = match committable.kind() {
            CommittableKind::CompactTask(task) => task
                .execute(self.store.as_ref(), self.target_file_size, self.producer)
                .inspect_err(|err| {
                    error!(producer = self.producer, error = %err, "changelog compaction failed");
                })?,
            _ => return Ok(vec![committable]),
        };
        self.executed += 1;
        Ok(results)
    }
}
