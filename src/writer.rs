//! Write stage: buffers records per bucket and turns them into files at each
//! checkpoint boundary.

use crate::clock::{Clock, CreationTicker, SystemClock};
use crate::committable::{
    CheckpointId, CommitMessage, Committable, DataFileMeta, FileKind, ProducerId, Row, RowKind,
    END_INPUT_CHECKPOINT_ID,
};
use crate::config::{ChangelogProducer, SinkOptions};
use crate::error::SinkError;
use crate::store::TableStore;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// One mutation delivered to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub partition: String,
    pub kind: RowKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl SinkRecord {
    pub fn insert(
        partition: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            partition: partition.into(),
            kind: RowKind::Insert,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(partition: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            partition: partition.into(),
            kind: RowKind::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// Parallel writer instance producing file committables.
pub struct StoreSinkWriter<C: Clock = SystemClock> {
    producer: ProducerId,
    commit_user: String,
    store: Arc<dyn TableStore>,
    ticker: CreationTicker<C>,
    num_buckets: u32,
    emit_changelog: bool,
    buffers: BTreeMap<(String, u32), Vec<Row>>,
    last_prepared: Option<CheckpointId>,
    records_written: u64,
}

impl StoreSinkWriter<SystemClock> {
    pub fn new(
        producer: ProducerId,
        commit_user: impl Into<String>,
        store: Arc<dyn TableStore>,
        options: &SinkOptions,
        has_primary_keys: bool,
    ) -> Self {
        Self::with_clock(producer, commit_user, store, options, has_primary_keys, SystemClock)
    }
}

impl<C: Clock> StoreSinkWriter<C> {
    pub fn with_clock(
        producer: ProducerId,
        commit_user: impl Into<String>,
        store: Arc<dyn TableStore>,
        options: &SinkOptions,
        has_primary_keys: bool,
        clock: C,
    ) -> Self {
        Self {
            producer,
            commit_user: commit_user.into(),
            store,
            ticker: CreationTicker::new(clock),
            num_buckets: options.num_buckets.max(1),
            emit_changelog: has_primary_keys
                && options.changelog_producer == ChangelogProducer::Input,
            buffers: BTreeMap::new(),
            last_prepared: None,
            records_written: 0,
        }
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    pub fn commit_user(&self) -> &str {
        &self.commit_user
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn bucket_of(&self, key: &[u8]) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.num_buckets)) as u32
    }

    pub fn write(&mut self, record: SinkRecord) -> Result<(), SinkError> {
        if self.last_prepared == Some(END_INPUT_CHECKPOINT_ID) {
            return Err(self.failure("record after end of input".to_string()));
        }
        let bucket = self.bucket_of(&record.key);
        self.buffers
            .entry((record.partition, bucket))
            .or_default()
            .push(Row::new(record.kind, record.key, record.value));
        self.records_written += 1;
        Ok(())
    }

    /// Flushes every buffered bucket into files stamped with `checkpoint_id`.
    ///
    /// Checkpoint ids must strictly increase; an empty buffer yields no committables.
    pub fn prepare_commit(&mut self, checkpoint_id: CheckpointId) -> Result<Vec<Committable>, SinkError> {
        if let Some(last) = self.last_prepared {
            if checkpoint_id <= last {
                return Err(self.failure(format!(
                    "checkpoint {checkpoint_id} does not follow prepared checkpoint {last}"
                )));
            }
        }
        let buffers = std::mem::take(&mut self.buffers);
        let mut committables = Vec::with_capacity(buffers.len());
        for ((partition, bucket), rows) in buffers {
            let data = self.write_file(&partition, bucket, FileKind::Data, rows.clone())?;
            let mut message = CommitMessage::new(partition.clone(), bucket).with_new_files(vec![data]);
            if self.emit_changelog {
                let changelog = self.write_file(&partition, bucket, FileKind::Changelog, rows)?;
                message.changelog_files.push(changelog);
            }
            committables.push(Committable::file(checkpoint_id, self.producer, message));
        }
        self.last_prepared = Some(checkpoint_id);
        debug!(
            producer = self.producer,
            checkpoint_id,
            committables = committables.len(),
            "prepared commit"
        );
        Ok(committables)
    }

    /// Flushes the remainder of a bounded input under the end-of-input identifier.
    pub fn end_input(&mut self) -> Result<Vec<Committable>, SinkError> {
        self.prepare_commit(END_INPUT_CHECKPOINT_ID)
    }

    fn write_file(
        &mut self,
        partition: &str,
        bucket: u32,
        kind: FileKind,
        rows: Vec<Row>,
    ) -> Result<DataFileMeta, SinkError> {
        let created = self.ticker.next_tick_ms();
        self.store
            .write_file(partition, bucket, kind, rows, created)
            .map_err(|err| self.failure(err.to_string()))
    }

    fn failure(&self, reason: String) -> SinkError {
        SinkError::Write {
            producer: self.producer,
            reason,
        }
    }
}
