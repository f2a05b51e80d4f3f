use super::by_creation_time;
use crate::committable::{
    CheckpointId, CommitMessage, Committable, CommittableKind, DataFileMeta, FileKind, ProducerId,
    Row,
};
use crate::error::{SinkError, StoreError};
use crate::store::TableStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Changelog files of one partition to be merged, grouped by source bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogCompactTask {
    pub checkpoint_id: CheckpointId,
    pub partition: String,
    /// Changelog files produced alongside newly written data files.
    pub new_file_changelogs: BTreeMap<u32, Vec<DataFileMeta>>,
    /// Changelog files produced by bucket-level compaction.
    pub compact_changelogs: BTreeMap<u32, Vec<DataFileMeta>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    NewFile,
    Compact,
}

/// Output file being filled; attributed to the bucket of its first input.
#[derive(Default)]
struct RollingOutput {
    bucket: Option<u32>,
    creation_time_ms: u64,
    size: u64,
    rows: Vec<Row>,
}

impl ChangelogCompactTask {
    pub fn new(checkpoint_id: CheckpointId, partition: impl Into<String>) -> Self {
        Self {
            checkpoint_id,
            partition: partition.into(),
            new_file_changelogs: BTreeMap::new(),
            compact_changelogs: BTreeMap::new(),
        }
    }

    pub fn add_new_file_changelogs(&mut self, bucket: u32, files: Vec<DataFileMeta>) {
        if !files.is_empty() {
            self.new_file_changelogs.entry(bucket).or_default().extend(files);
        }
    }

    pub fn add_compact_changelogs(&mut self, bucket: u32, files: Vec<DataFileMeta>) {
        if !files.is_empty() {
            self.compact_changelogs.entry(bucket).or_default().extend(files);
        }
    }

    fn files(&self) -> impl Iterator<Item = &DataFileMeta> {
        self.new_file_changelogs
            .values()
            .chain(self.compact_changelogs.values())
            .flatten()
    }

    pub fn total_file_size(&self) -> u64 {
        self.files().map(|file| file.file_size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }

    /// Merges the task's files into outputs of roughly `target_file_size` bytes.
    ///
    /// Inputs are read bucket by bucket, oldest first. Every output keeps the
    /// creation time of its first input so later ordering is unchanged. Inputs
    /// are deleted once all outputs are written. Returns one compaction result
    /// per bucket that received an output.
    pub fn execute(
        &self,
        store: &dyn TableStore,
        target_file_size: u64,
        producer: ProducerId,
    ) -> Result<Vec<Committable>, SinkError> {
        let mut results: BTreeMap<u32, CommitMessage> = BTreeMap::new();
        for (category, groups) in [
            (Category::NewFile, &self.new_file_changelogs),
            (Category::Compact, &self.compact_changelogs),
        ] {
            let mut output = RollingOutput::default();
            for (bucket, files) in groups {
                let mut files = files.clone();
                files.sort_by(by_creation_time);
                for file in &files {
                    let rows = store.read_file(file).map_err(|err| self.failure(err))?;
                    if output.bucket.is_none() {
                        output.bucket = Some(*bucket);
                        output.creation_time_ms = file.creation_time_ms;
                    }
                    output.size += file.file_size;
                    output.rows.extend(rows);
                    if output.size >= target_file_size {
                        self.flush(store, category, &mut output, &mut results)?;
                    }
                }
            }
            self.flush(store, category, &mut output, &mut results)?;
        }

        for file in self.files() {
            store.delete_file(file).map_err(|err| self.failure(err))?;
        }
        debug!(
            checkpoint_id = self.checkpoint_id,
            partition = %self.partition,
            inputs = self.file_count(),
            outputs = results.values().map(CommitMessage::file_count).sum::<usize>(),
            "compacted changelog files"
        );
        Ok(results
            .into_values()
            .map(|message| {
                Committable::new(
                    self.checkpoint_id,
                    producer,
                    CommittableKind::CompactResult(message),
                )
            })
            .collect())
    }

    fn flush(
        &self,
        store: &dyn TableStore,
        category: Category,
        output: &mut RollingOutput,
        results: &mut BTreeMap<u32, CommitMessage>,
    ) -> Result<(), SinkError> {
        let Some(bucket) = output.bucket else {
            return Ok(());
        };
        let finished = std::mem::take(output);
        let meta = store
            .write_file(
                &self.partition,
                bucket,
                FileKind::Changelog,
                finished.rows,
                finished.creation_time_ms,
            )
            .map_err(|err| self.failure(err))?;
        let message = results
            .entry(bucket)
            .or_insert_with(|| CommitMessage::new(self.partition.clone(), bucket));
        match category {
            Category::NewFile => message.changelog_files.push(meta),
            Category::Compact => message.compact_changelog_files.push(meta),
        }
        Ok(())
    }

    fn failure(&self, source: StoreError) -> SinkError {
        SinkError::CompactionFailure {
            checkpoint_id: self.checkpoint_id,
            partition: self.partition.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTableStore;

    fn write(store: &InMemoryTableStore, bucket: u32, created: u64, rows: &[&str]) -> DataFileMeta {
        let rows = rows.iter().map(|key| Row::insert(*key, "v")).collect();
        store
            .write_file("p=1", bucket, FileKind::Changelog, rows, created)
            .expect("write")
    }

    #[test]
    fn rolls_outputs_at_target_size_and_keeps_first_bucket() {
        let store = InMemoryTableStore::new("t");
        let mut task = ChangelogCompactTask::new(3, "p=1");
        let a = write(&store, 2, 10, &["a"]);
        let b = write(&store, 0, 20, &["b"]);
        let c = write(&store, 0, 5, &["c"]);
        task.add_new_file_changelogs(2, vec![a.clone()]);
        task.add_new_file_changelogs(0, vec![b.clone(), c.clone()]);

        let results = task.execute(&store, 1 << 20, 7).expect("execute");
        assert_eq!(results.len(), 1);
        let message = results[0].message().expect("message");
        assert_eq!(message.bucket, 0);
        assert_eq!(message.changelog_files.len(), 1);
        assert_eq!(message.changelog_files[0].creation_time_ms, 5);
        assert_eq!(results[0].producer(), 7);
        let merged = store
            .read_file(&message.changelog_files[0])
            .expect("read merged");
        let keys: Vec<Vec<u8>> = merged.into_iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        for input in [a, b, c] {
            assert!(!store.file_exists(&input.file_name));
        }
    }

    #[test]
    fn small_target_produces_one_output_per_input() {
        let store = InMemoryTableStore::new("t");
        let mut task = ChangelogCompactTask::new(1, "p=1");
        task.add_compact_changelogs(1, vec![write(&store, 1, 1, &["a"]), write(&store, 1, 2, &["b"])]);
        let results = task.execute(&store, 1, 0).expect("execute");
        let message = results[0].message().expect("message");
        assert_eq!(message.compact_changelog_files.len(), 2);
        assert!(message.changelog_files.is_empty());
    }
}
