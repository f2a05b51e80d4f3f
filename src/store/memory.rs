use super::{CommitKind, Snapshot, Tag, TableStore};
use crate::clock::{Clock, SystemClock};
use crate::committable::{DataFileMeta, FileKind, Row};
use crate::committer::ManifestCommittable;
use crate::error::StoreError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Operation at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    WriteFile,
    ReadFile,
    Apply,
    /// The commit is applied but the caller receives the error.
    ApplyResponse,
    CreateTag,
}

#[derive(Debug, Clone)]
struct StoredFile {
    partition: String,
    rows: Vec<Row>,
}

#[derive(Default)]
struct StoreState {
    next_file_id: u64,
    files: HashMap<String, StoredFile>,
    live: HashSet<String>,
    snapshots: Vec<Snapshot>,
    tags: BTreeMap<String, Tag>,
    faults: HashMap<FaultPoint, VecDeque<StoreError>>,
    apply_attempts: u64,
}

impl StoreState {
    fn take_fault(&mut self, point: FaultPoint) -> Result<(), StoreError> {
        match self.faults.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Table store kept entirely in memory, with scripted failures for tests and demos.
pub struct InMemoryTableStore {
    name: String,
    clock: Mutex<Box<dyn Clock>>,
    state: Mutex<StoreState>,
}

impl InMemoryTableStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, SystemClock)
    }

    pub fn with_clock(name: impl Into<String>, clock: impl Clock + 'static) -> Self {
        Self {
            name: name.into(),
            clock: Mutex::new(Box::new(clock)),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Makes the next call at `point` fail with `error`. Failures queue in order.
    pub fn fail_next(&self, point: FaultPoint, error: StoreError) {
        self.state
            .lock()
            .faults
            .entry(point)
            .or_default()
            .push_back(error);
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.state.lock().snapshots.clone()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.state.lock().tags.values().cloned().collect()
    }

    /// Number of `apply_commit` calls, including failed ones.
    pub fn apply_attempts(&self) -> u64 {
        self.state.lock().apply_attempts
    }

    /// Names of files referenced by the latest table state.
    pub fn live_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().live.iter().cloned().collect();
        names.sort();
        names
    }

    /// Whether a physical file still exists, committed or not.
    pub fn file_exists(&self, file_name: &str) -> bool {
        self.state.lock().files.contains_key(file_name)
    }

    /// Rows of every live file of `kind`, in file-name order.
    pub fn live_rows(&self, kind: FileKind) -> Vec<Row> {
        let state = self.state.lock();
        let mut names: Vec<&String> = state.live.iter().collect();
        names.sort();
        names
            .into_iter()
            .filter(|name| file_kind(name) == Some(kind))
            .filter_map(|name| state.files.get(name))
            .flat_map(|file| file.rows.iter().cloned())
            .collect()
    }

    fn now_ms(&self) -> u64 {
        self.clock.lock().now_ms()
    }
}

fn file_kind(file_name: &str) -> Option<FileKind> {
    if file_name.starts_with("data-") {
        Some(FileKind::Data)
    } else if file_name.starts_with("changelog-") {
        Some(FileKind::Changelog)
    } else {
        None
    }
}

impl TableStore for InMemoryTableStore {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn write_file(
        &self,
        partition: &str,
        bucket: u32,
        kind: FileKind,
        rows: Vec<Row>,
        creation_time_ms: u64,
    ) -> Result<DataFileMeta, StoreError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::WriteFile)?;
        state.next_file_id += 1;
        let prefix = match kind {
            FileKind::Data => "data",
            FileKind::Changelog => "changelog",
        };
        let file_name = format!("{prefix}-{bucket}-{:08}", state.next_file_id);
        let meta = DataFileMeta {
            file_name: file_name.clone(),
            kind,
            file_size: rows.iter().map(Row::encoded_len).sum(),
            row_count: rows.len() as u64,
            creation_time_ms,
        };
        state.files.insert(
            file_name,
            StoredFile {
                partition: partition.to_string(),
                rows,
            },
        );
        Ok(meta)
    }

    fn read_file(&self, file: &DataFileMeta) -> Result<Vec<Row>, StoreError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::ReadFile)?;
        state
            .files
            .get(&file.file_name)
            .map(|stored| stored.rows.clone())
            .ok_or_else(|| StoreError::FileNotFound {
                file_name: file.file_name.clone(),
            })
    }

    fn delete_file(&self, file: &DataFileMeta) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.live.contains(&file.file_name) {
            return Err(StoreError::Integrity {
                reason: format!("file {} is referenced by a snapshot", file.file_name),
            });
        }
        state
            .files
            .remove(&file.file_name)
            .map(|_| ())
            .ok_or_else(|| StoreError::FileNotFound {
                file_name: file.file_name.clone(),
            })
    }

    fn apply_commit(
        &self,
        committable: &ManifestCommittable,
        commit_user: &str,
    ) -> Result<Snapshot, StoreError> {
        let time_millis = self.now_ms();
        let mut state = self.state.lock();
        state.apply_attempts += 1;
        state.take_fault(FaultPoint::Apply)?;

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut compact_only = true;
        for message in committable.messages() {
            let additions = message
                .new_files
                .iter()
                .chain(&message.changelog_files)
                .chain(&message.compact_after)
                .chain(&message.compact_changelog_files);
            for file in additions {
                let stored = state.files.get(&file.file_name).ok_or_else(|| {
                    StoreError::Integrity {
                        reason: format!("commit references missing file {}", file.file_name),
                    }
                })?;
                if stored.partition != message.partition {
                    return Err(StoreError::Integrity {
                        reason: format!(
                            "file {} belongs to partition {:?}, not {:?}",
                            file.file_name, stored.partition, message.partition
                        ),
                    });
                }
                if state.live.contains(&file.file_name) || added.contains(&file.file_name) {
                    return Err(StoreError::Integrity {
                        reason: format!("file {} committed twice", file.file_name),
                    });
                }
                added.push(file.file_name.clone());
            }
            for file in &message.compact_before {
                if !state.live.contains(&file.file_name) {
                    return Err(StoreError::Integrity {
                        reason: format!("compaction removes unknown file {}", file.file_name),
                    });
                }
                removed.push(file.file_name.clone());
            }
            if !message.new_files.is_empty() || !message.changelog_files.is_empty() {
                compact_only = false;
            }
        }

        let commit_kind = if compact_only && !added.is_empty() {
            CommitKind::Compact
        } else {
            CommitKind::Append
        };
        for name in &removed {
            state.live.remove(name);
        }
        let added_files = added.len();
        state.live.extend(added);
        let snapshot = Snapshot {
            id: state.snapshots.last().map_or(1, |last| last.id + 1),
            commit_user: commit_user.to_string(),
            commit_identifier: committable.identifier(),
            commit_kind,
            time_millis,
            watermark: committable.watermark(),
            added_files,
        };
        state.snapshots.push(snapshot.clone());
        state.take_fault(FaultPoint::ApplyResponse)?;
        Ok(snapshot)
    }

    fn latest_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().snapshots.last().cloned()
    }

    fn latest_snapshot_of(&self, commit_user: &str) -> Option<Snapshot> {
        self.state
            .lock()
            .snapshots
            .iter()
            .rev()
            .find(|snapshot| snapshot.commit_user == commit_user)
            .cloned()
    }

    fn create_tag(
        &self,
        snapshot: &Snapshot,
        name: &str,
        time_retained: Option<Duration>,
    ) -> Result<Tag, StoreError> {
        let created_at_ms = self.now_ms();
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::CreateTag)?;
        if state.tags.contains_key(name) {
            return Err(StoreError::TagExists {
                name: name.to_string(),
            });
        }
        if !state.snapshots.iter().any(|known| known.id == snapshot.id) {
            return Err(StoreError::Integrity {
                reason: format!("tag {name} references unknown snapshot {}", snapshot.id),
            });
        }
        let tag = Tag {
            name: name.to_string(),
            snapshot_id: snapshot.id,
            created_at_ms,
            time_retained,
        };
        state.tags.insert(name.to_string(), tag.clone());
        Ok(tag)
    }

    fn list_tags(&self) -> Result<Vec<Tag>, StoreError> {
        Ok(self.tags())
    }

    fn delete_tag(&self, name: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .tags
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::TagNotFound {
                name: name.to_string(),
            })
    }
}
