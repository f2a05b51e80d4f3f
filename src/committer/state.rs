use super::ManifestCommittable;
use crate::committable::CheckpointId;
use crate::error::{SinkError, StateError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Version stamped into every encoded committer state.
pub const STATE_FORMAT_VERSION: u32 = 1;

const STATE_FILE_NAME: &str = "committer-state.json";

/// High-water mark plus the arena of aggregated but unconfirmed checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitterState {
    pub version: u32,
    pub commit_user: String,
    /// Highest checkpoint whose commit is confirmed.
    pub last_committed: Option<CheckpointId>,
    /// Aggregated units awaiting commit, keyed by checkpoint.
    pub pending: BTreeMap<CheckpointId, ManifestCommittable>,
}

impl CommitterState {
    pub fn new(commit_user: impl Into<String>) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            commit_user: commit_user.into(),
            last_committed: None,
            pending: BTreeMap::new(),
        }
    }

    /// True when `checkpoint_id` is at or below the confirmed high-water mark.
    pub fn is_committed(&self, checkpoint_id: CheckpointId) -> bool {
        self.last_committed
            .is_some_and(|last| checkpoint_id <= last)
    }

    /// Records a confirmed commit and drops its pending unit.
    pub fn mark_committed(&mut self, checkpoint_id: CheckpointId) {
        self.pending.remove(&checkpoint_id);
        self.last_committed = Some(
            self.last_committed
                .map_or(checkpoint_id, |last| last.max(checkpoint_id)),
        );
    }

    fn encode(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(payload: &[u8]) -> Result<Self, StateError> {
        let state: CommitterState = serde_json::from_slice(payload)?;
        if state.version != STATE_FORMAT_VERSION {
            return Err(StateError::Corrupt {
                reason: format!("unsupported state version {}", state.version),
            });
        }
        Ok(state)
    }
}

/// Encoded state with checksum and signature metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub sequence: u64,
    pub checksum: String,
    pub signature: String,
    pub payload: Vec<u8>,
}

impl PersistedState {
    fn build(sequence: u64, payload: Vec<u8>) -> Self {
        let checksum = compute_checksum(&payload);
        let signature = compute_signature(&checksum, sequence);
        Self {
            sequence,
            checksum,
            signature,
            payload,
        }
    }

    fn validate(&self) -> Result<(), StateError> {
        let checksum = compute_checksum(&self.payload);
        if checksum != self.checksum {
            return Err(StateError::Corrupt {
                reason: format!("checksum mismatch (sequence {})", self.sequence),
            });
        }
        if compute_signature(&checksum, self.sequence) != self.signature {
            return Err(StateError::Corrupt {
                reason: format!("signature mismatch (sequence {})", self.sequence),
            });
        }
        Ok(())
    }
}

fn compute_checksum(payload: &[u8]) -> String {
    to_hex(&Sha256::digest(payload))
}

fn compute_signature(checksum: &str, sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(checksum.as_bytes());
    hasher.update(sequence.to_be_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

/// Durable location of the latest committer state.
pub trait StateBackend: Send {
    fn persist(&mut self, record: PersistedState) -> Result<(), StateError>;
    fn load(&self) -> Result<Option<PersistedState>, StateError>;
}

/// Backend shared between clones, so a "restarted" committer sees what the old one wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateBackend {
    latest: Arc<Mutex<Option<PersistedState>>>,
    writes: Arc<Mutex<u64>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<PersistedState> {
        self.latest.lock().clone()
    }

    /// Replaces the stored record verbatim.
    pub fn overwrite(&self, record: PersistedState) {
        *self.latest.lock() = Some(record);
    }

    pub fn writes(&self) -> u64 {
        *self.writes.lock()
    }
}

impl StateBackend for MemoryStateBackend {
    fn persist(&mut self, record: PersistedState) -> Result<(), StateError> {
        *self.latest.lock() = Some(record);
        *self.writes.lock() += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedState>, StateError> {
        Ok(self.latest.lock().clone())
    }
}

/// Backend writing one JSON file per committer, replaced atomically by rename.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    dir: PathBuf,
}

impl FileStateBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }
}

impl StateBackend for FileStateBackend {
    fn persist(&mut self, record: PersistedState) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir)?;
        let encoded = serde_json::to_vec(&record)?;
        let target = self.path();
        let staging = target.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&staging)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &target)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let path = self.path();
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Persists and restores [`CommitterState`] across restarts.
pub trait CommittableStateManager: Send {
    /// Loads the last persisted state, or a fresh one owned by `initial_commit_user`.
    fn restore(&mut self, initial_commit_user: &str) -> Result<CommitterState, SinkError>;

    fn snapshot(&mut self, state: &CommitterState) -> Result<(), SinkError>;

    /// Whether a restore that recommitted pending units must fail once afterwards.
    fn restart_after_recommit(&self) -> bool {
        false
    }
}

/// State manager backed by a [`StateBackend`].
pub struct RestoreCommittableStateManager<B: StateBackend> {
    backend: B,
    sequence: u64,
    restart_after_recommit: bool,
}

impl<B: StateBackend> RestoreCommittableStateManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            sequence: 0,
            restart_after_recommit: false,
        }
    }

    pub fn with_restart_after_recommit(mut self, enabled: bool) -> Self {
        self.restart_after_recommit = enabled;
        self
    }
}

impl<B: StateBackend> CommittableStateManager for RestoreCommittableStateManager<B> {
    fn restore(&mut self, initial_commit_user: &str) -> Result<CommitterState, SinkError> {
        let Some(record) = self.backend.load()? else {
            return Ok(CommitterState::new(initial_commit_user));
        };
        record.validate()?;
        let state = CommitterState::decode(&record.payload)?;
        self.sequence = record.sequence.saturating_add(1);
        Ok(state)
    }

    fn snapshot(&mut self, state: &CommitterState) -> Result<(), SinkError> {
        let record = PersistedState::build(self.sequence, state.encode()?);
        self.backend.persist(record)?;
        self.sequence = self.sequence.saturating_add(1);
        Ok(())
    }

    fn restart_after_recommit(&self) -> bool {
        self.restart_after_recommit
    }
}

/// State manager for bounded runs without checkpointing: nothing survives a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCommittableStateManager;

impl CommittableStateManager for NoopCommittableStateManager {
    fn restore(&mut self, initial_commit_user: &str) -> Result<CommitterState, SinkError> {
        Ok(CommitterState::new(initial_commit_user))
    }

    fn snapshot(&mut self, _state: &CommitterState) -> Result<(), SinkError> {
        Ok(())
    }
}
