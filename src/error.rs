use crate::committable::CheckpointId;
use crate::gate::GateError;
use thiserror::Error;

/// Failures surfaced by a [`TableStore`](crate::store::TableStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic-concurrency conflict; the same commit may be retried.
    #[error("commit conflict: {reason}")]
    Conflict { reason: String },
    /// Transient storage failure.
    #[error("storage i/o failure: {reason}")]
    Io { reason: String },
    /// Schema or integrity violation; retrying cannot succeed.
    #[error("integrity violation: {reason}")]
    Integrity { reason: String },
    #[error("file {file_name} not found")]
    FileNotFound { file_name: String },
    #[error("tag {name} already exists")]
    TagExists { name: String },
    #[error("tag {name} not found")]
    TagNotFound { name: String },
}

impl StoreError {
    /// Returns true when the failed operation may be retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Io { .. })
    }
}

/// Failures raised while parsing sink options.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for option {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),
}

/// Failures raised while persisting or restoring committer state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("committer state persistence failed: {0}")]
    Persist(String),
    #[error("committer state corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("committer state encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("committer state i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy of the commit path.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Apply kept conflicting after the retry budget was spent.
    #[error("commit {checkpoint_id} still conflicting after {attempts} attempts: {source}")]
    TransientApplyConflict {
        checkpoint_id: CheckpointId,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("commit {checkpoint_id} rejected: {source}")]
    FatalApply {
        checkpoint_id: CheckpointId,
        #[source]
        source: StoreError,
    },
    #[error("changelog compaction for checkpoint {checkpoint_id} partition {partition:?} failed: {source}")]
    CompactionFailure {
        checkpoint_id: CheckpointId,
        partition: String,
        #[source]
        source: StoreError,
    },
    /// Tag bookkeeping failed; the commit itself stays durable.
    #[error("tag {name} could not be created: {reason}")]
    TagCreation { name: String, reason: String },
    #[error("writer {producer} failed: {reason}")]
    Write { producer: u32, reason: String },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Barrier(#[from] GateError),
    #[error("{stage} received an unexpected {kind} committable for checkpoint {checkpoint_id}")]
    UnexpectedCommittable {
        stage: &'static str,
        kind: &'static str,
        checkpoint_id: CheckpointId,
    },
    /// Raised once after a restore recommitted pending state, forcing upstream to restart from it.
    #[error("recommitted {recommitted} restored checkpoint(s); restarting so writers resume from committed state")]
    RestartAfterRecommit { recommitted: usize },
    #[error("pipeline stage {0} stopped")]
    PipelineClosed(&'static str),
}

impl SinkError {
    /// Returns false only for failures that must not abort the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SinkError::TagCreation { .. })
    }
}
