//! Exactly-once commit orchestration for a streaming table sink.
//!
//! Writers turn records into files and emit checkpoint-stamped committables,
//! an optional changelog compaction sub-pipeline merges small changelog files,
//! and a single global committer applies one atomic snapshot per checkpoint.

pub mod app;
pub mod clock;
pub mod committable;
pub mod committer;
pub mod compact;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod pipeline;
pub mod store;
pub mod topology;
pub mod writer;

pub use clock::{Clock, CreationTicker, ManualClock, SystemClock};
pub use committable::{
    CheckpointId, CommitMessage, Committable, CommittableKind, DataFileMeta, FileKind, ProducerId,
    Row, RowKind, END_INPUT_CHECKPOINT_ID,
};
pub use committer::{
    AutoTagForSavepoint, BatchTagGenerator, CommitHook, CommitOutcome, CommitStatus,
    CommittableStateManager, Committer, CommitterMetrics, CommitterOperator,
    CommitterOperatorBuilder, CommitterState, EpochPhase, FileStateBackend, ManifestCommittable,
    MemoryStateBackend, NoopCommittableStateManager, PersistedState,
    RestoreCommittableStateManager, StateBackend, StoreCommitter, BATCH_TAG_PREFIX,
    SAVEPOINT_TAG_PREFIX, STATE_FORMAT_VERSION,
};
pub use compact::{
    ChangelogCompactCoordinator, ChangelogCompactSorter, ChangelogCompactTask,
    ChangelogCompactWorker,
};
pub use config::{
    parse_duration, parse_memory_size, ChangelogProducer, CheckpointingMode, EmptyCommitPolicy,
    ExecutionConfig, Options, RetryPolicy, RuntimeMode, SinkOptions, TagCreationMode,
};
pub use error::{ConfigError, SinkError, StateError, StoreError};
pub use gate::{CheckpointBarrier, CheckpointKind, GateError, GateEvent, InputGate, StreamElement};
pub use logging::{
    init_tracing, JsonLineLogger, LogFile, LogLevel, LogRotationPolicy, LoggingError,
};
pub use pipeline::{SinkPipeline, SinkPipelineBuilder, WriterInput};
pub use store::{CommitKind, FaultPoint, InMemoryTableStore, Snapshot, TableStore, Tag};
pub use topology::{
    custom_uid, plan, CompactionPlan, HookKind, SinkTopology, SlotSharingGroup, StagePlan,
};
pub use writer::{SinkRecord, StoreSinkWriter};
