use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const PRECOMMIT_COMPACT: &str = "changelog.precommit-compact";
pub const TARGET_FILE_SIZE: &str = "target-file-size";
pub const BUCKET: &str = "bucket";
pub const CHANGELOG_PRODUCER: &str = "changelog-producer";
pub const WRITE_ONLY: &str = "write-only";
pub const SINK_PARALLELISM: &str = "sink.parallelism";
pub const SINK_OPERATOR_UID_SUFFIX: &str = "sink.operator-uid.suffix";
pub const SINK_USE_MANAGED_MEMORY: &str = "sink.use-managed-memory-allocator";
pub const SINK_MANAGED_WRITER_BUFFER_MEMORY: &str = "sink.managed.writer-buffer-memory";
pub const SINK_WRITER_CPU: &str = "sink.writer-cpu";
pub const SINK_WRITER_MEMORY: &str = "sink.writer-memory";
pub const SINK_COMMITTER_CPU: &str = "sink.committer-cpu";
pub const SINK_COMMITTER_MEMORY: &str = "sink.committer-memory";
pub const SINK_COMMITTER_OPERATOR_CHAINING: &str = "sink.committer-operator-chaining";
pub const SINK_AUTO_TAG_FOR_SAVEPOINT: &str = "sink.auto-tag-for-savepoint";
pub const TAG_AUTOMATIC_CREATION: &str = "tag.automatic-creation";
pub const TAG_DEFAULT_TIME_RETAINED: &str = "tag.default-time-retained";
pub const TAG_NUM_RETAINED_MAX: &str = "tag.num-retained-max";
pub const END_INPUT_WATERMARK: &str = "end-input.watermark";
pub const COMMIT_FORCE_CREATE_SNAPSHOT: &str = "commit.force-create-snapshot";
pub const COMMIT_MAX_RETRIES: &str = "commit.max-retries";
pub const COMMIT_MIN_RETRY_WAIT: &str = "commit.min-retry-wait";
pub const COMMIT_MAX_RETRY_WAIT: &str = "commit.max-retry-wait";
pub const COMMIT_RESTART_AFTER_RECOMMIT: &str = "commit.restart-after-recommit";

const DEFAULT_TARGET_FILE_SIZE: u64 = 128 << 20;
const DEFAULT_WRITER_BUFFER_MEMORY: u64 = 256 << 20;

/// Raw string-keyed table options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options {
    entries: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Merges dynamic options over the current ones and returns the sorted changed keys.
    pub fn merge(&mut self, overlay: &Options) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in &overlay.entries {
            if self.entries.get(key) != Some(value) {
                self.entries.insert(key.clone(), value.clone());
                changed.push(key.clone());
            }
        }
        changed
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(invalid(key, raw, "expected true or false")),
            },
        }
    }

    fn parse_opt<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|_| invalid(key, raw, "not a number"))
            })
            .transpose()
    }

    fn size_opt(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get(key)
            .map(|raw| parse_memory_size(raw).map_err(|reason| invalid(key, raw, &reason)))
            .transpose()
    }

    fn duration_opt(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.get(key)
            .map(|raw| parse_duration(raw).map_err(|reason| invalid(key, raw, &reason)))
            .transpose()
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// How changelog files are produced by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangelogProducer {
    None,
    Input,
}

/// Automatic tag creation strategy of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagCreationMode {
    None,
    Batch,
    ProcessTime,
    Watermark,
}

/// Retry budget for transient apply failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    /// No retries and no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }

    /// Exponential back-off for the given 1-based retry number, clamped to `max_wait`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            min_wait: Duration::from_millis(10),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// What the committer does with a checkpoint that received no files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmptyCommitPolicy {
    /// Mark the checkpoint committed without creating a snapshot.
    Skip,
    /// Create an empty snapshot to keep one snapshot per checkpoint.
    CreateSnapshot,
}

/// Typed view over the options consumed by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkOptions {
    pub precommit_compact: bool,
    pub target_file_size: u64,
    pub num_buckets: u32,
    pub changelog_producer: ChangelogProducer,
    pub write_only: bool,
    pub sink_parallelism: Option<u32>,
    pub operator_uid_suffix: Option<String>,
    pub use_managed_memory: bool,
    pub managed_writer_buffer_memory: u64,
    pub writer_cpu: f64,
    pub writer_memory: Option<u64>,
    pub committer_cpu: f64,
    pub committer_memory: Option<u64>,
    pub committer_chaining: bool,
    pub auto_tag_for_savepoint: bool,
    pub tag_creation_mode: TagCreationMode,
    pub tag_time_retained: Option<Duration>,
    pub tag_num_retained_max: Option<usize>,
    pub end_input_watermark: Option<i64>,
    pub empty_commit: EmptyCommitPolicy,
    pub retry: RetryPolicy,
    pub restart_after_recommit: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            precommit_compact: false,
            target_file_size: DEFAULT_TARGET_FILE_SIZE,
            num_buckets: 1,
            changelog_producer: ChangelogProducer::None,
            write_only: false,
            sink_parallelism: None,
            operator_uid_suffix: None,
            use_managed_memory: false,
            managed_writer_buffer_memory: DEFAULT_WRITER_BUFFER_MEMORY,
            writer_cpu: 1.0,
            writer_memory: None,
            committer_cpu: 1.0,
            committer_memory: None,
            committer_chaining: true,
            auto_tag_for_savepoint: false,
            tag_creation_mode: TagCreationMode::None,
            tag_time_retained: None,
            tag_num_retained_max: None,
            end_input_watermark: None,
            empty_commit: EmptyCommitPolicy::Skip,
            retry: RetryPolicy::default(),
            restart_after_recommit: false,
        }
    }
}

impl SinkOptions {
    /// Parses the typed options, validating every recognised key.
    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let defaults = SinkOptions::default();
        let num_buckets = options.parse_opt::<u32>(BUCKET)?.unwrap_or(1);
        if num_buckets == 0 {
            return Err(invalid(BUCKET, "0", "bucket count must be positive"));
        }
        let sink_parallelism = options.parse_opt::<u32>(SINK_PARALLELISM)?;
        if sink_parallelism == Some(0) {
            return Err(invalid(SINK_PARALLELISM, "0", "parallelism must be positive"));
        }
        let changelog_producer = match options.get(CHANGELOG_PRODUCER) {
            None => ChangelogProducer::None,
            Some(raw) => match raw.trim() {
                "none" => ChangelogProducer::None,
                "input" => ChangelogProducer::Input,
                _ => return Err(invalid(CHANGELOG_PRODUCER, raw, "expected none or input")),
            },
        };
        let tag_creation_mode = match options.get(TAG_AUTOMATIC_CREATION) {
            None => TagCreationMode::None,
            Some(raw) => match raw.trim() {
                "none" => TagCreationMode::None,
                "batch" => TagCreationMode::Batch,
                "process-time" => TagCreationMode::ProcessTime,
                "watermark" => TagCreationMode::Watermark,
                _ => {
                    return Err(invalid(
                        TAG_AUTOMATIC_CREATION,
                        raw,
                        "expected none, batch, process-time or watermark",
                    ))
                }
            },
        };
        let retry = RetryPolicy {
            max_retries: options
                .parse_opt::<u32>(COMMIT_MAX_RETRIES)?
                .unwrap_or(defaults.retry.max_retries),
            min_wait: options
                .duration_opt(COMMIT_MIN_RETRY_WAIT)?
                .unwrap_or(defaults.retry.min_wait),
            max_wait: options
                .duration_opt(COMMIT_MAX_RETRY_WAIT)?
                .unwrap_or(defaults.retry.max_wait),
        };
        let empty_commit = if options.bool_or(COMMIT_FORCE_CREATE_SNAPSHOT, false)? {
            EmptyCommitPolicy::CreateSnapshot
        } else {
            EmptyCommitPolicy::Skip
        };
        Ok(Self {
            precommit_compact: options.bool_or(PRECOMMIT_COMPACT, defaults.precommit_compact)?,
            target_file_size: options
                .size_opt(TARGET_FILE_SIZE)?
                .unwrap_or(defaults.target_file_size),
            num_buckets,
            changelog_producer,
            write_only: options.bool_or(WRITE_ONLY, defaults.write_only)?,
            sink_parallelism,
            operator_uid_suffix: options.get(SINK_OPERATOR_UID_SUFFIX).map(str::to_string),
            use_managed_memory: options.bool_or(SINK_USE_MANAGED_MEMORY, false)?,
            managed_writer_buffer_memory: options
                .size_opt(SINK_MANAGED_WRITER_BUFFER_MEMORY)?
                .unwrap_or(defaults.managed_writer_buffer_memory),
            writer_cpu: options
                .parse_opt::<f64>(SINK_WRITER_CPU)?
                .unwrap_or(defaults.writer_cpu),
            writer_memory: options.size_opt(SINK_WRITER_MEMORY)?,
            committer_cpu: options
                .parse_opt::<f64>(SINK_COMMITTER_CPU)?
                .unwrap_or(defaults.committer_cpu),
            committer_memory: options.size_opt(SINK_COMMITTER_MEMORY)?,
            committer_chaining: options.bool_or(SINK_COMMITTER_OPERATOR_CHAINING, true)?,
            auto_tag_for_savepoint: options.bool_or(SINK_AUTO_TAG_FOR_SAVEPOINT, false)?,
            tag_creation_mode,
            tag_time_retained: options.duration_opt(TAG_DEFAULT_TIME_RETAINED)?,
            tag_num_retained_max: options.parse_opt::<usize>(TAG_NUM_RETAINED_MAX)?,
            end_input_watermark: options.parse_opt::<i64>(END_INPUT_WATERMARK)?,
            empty_commit,
            retry,
            restart_after_recommit: options.bool_or(COMMIT_RESTART_AFTER_RECOMMIT, false)?,
        })
    }
}

/// Runtime mode of the execution substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeMode {
    Streaming,
    Batch,
}

/// Checkpoint guarantee requested from the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointingMode {
    ExactlyOnce,
    AtLeastOnce,
}

/// Substrate settings the sink is placed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionConfig {
    pub runtime_mode: RuntimeMode,
    #[serde(default)]
    pub checkpointing_enabled: bool,
    #[serde(default = "default_checkpointing_mode")]
    pub checkpointing_mode: CheckpointingMode,
    #[serde(default)]
    pub unaligned_checkpoints: bool,
    #[serde(default)]
    pub adaptive_parallelism: bool,
    #[serde(default = "default_input_parallelism")]
    pub input_parallelism: u32,
}

fn default_checkpointing_mode() -> CheckpointingMode {
    CheckpointingMode::ExactlyOnce
}

fn default_input_parallelism() -> u32 {
    1
}

impl ExecutionConfig {
    pub fn streaming(input_parallelism: u32) -> Self {
        Self {
            runtime_mode: RuntimeMode::Streaming,
            checkpointing_enabled: true,
            checkpointing_mode: CheckpointingMode::ExactlyOnce,
            unaligned_checkpoints: false,
            adaptive_parallelism: false,
            input_parallelism,
        }
    }

    pub fn batch(input_parallelism: u32) -> Self {
        Self {
            runtime_mode: RuntimeMode::Batch,
            checkpointing_enabled: false,
            ..Self::streaming(input_parallelism)
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.runtime_mode == RuntimeMode::Streaming
    }

    /// Streaming with checkpointing requires aligned, exactly-once checkpoints.
    pub fn assert_streaming_configuration(&self) -> Result<(), ConfigError> {
        if !(self.is_streaming() && self.checkpointing_enabled) {
            return Ok(());
        }
        if self.unaligned_checkpoints {
            return Err(ConfigError::UnsupportedEnvironment(
                "unaligned checkpoints are not supported; disable them".into(),
            ));
        }
        if self.checkpointing_mode != CheckpointingMode::ExactlyOnce {
            return Err(ConfigError::UnsupportedEnvironment(
                "only exactly-once checkpointing is supported".into(),
            ));
        }
        Ok(())
    }

    /// Batch runs with adaptive parallelism need an explicit sink parallelism.
    pub fn assert_batch_adaptive_parallelism(
        &self,
        sink_parallelism: Option<u32>,
    ) -> Result<(), ConfigError> {
        if !self.is_streaming() && self.adaptive_parallelism && sink_parallelism.is_none() {
            return Err(ConfigError::UnsupportedEnvironment(format!(
                "adaptive parallelism is not supported; disable it or set {SINK_PARALLELISM}"
            )));
        }
        Ok(())
    }
}

/// Parses sizes such as `128 mb`, `1gb` or `4096`.
pub fn parse_memory_size(raw: &str) -> Result<u64, String> {
    let text = raw.trim().to_ascii_lowercase();
    let split = text
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| "size must start with a number".to_string())?;
    let shift = match unit.trim() {
        "" | "b" | "bytes" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        "t" | "tb" => 40,
        other => return Err(format!("unknown size unit {other:?}")),
    };
    amount
        .checked_mul(1u64 << shift)
        .ok_or_else(|| "size overflows u64".to_string())
}

/// Parses durations such as `100 ms`, `30 s`, `5 min`, `2 h` or `7 d`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let text = raw.trim().to_ascii_lowercase();
    let split = text
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| "duration must start with a number".to_string())?;
    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" | "sec" => 1_000,
        "min" | "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| "duration overflows".to_string())
}
