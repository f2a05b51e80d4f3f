//! Placement plan of the sink inside the execution substrate.

use crate::config::{ExecutionConfig, RuntimeMode, SinkOptions, TagCreationMode};
use crate::error::ConfigError;
use serde::Serialize;

pub const WRITER_NAME: &str = "Writer";
pub const WRITER_WRITE_ONLY_NAME: &str = "Writer(write-only)";
pub const COORDINATOR_NAME: &str = "Changelog Compact Coordinator";
pub const WORKER_NAME: &str = "Changelog Compact Worker";
pub const SORTER_NAME: &str = "Changelog Sort by Creation Time";
pub const GLOBAL_COMMITTER_NAME: &str = "Global Committer";
pub const END_NAME: &str = "end";

/// Operator uid derived from a stable name, the table and a user suffix.
pub fn custom_uid(name: &str, table: &str, suffix: &str) -> String {
    format!("{name}_{table}_{suffix}")
}

/// Dedicated resource group declared for a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSharingGroup {
    pub name: String,
    pub cpu_cores: f64,
    pub task_heap_memory: u64,
}

/// Placement of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePlan {
    pub name: String,
    pub parallelism: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_sharing_group: Option<SlotSharingGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_memory: Option<u64>,
    /// False when the stage starts a new operator chain.
    pub chained: bool,
}

impl StagePlan {
    fn new(name: impl Into<String>, parallelism: u32) -> Self {
        Self {
            name: name.into(),
            parallelism,
            max_parallelism: None,
            uid: None,
            slot_sharing_group: None,
            managed_memory: None,
            chained: true,
        }
    }

    fn slot_sharing(mut self, cpu_cores: f64, heap_memory: Option<u64>) -> Self {
        self.slot_sharing_group = heap_memory.map(|task_heap_memory| SlotSharingGroup {
            name: self.name.clone(),
            cpu_cores,
            task_heap_memory,
        });
        self
    }
}

/// Side effects installed around the global committer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    AutoTagForSavepoint,
    BatchTagGenerator,
}

/// Full placement of the sink, from writers to the terminal stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkTopology {
    pub table: String,
    pub writer: StagePlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionPlan>,
    pub committer: StagePlan,
    /// Whether the committer commits per checkpoint rather than only at end of input.
    pub streaming_checkpoint_enabled: bool,
    pub hooks: Vec<HookKind>,
    pub end: StagePlan,
}

/// Stages of the changelog compaction sub-pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionPlan {
    pub coordinator: StagePlan,
    pub worker: StagePlan,
    pub sorter: StagePlan,
}

impl SinkTopology {
    pub fn stages(&self) -> Vec<&StagePlan> {
        let mut stages = vec![&self.writer];
        if let Some(compaction) = &self.compaction {
            stages.extend([&compaction.coordinator, &compaction.worker, &compaction.sorter]);
        }
        stages.push(&self.committer);
        stages.push(&self.end);
        stages
    }

    /// Number of lanes feeding the global committer.
    pub fn committer_lanes(&self) -> usize {
        match &self.compaction {
            Some(compaction) => compaction.sorter.parallelism as usize,
            None => self.writer.parallelism as usize,
        }
    }
}

/// Plans the sink for `table` and validates the execution environment.
pub fn plan(
    table: &str,
    has_primary_keys: bool,
    options: &SinkOptions,
    execution: &ExecutionConfig,
) -> Result<SinkTopology, ConfigError> {
    let streaming_checkpoint_enabled = execution.is_streaming() && execution.checkpointing_enabled;
    if streaming_checkpoint_enabled {
        execution.assert_streaming_configuration()?;
    }
    execution.assert_batch_adaptive_parallelism(options.sink_parallelism)?;

    let writer_name = if options.write_only {
        WRITER_WRITE_ONLY_NAME
    } else {
        WRITER_NAME
    };
    let writer_parallelism = options
        .sink_parallelism
        .unwrap_or(execution.input_parallelism)
        .max(1);
    let mut writer = StagePlan::new(format!("{writer_name} : {table}"), writer_parallelism)
        .slot_sharing(options.writer_cpu, options.writer_memory);
    if let Some(suffix) = &options.operator_uid_suffix {
        writer.uid = Some(custom_uid(WRITER_NAME, table, suffix));
    }
    if options.use_managed_memory {
        writer.managed_memory = Some(options.managed_writer_buffer_memory);
    }

    let compaction = (has_primary_keys && options.precommit_compact).then(|| CompactionPlan {
        coordinator: StagePlan::new(COORDINATOR_NAME, 1),
        worker: StagePlan::new(WORKER_NAME, writer_parallelism),
        sorter: StagePlan::new(SORTER_NAME, 1),
    });

    let mut committer = StagePlan::new(format!("{GLOBAL_COMMITTER_NAME} : {table}"), 1)
        .slot_sharing(options.committer_cpu, options.committer_memory);
    committer.max_parallelism = Some(1);
    committer.chained = options.committer_chaining;
    if let Some(suffix) = &options.operator_uid_suffix {
        committer.uid = Some(custom_uid(GLOBAL_COMMITTER_NAME, table, suffix));
    }

    let mut hooks = Vec::new();
    if options.auto_tag_for_savepoint {
        hooks.push(HookKind::AutoTagForSavepoint);
    }
    if execution.runtime_mode == RuntimeMode::Batch
        && options.tag_creation_mode == TagCreationMode::Batch
    {
        hooks.push(HookKind::BatchTagGenerator);
    }

    Ok(SinkTopology {
        table: table.to_string(),
        writer,
        compaction,
        committer,
        streaming_checkpoint_enabled,
        hooks,
        end: StagePlan::new(END_NAME, 1),
    })
}
