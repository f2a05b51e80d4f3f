use crate::config::{ExecutionConfig, Options, SinkOptions};
use crate::gate::CheckpointBarrier;
use crate::logging::init_tracing;
use crate::pipeline::SinkPipelineBuilder;
use crate::store::{InMemoryTableStore, TableStore};
use crate::topology::plan;
use crate::writer::SinkRecord;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const USAGE: &str = "usage: tablesink <plan|simulate> <sink-definition.json> [checkpoints] [records-per-checkpoint]";

/// Table and environment a sink is placed into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SinkDefinition {
    pub table: String,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub options: Options,
    pub execution: ExecutionConfig,
}

impl SinkDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading sink definition {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing sink definition {}", path.display()))
    }

    pub fn sink_options(&self) -> Result<SinkOptions> {
        SinkOptions::from_options(&self.options).context("invalid table options")
    }
}

/// Entry point of the binary: `plan` prints the placement, `simulate` runs the
/// sink against an in-memory table and prints the produced snapshots.
pub fn run() -> Result<()> {
    init_tracing("info");
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(command), Some(path)) = (args.first(), args.get(1)) else {
        bail!(USAGE);
    };
    let definition = SinkDefinition::load(Path::new(path))?;
    match command.as_str() {
        "plan" => {
            let options = definition.sink_options()?;
            let topology = plan(
                &definition.table,
                !definition.primary_keys.is_empty(),
                &options,
                &definition.execution,
            )?;
            println!("{}", serde_json::to_string_pretty(&topology)?);
            Ok(())
        }
        "simulate" => {
            let checkpoints = parse_count(args.get(2), 3).context("checkpoints")?;
            let records = parse_count(args.get(3), 100).context("records-per-checkpoint")?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(simulate(definition, checkpoints, records))
        }
        other => bail!("unknown command {other:?}; {USAGE}"),
    }
}

fn parse_count(raw: Option<&String>, default: u64) -> Result<u64> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{raw:?} is not a count")),
    }
}

async fn simulate(definition: SinkDefinition, checkpoints: u64, records: u64) -> Result<()> {
    let options = definition.sink_options()?;
    let store = Arc::new(InMemoryTableStore::new(definition.table.clone()));
    let mut pipeline = SinkPipelineBuilder::new(
        store.clone() as Arc<dyn TableStore>,
        options,
        definition.execution.clone(),
    )
    .primary_keys(!definition.primary_keys.is_empty())
    .launch()?;

    let lanes = pipeline.lanes();
    let mut key = 0u64;
    for checkpoint_id in 1..=checkpoints {
        for _ in 0..records {
            let lane = (key % lanes as u64) as usize;
            let record = SinkRecord::insert("default", key.to_be_bytes().to_vec(), format!("v{key}"));
            pipeline.write(lane, record).await?;
            key += 1;
        }
        if definition.execution.is_streaming() && definition.execution.checkpointing_enabled {
            pipeline.barrier(CheckpointBarrier::checkpoint(checkpoint_id)).await?;
            if let Some(outcome) = pipeline.next_outcome().await {
                println!("{}", serde_json::to_string(&outcome.snapshot)?);
            }
        }
    }
    pipeline.end_input().await?;
    for outcome in pipeline.join().await? {
        println!("{}", serde_json::to_string(&outcome.snapshot)?);
    }
    for tag in store.tags() {
        println!("{}", serde_json::to_string(&tag)?);
    }
    Ok(())
}
