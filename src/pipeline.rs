//! Async runtime wiring the sink's stages together.
//!
//! Every stage instance runs as its own task connected by bounded `tokio`
//! channels. Writers and compaction workers are parallel; the coordinator,
//! sorter and committer are single instances reading through an [`InputGate`].
//! The committer runs on the blocking pool since applying commits and
//! persisting state are synchronous.

use crate::committer::{
    AutoTagForSavepoint, BatchTagGenerator, CommitOutcome, CommittableStateManager, Committer,
    CommitterOperator, CommitterOperatorBuilder, MemoryStateBackend, NoopCommittableStateManager,
    RestoreCommittableStateManager, StoreCommitter,
};
use crate::compact::{ChangelogCompactCoordinator, ChangelogCompactSorter, ChangelogCompactWorker};
use crate::config::{ExecutionConfig, SinkOptions};
use crate::error::SinkError;
use crate::gate::{CheckpointBarrier, GateEvent, InputGate, StreamElement};
use crate::store::TableStore;
use crate::topology::{plan, HookKind, SinkTopology};
use crate::writer::{SinkRecord, StoreSinkWriter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Command accepted by one writer lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterInput {
    Record(SinkRecord),
    Watermark(i64),
    Barrier(CheckpointBarrier),
    EndOfInput,
}

type LaneElement = (usize, StreamElement);
type StageHandle = (&'static str, JoinHandle<Result<(), SinkError>>);

/// Configures and launches a [`SinkPipeline`].
pub struct SinkPipelineBuilder {
    store: Arc<dyn TableStore>,
    options: SinkOptions,
    execution: ExecutionConfig,
    has_primary_keys: bool,
    commit_user: Option<String>,
    state_manager: Option<Box<dyn CommittableStateManager>>,
    channel_capacity: usize,
}

impl SinkPipelineBuilder {
    pub fn new(store: Arc<dyn TableStore>, options: SinkOptions, execution: ExecutionConfig) -> Self {
        Self {
            store,
            options,
            execution,
            has_primary_keys: false,
            commit_user: None,
            state_manager: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn primary_keys(mut self, has_primary_keys: bool) -> Self {
        self.has_primary_keys = has_primary_keys;
        self
    }

    /// Commit user for a new job; a restored committer state overrides it.
    pub fn commit_user(mut self, commit_user: impl Into<String>) -> Self {
        self.commit_user = Some(commit_user.into());
        self
    }

    pub fn state_manager(mut self, manager: impl CommittableStateManager + 'static) -> Self {
        self.state_manager = Some(Box::new(manager));
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Plans the topology and spawns every stage. Must run inside a Tokio runtime.
    pub fn launch(self) -> Result<SinkPipeline, SinkError> {
        let table = self.store.table_name().to_string();
        let topology = plan(&table, self.has_primary_keys, &self.options, &self.execution)?;
        let commit_user = self
            .commit_user
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let writers = (0..topology.writer.parallelism)
            .map(|producer| {
                StoreSinkWriter::new(
                    producer,
                    commit_user.clone(),
                    self.store.clone(),
                    &self.options,
                    self.has_primary_keys,
                )
            })
            .collect::<Vec<_>>();

        let state_manager: Box<dyn CommittableStateManager> = match self.state_manager {
            Some(manager) => manager,
            None if topology.streaming_checkpoint_enabled => Box::new(
                RestoreCommittableStateManager::new(MemoryStateBackend::new())
                    .with_restart_after_recommit(self.options.restart_after_recommit),
            ),
            None => Box::new(NoopCommittableStateManager),
        };
        let committer_store = self.store.clone();
        let retry = self.options.retry;
        let empty_commit = self.options.empty_commit;
        let mut committer = CommitterOperatorBuilder::new(commit_user, move |user| {
            Box::new(StoreCommitter::new(committer_store, user, retry, empty_commit))
                as Box<dyn Committer>
        })
        .boxed_state_manager(state_manager)
        .lanes(topology.committer_lanes())
        .checkpointing(topology.streaming_checkpoint_enabled)
        .end_input_watermark(self.options.end_input_watermark);
        for hook in &topology.hooks {
            committer = match hook {
                HookKind::AutoTagForSavepoint => committer.hook(AutoTagForSavepoint::new(
                    self.store.clone(),
                    self.options.tag_time_retained,
                )),
                HookKind::BatchTagGenerator => committer.hook(BatchTagGenerator::new(
                    self.store.clone(),
                    self.execution.runtime_mode,
                    self.options.tag_time_retained,
                    self.options.tag_num_retained_max,
                )),
            };
        }

        let compaction = topology.compaction.as_ref().map(|compaction| {
            let workers = (0..compaction.worker.parallelism)
                .map(|producer| {
                    ChangelogCompactWorker::new(
                        producer,
                        self.store.clone(),
                        self.options.target_file_size,
                    )
                })
                .collect();
            (
                ChangelogCompactCoordinator::new(self.options.target_file_size),
                workers,
            )
        });

        Ok(SinkPipeline::spawn(
            topology,
            writers,
            compaction,
            committer.build(),
            self.channel_capacity,
        ))
    }
}

/// Handle to a running sink.
pub struct SinkPipeline {
    topology: SinkTopology,
    writers: Vec<mpsc::Sender<WriterInput>>,
    outcomes: mpsc::UnboundedReceiver<CommitOutcome>,
    stages: Vec<StageHandle>,
}

impl SinkPipeline {
    fn spawn(
        topology: SinkTopology,
        writers: Vec<StoreSinkWriter>,
        compaction: Option<(ChangelogCompactCoordinator, Vec<ChangelogCompactWorker>)>,
        committer: CommitterOperator,
        capacity: usize,
    ) -> Self {
        let mut stages: Vec<StageHandle> = Vec::new();
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let (committer_tx, committer_rx) = mpsc::channel::<LaneElement>(capacity);
        stages.push(("committer", spawn_committer(committer, committer_rx, outcome_tx)));

        let writer_output = match compaction {
            None => committer_tx,
            Some((coordinator, workers)) => {
                let (sorter_tx, sorter_rx) = mpsc::channel::<LaneElement>(capacity);
                stages.push((
                    "sorter",
                    tokio::spawn(run_sorter(
                        ChangelogCompactSorter::new(),
                        workers.len(),
                        sorter_rx,
                        committer_tx,
                    )),
                ));
                let mut worker_txs = Vec::with_capacity(workers.len());
                for (lane, worker) in workers.into_iter().enumerate() {
                    let (worker_tx, worker_rx) = mpsc::channel::<StreamElement>(capacity);
                    worker_txs.push(worker_tx);
                    stages.push((
                        "compact-worker",
                        tokio::spawn(run_worker(lane, worker, worker_rx, sorter_tx.clone())),
                    ));
                }
                drop(sorter_tx);
                let (coordinator_tx, coordinator_rx) = mpsc::channel::<LaneElement>(capacity);
                stages.push((
                    "compact-coordinator",
                    tokio::spawn(run_coordinator(
                        coordinator,
                        writers.len(),
                        coordinator_rx,
                        worker_txs,
                    )),
                ));
                coordinator_tx
            }
        };

        let mut writer_txs = Vec::with_capacity(writers.len());
        for (lane, writer) in writers.into_iter().enumerate() {
            let (writer_tx, writer_rx) = mpsc::channel::<WriterInput>(capacity);
            writer_txs.push(writer_tx);
            stages.push((
                "writer",
                tokio::spawn(run_writer(lane, writer, writer_rx, writer_output.clone())),
            ));
        }
        drop(writer_output);
        info!(
            table = %topology.table,
            writers = writer_txs.len(),
            compaction = topology.compaction.is_some(),
            "sink pipeline launched"
        );

        Self {
            topology,
            writers: writer_txs,
            outcomes,
            stages,
        }
    }

    pub fn topology(&self) -> &SinkTopology {
        &self.topology
    }

    pub fn lanes(&self) -> usize {
        self.writers.len()
    }

    pub async fn write(&self, lane: usize, record: SinkRecord) -> Result<(), SinkError> {
        self.send(lane, WriterInput::Record(record)).await
    }

    pub async fn watermark(&self, lane: usize, watermark: i64) -> Result<(), SinkError> {
        self.send(lane, WriterInput::Watermark(watermark)).await
    }

    /// Injects `barrier` into every writer lane.
    pub async fn barrier(&self, barrier: CheckpointBarrier) -> Result<(), SinkError> {
        for lane in 0..self.writers.len() {
            self.send(lane, WriterInput::Barrier(barrier)).await?;
        }
        Ok(())
    }

    pub async fn end_input(&self) -> Result<(), SinkError> {
        for lane in 0..self.writers.len() {
            self.send(lane, WriterInput::EndOfInput).await?;
        }
        Ok(())
    }

    /// Waits for the next completed commit.
    pub async fn next_outcome(&mut self) -> Option<CommitOutcome> {
        self.outcomes.recv().await
    }

    /// Closes the inputs, waits for every stage and returns the outcomes not yet taken.
    ///
    /// When several stages fail the root cause wins over the resulting closed channels.
    pub async fn join(self) -> Result<Vec<CommitOutcome>, SinkError> {
        let SinkPipeline {
            writers,
            mut outcomes,
            stages,
            ..
        } = self;
        drop(writers);
        let mut failure: Option<SinkError> = None;
        for (stage, handle) in stages {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    error!(stage, error = %join_err, "pipeline stage panicked");
                    Err(SinkError::PipelineClosed(stage))
                }
            };
            let Err(err) = result else {
                continue;
            };
            let replace = match &failure {
                None => true,
                Some(SinkError::PipelineClosed(_)) => !matches!(err, SinkError::PipelineClosed(_)),
                Some(_) => false,
            };
            if replace {
                failure = Some(err);
            }
        }
        let mut collected = Vec::new();
        while let Ok(outcome) = outcomes.try_recv() {
            collected.push(outcome);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(collected),
        }
    }

    async fn send(&self, lane: usize, input: WriterInput) -> Result<(), SinkError> {
        let writer = self.writers.get(lane).ok_or_else(|| SinkError::Write {
            producer: lane as u32,
            reason: format!("no writer lane {lane}"),
        })?;
        writer
            .send(input)
            .await
            .map_err(|_| SinkError::PipelineClosed("writer"))
    }
}

async fn forward(
    output: &mpsc::Sender<LaneElement>,
    lane: usize,
    element: StreamElement,
    downstream: &'static str,
) -> Result<(), SinkError> {
    output
        .send((lane, element))
        .await
        .map_err(|_| SinkError::PipelineClosed(downstream))
}

async fn broadcast(workers: &[mpsc::Sender<StreamElement>], element: StreamElement) -> Result<(), SinkError> {
    for worker in workers {
        worker
            .send(element.clone())
            .await
            .map_err(|_| SinkError::PipelineClosed("compact-worker"))?;
    }
    Ok(())
}

async fn run_writer(
    lane: usize,
    mut writer: StoreSinkWriter,
    mut input: mpsc::Receiver<WriterInput>,
    output: mpsc::Sender<LaneElement>,
) -> Result<(), SinkError> {
    while let Some(command) = input.recv().await {
        match command {
            WriterInput::Record(record) => writer.write(record)?,
            WriterInput::Watermark(watermark) => {
                forward(&output, lane, StreamElement::Watermark(watermark), "downstream").await?;
            }
            WriterInput::Barrier(barrier) => {
                for committable in writer.prepare_commit(barrier.checkpoint_id)? {
                    forward(&output, lane, StreamElement::Committable(committable), "downstream")
                        .await?;
                }
                forward(&output, lane, StreamElement::Barrier(barrier), "downstream").await?;
            }
            WriterInput::EndOfInput => {
                for committable in writer.end_input()? {
                    forward(&output, lane, StreamElement::Committable(committable), "downstream")
                        .await?;
                }
                forward(&output, lane, StreamElement::EndOfInput, "downstream").await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn run_coordinator(
    mut coordinator: ChangelogCompactCoordinator,
    lanes: usize,
    mut input: mpsc::Receiver<LaneElement>,
    workers: Vec<mpsc::Sender<StreamElement>>,
) -> Result<(), SinkError> {
    let mut gate = InputGate::new(lanes);
    let mut next_worker = 0usize;
    while let Some((lane, element)) = input.recv().await {
        for event in gate.push(lane, element)? {
            let (routed, control) = match event {
                GateEvent::Committable { committable, .. } => (coordinator.process(committable)?, None),
                GateEvent::Watermark(watermark) => (Vec::new(), Some(StreamElement::Watermark(watermark))),
                GateEvent::Aligned(barrier) => (
                    coordinator.prepare_snapshot_pre_barrier(barrier.checkpoint_id),
                    Some(StreamElement::Barrier(barrier)),
                ),
                GateEvent::EndOfInput => (coordinator.end_input(), Some(StreamElement::EndOfInput)),
            };
            for committable in routed {
                let worker = &workers[next_worker % workers.len()];
                next_worker = next_worker.wrapping_add(1);
                worker
                    .send(StreamElement::Committable(committable))
                    .await
                    .map_err(|_| SinkError::PipelineClosed("compact-worker"))?;
            }
            if let Some(control) = control {
                let finished = matches!(control, StreamElement::EndOfInput);
                broadcast(&workers, control).await?;
                if finished {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

async fn run_worker(
    lane: usize,
    mut worker: ChangelogCompactWorker,
    mut input: mpsc::Receiver<StreamElement>,
    output: mpsc::Sender<LaneElement>,
) -> Result<(), SinkError> {
    while let Some(element) = input.recv().await {
        match element {
            StreamElement::Committable(committable) => {
                for produced in worker.process(committable)? {
                    forward(&output, lane, StreamElement::Committable(produced), "sorter").await?;
                }
            }
            StreamElement::EndOfInput => {
                forward(&output, lane, StreamElement::EndOfInput, "sorter").await?;
                return Ok(());
            }
            other => forward(&output, lane, other, "sorter").await?,
        }
    }
    Ok(())
}

async fn run_sorter(
    mut sorter: ChangelogCompactSorter,
    lanes: usize,
    mut input: mpsc::Receiver<LaneElement>,
    output: mpsc::Sender<LaneElement>,
) -> Result<(), SinkError> {
    let mut gate = InputGate::new(lanes);
    while let Some((lane, element)) = input.recv().await {
        for event in gate.push(lane, element)? {
            match event {
                GateEvent::Committable { committable, .. } => sorter.process(committable)?,
                GateEvent::Watermark(watermark) => {
                    forward(&output, 0, StreamElement::Watermark(watermark), "committer").await?;
                }
                GateEvent::Aligned(barrier) => {
                    for committable in sorter.flush(barrier.checkpoint_id) {
                        forward(&output, 0, StreamElement::Committable(committable), "committer")
                            .await?;
                    }
                    forward(&output, 0, StreamElement::Barrier(barrier), "committer").await?;
                }
                GateEvent::EndOfInput => {
                    for committable in sorter.end_input() {
                        forward(&output, 0, StreamElement::Committable(committable), "committer")
                            .await?;
                    }
                    forward(&output, 0, StreamElement::EndOfInput, "committer").await?;
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn spawn_committer(
    mut committer: CommitterOperator,
    mut input: mpsc::Receiver<LaneElement>,
    outcomes: mpsc::UnboundedSender<CommitOutcome>,
) -> JoinHandle<Result<(), SinkError>> {
    tokio::task::spawn_blocking(move || -> Result<(), SinkError> {
        for outcome in committer.initialize()? {
            let _ = outcomes.send(outcome);
        }
        while let Some((lane, element)) = input.blocking_recv() {
            for outcome in committer.process(lane, element)? {
                let _ = outcomes.send(outcome);
            }
        }
        info!(
            last_committed = ?committer.last_committed(),
            metrics = ?committer.metrics(),
            "committer stopped"
        );
        Ok(())
    })
}
