use super::{
    CommitHook, CommitOutcome, CommitStatus, CommittableStateManager, Committer, CommitterState,
    NoopCommittableStateManager,
};
use crate::clock::{Clock, SystemClock};
use crate::committable::{CheckpointId, Committable, CommittableKind, END_INPUT_CHECKPOINT_ID};
use crate::error::SinkError;
use crate::gate::{CheckpointBarrier, GateEvent, InputGate, StreamElement};
use crate::logging::{JsonLineLogger, LogLevel};
use crate::store::Snapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

const STAGE: &str = "committer";

/// Lifecycle of one checkpoint inside the committer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EpochPhase {
    /// Committables are arriving.
    Open,
    /// Merged into a single unit and persisted as pending.
    Aggregated,
    Applying,
    Committed,
    Failed,
}

/// Counters exposed by the committer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitterMetrics {
    pub snapshots_committed: u64,
    pub empty_skipped: u64,
    pub duplicates_discarded: u64,
    pub apply_retries: u64,
    pub hook_failures: u64,
    pub recommitted: u64,
}

type CommitterFactory = Box<dyn FnOnce(String) -> Box<dyn Committer> + Send>;

/// Assembles a [`CommitterOperator`].
pub struct CommitterOperatorBuilder {
    initial_commit_user: String,
    factory: CommitterFactory,
    state_manager: Box<dyn CommittableStateManager>,
    lanes: usize,
    checkpointing_enabled: bool,
    end_input_watermark: Option<i64>,
    hooks: Vec<Box<dyn CommitHook>>,
    clock: Box<dyn Clock>,
    audit: JsonLineLogger,
}

impl CommitterOperatorBuilder {
    /// `factory` receives the effective commit user once state is restored.
    pub fn new<F>(initial_commit_user: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(String) -> Box<dyn Committer> + Send + 'static,
    {
        Self {
            initial_commit_user: initial_commit_user.into(),
            factory: Box::new(factory),
            state_manager: Box::new(NoopCommittableStateManager),
            lanes: 1,
            checkpointing_enabled: true,
            end_input_watermark: None,
            hooks: Vec::new(),
            clock: Box::new(SystemClock),
            audit: JsonLineLogger::default(),
        }
    }

    pub fn state_manager(mut self, manager: impl CommittableStateManager + 'static) -> Self {
        self.state_manager = Box::new(manager);
        self
    }

    pub fn boxed_state_manager(mut self, manager: Box<dyn CommittableStateManager>) -> Self {
        self.state_manager = manager;
        self
    }

    /// Number of upstream lanes whose barriers must align.
    pub fn lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn checkpointing(mut self, enabled: bool) -> Self {
        self.checkpointing_enabled = enabled;
        self
    }

    pub fn end_input_watermark(mut self, watermark: Option<i64>) -> Self {
        self.end_input_watermark = watermark;
        self
    }

    pub fn hook(mut self, hook: impl CommitHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn boxed_hook(mut self, hook: Box<dyn CommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn audit_log(mut self, audit: JsonLineLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> CommitterOperator {
        CommitterOperator {
            initial_commit_user: self.initial_commit_user,
            factory: Some(self.factory),
            committer: None,
            state_manager: self.state_manager,
            gate: InputGate::new(self.lanes),
            inputs: BTreeMap::new(),
            state: None,
            phases: BTreeMap::new(),
            watermark: None,
            checkpointing_enabled: self.checkpointing_enabled,
            end_input_watermark: self.end_input_watermark,
            hooks: self.hooks,
            clock: self.clock,
            audit: self.audit,
            metrics: CommitterMetrics::default(),
            latest_snapshot: None,
        }
    }
}

/// Singleton stage that turns aligned checkpoints into ordered snapshots.
///
/// Call [`CommitterOperator::initialize`] once before feeding elements. Each
/// aligned barrier aggregates every buffered checkpoint up to it, persists the
/// pending units, then commits them in increasing order. The high-water mark is
/// persisted after every successful commit so a restart never reapplies it.
pub struct CommitterOperator {
    initial_commit_user: String,
    factory: Option<CommitterFactory>,
    committer: Option<Box<dyn Committer>>,
    state_manager: Box<dyn CommittableStateManager>,
    gate: InputGate,
    inputs: BTreeMap<CheckpointId, Vec<Committable>>,
    state: Option<CommitterState>,
    phases: BTreeMap<CheckpointId, EpochPhase>,
    watermark: Option<i64>,
    checkpointing_enabled: bool,
    end_input_watermark: Option<i64>,
    hooks: Vec<Box<dyn CommitHook>>,
    clock: Box<dyn Clock>,
    audit: JsonLineLogger,
    metrics: CommitterMetrics,
    latest_snapshot: Option<Snapshot>,
}

impl CommitterOperator {
    /// Restores state and recommits whatever was pending when the previous run stopped.
    pub fn initialize(&mut self) -> Result<Vec<CommitOutcome>, SinkError> {
        let Some(factory) = self.factory.take() else {
            return Err(SinkError::PipelineClosed("committer already initialized"));
        };
        let mut state = self.state_manager.restore(&self.initial_commit_user)?;
        if state.commit_user != self.initial_commit_user {
            info!(commit_user = %state.commit_user, "restored commit user");
        }
        let mut committer = factory(state.commit_user.clone());
        let pending: Vec<_> = state.pending.values().cloned().collect();
        let outcomes = committer.filter_and_commit(pending)?;

        let mut recommitted = 0usize;
        for outcome in &outcomes {
            state.mark_committed(outcome.checkpoint_id);
            match outcome.status {
                CommitStatus::Committed => {
                    recommitted += 1;
                    self.metrics.snapshots_committed += 1;
                    self.metrics.apply_retries += u64::from(outcome.attempts.saturating_sub(1));
                }
                CommitStatus::SkippedEmpty => self.metrics.empty_skipped += 1,
                CommitStatus::AlreadyCommitted => {}
            }
            if let Some(snapshot) = &outcome.snapshot {
                self.latest_snapshot = Some(snapshot.clone());
            }
        }
        self.metrics.recommitted += recommitted as u64;
        self.state_manager.snapshot(&state)?;
        info!(
            commit_user = %state.commit_user,
            last_committed = ?state.last_committed,
            recommitted,
            "committer initialized"
        );
        if let Some(last) = state.last_committed {
            self.phases.insert(last, EpochPhase::Committed);
        }
        self.committer = Some(committer);
        self.state = Some(state);

        if recommitted > 0 && self.state_manager.restart_after_recommit() {
            return Err(SinkError::RestartAfterRecommit { recommitted });
        }
        Ok(outcomes)
    }

    /// Feeds one element from upstream `lane`, returning the commits it completed.
    pub fn process(
        &mut self,
        lane: usize,
        element: StreamElement,
    ) -> Result<Vec<CommitOutcome>, SinkError> {
        self.ensure_initialized()?;
        let mut outcomes = Vec::new();
        for event in self.gate.push(lane, element)? {
            match event {
                GateEvent::Committable { committable, .. } => self.accept(committable)?,
                GateEvent::Watermark(watermark) => {
                    self.watermark = Some(self.watermark.map_or(watermark, |w| w.max(watermark)));
                }
                GateEvent::Aligned(barrier) => outcomes.extend(self.on_barrier(barrier)?),
                GateEvent::EndOfInput => outcomes.extend(self.end_input()?),
            }
        }
        Ok(outcomes)
    }

    /// Tells hooks that the substrate abandoned `checkpoint_id`.
    pub fn notify_checkpoint_aborted(&mut self, checkpoint_id: CheckpointId) -> Result<(), SinkError> {
        warn!(checkpoint_id, "checkpoint aborted");
        let mut failures = Vec::new();
        Self::run_hooks(
            &mut self.hooks,
            &mut self.metrics,
            checkpoint_id,
            &mut failures,
            |hook| hook.on_checkpoint_aborted(checkpoint_id),
        )
    }

    pub fn commit_user(&self) -> Option<&str> {
        self.state.as_ref().map(|state| state.commit_user.as_str())
    }

    pub fn last_committed(&self) -> Option<CheckpointId> {
        self.state.as_ref().and_then(|state| state.last_committed)
    }

    /// Phase of a checkpoint newer than, or equal to, the last committed one.
    pub fn phase(&self, checkpoint_id: CheckpointId) -> Option<EpochPhase> {
        self.phases.get(&checkpoint_id).copied()
    }

    pub fn pending_checkpoints(&self) -> Vec<CheckpointId> {
        self.state
            .as_ref()
            .map(|state| state.pending.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> CommitterMetrics {
        self.metrics
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest_snapshot.as_ref()
    }

    pub fn audit_log(&self) -> &JsonLineLogger {
        &self.audit
    }

    fn ensure_initialized(&self) -> Result<(), SinkError> {
        if self.committer.is_none() || self.state.is_none() {
            return Err(SinkError::PipelineClosed("committer not initialized"));
        }
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut Box<dyn Committer>, &mut CommitterState), SinkError> {
        match (self.committer.as_mut(), self.state.as_mut()) {
            (Some(committer), Some(state)) => Ok((committer, state)),
            _ => Err(SinkError::PipelineClosed("committer not initialized")),
        }
    }

    fn accept(&mut self, committable: Committable) -> Result<(), SinkError> {
        let checkpoint_id = committable.checkpoint_id();
        let (_, state) = self.parts()?;
        if state.is_committed(checkpoint_id) || state.pending.contains_key(&checkpoint_id) {
            self.metrics.duplicates_discarded += 1;
            debug!(
                checkpoint_id,
                producer = committable.producer(),
                "discarding redelivered committable"
            );
            return Ok(());
        }
        if let CommittableKind::CompactTask(_) = committable.kind() {
            return Err(SinkError::UnexpectedCommittable {
                stage: STAGE,
                kind: committable.kind().as_str(),
                checkpoint_id,
            });
        }
        self.phases.entry(checkpoint_id).or_insert(EpochPhase::Open);
        self.inputs.entry(checkpoint_id).or_default().push(committable);
        Ok(())
    }

    fn on_barrier(&mut self, barrier: CheckpointBarrier) -> Result<Vec<CommitOutcome>, SinkError> {
        let checkpoint_id = barrier.checkpoint_id;
        let (_, state) = self.parts()?;
        if state.is_committed(checkpoint_id) {
            self.discard_replayed(checkpoint_id);
            return Ok(Vec::new());
        }
        for hook in self.hooks.iter_mut() {
            hook.on_checkpoint(&barrier);
        }
        if !self.checkpointing_enabled {
            return Ok(Vec::new());
        }
        self.aggregate_up_to(checkpoint_id)?;
        self.commit_up_to(checkpoint_id)
    }

    /// Drops a redelivered barrier, and anything buffered under it, for a checkpoint already confirmed.
    fn discard_replayed(&mut self, checkpoint_id: CheckpointId) {
        let later = match checkpoint_id.checked_add(1) {
            Some(next) => self.inputs.split_off(&next),
            None => BTreeMap::new(),
        };
        let dropped = std::mem::replace(&mut self.inputs, later);
        self.metrics.duplicates_discarded += 1;
        debug!(
            checkpoint_id,
            buffered = dropped.len(),
            "discarding barrier of committed checkpoint"
        );
    }

    fn end_input(&mut self) -> Result<Vec<CommitOutcome>, SinkError> {
        if let Some(watermark) = self.end_input_watermark {
            self.watermark = Some(watermark);
        }
        let (_, state) = self.parts()?;
        let mut outcomes = Vec::new();
        if state.is_committed(END_INPUT_CHECKPOINT_ID) {
            info!("end of input already committed");
        } else {
            self.aggregate_up_to(END_INPUT_CHECKPOINT_ID)?;
            outcomes = self.commit_up_to(END_INPUT_CHECKPOINT_ID)?;
        }

        let latest = self.latest_snapshot.clone();
        let mut failures = Vec::new();
        Self::run_hooks(
            &mut self.hooks,
            &mut self.metrics,
            END_INPUT_CHECKPOINT_ID,
            &mut failures,
            |hook| hook.on_end_input(latest.as_ref()),
        )?;
        if let Some(last) = outcomes.last_mut() {
            last.hook_failures.extend(failures);
        }
        self.record(LogLevel::Info, Some(END_INPUT_CHECKPOINT_ID), "end of input");
        Ok(outcomes)
    }

    /// Merges every buffered checkpoint up to `checkpoint_id` and persists them as pending.
    fn aggregate_up_to(&mut self, checkpoint_id: CheckpointId) -> Result<(), SinkError> {
        let ready = match checkpoint_id.checked_add(1) {
            Some(next) => {
                let later = self.inputs.split_off(&next);
                std::mem::replace(&mut self.inputs, later)
            }
            None => std::mem::take(&mut self.inputs),
        };
        let watermark = self.watermark;
        let (committer, state) = self.parts()?;
        let mut aggregated = Vec::new();
        for (id, committables) in ready {
            let manifest = committer.combine(id, watermark, committables)?;
            state.pending.insert(id, manifest);
            aggregated.push(id);
        }
        if !state.pending.contains_key(&checkpoint_id) {
            let manifest = committer.combine(checkpoint_id, watermark, Vec::new())?;
            state.pending.insert(checkpoint_id, manifest);
            aggregated.push(checkpoint_id);
        }
        for id in aggregated {
            self.phases.insert(id, EpochPhase::Aggregated);
        }
        if let Some(state) = self.state.as_ref() {
            self.state_manager.snapshot(state)?;
        }
        Ok(())
    }

    /// Applies pending units up to `checkpoint_id` one at a time in increasing order.
    fn commit_up_to(&mut self, checkpoint_id: CheckpointId) -> Result<Vec<CommitOutcome>, SinkError> {
        let (_, state) = self.parts()?;
        let ids: Vec<CheckpointId> = state.pending.range(..=checkpoint_id).map(|(id, _)| *id).collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(outcome) = self.commit_one(id)? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    fn commit_one(&mut self, checkpoint_id: CheckpointId) -> Result<Option<CommitOutcome>, SinkError> {
        let (_, state) = self.parts()?;
        if state.is_committed(checkpoint_id) {
            state.pending.remove(&checkpoint_id);
            self.metrics.duplicates_discarded += 1;
            debug!(checkpoint_id, "dropping pending unit of committed checkpoint");
            return Ok(None);
        }
        let Some(manifest) = state.pending.get(&checkpoint_id).cloned() else {
            return Err(SinkError::PipelineClosed("pending commit disappeared"));
        };

        let mut failures = Vec::new();
        Self::run_hooks(
            &mut self.hooks,
            &mut self.metrics,
            checkpoint_id,
            &mut failures,
            |hook| hook.pre_commit(&manifest),
        )?;

        self.phases.insert(checkpoint_id, EpochPhase::Applying);
        let (committer, _) = self.parts()?;
        let mut outcome = match committer.commit(&manifest) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.phases.insert(checkpoint_id, EpochPhase::Failed);
                error!(checkpoint_id, error = %err, "commit failed");
                self.record(LogLevel::Error, Some(checkpoint_id), &err.to_string());
                return Err(err);
            }
        };

        let (_, state) = self.parts()?;
        state.mark_committed(checkpoint_id);
        if let Some(state) = self.state.as_ref() {
            self.state_manager.snapshot(state)?;
        }
        self.phases = self.phases.split_off(&checkpoint_id);
        self.phases.insert(checkpoint_id, EpochPhase::Committed);

        match outcome.status {
            CommitStatus::Committed => {
                self.metrics.snapshots_committed += 1;
                self.metrics.apply_retries += u64::from(outcome.attempts.saturating_sub(1));
            }
            CommitStatus::SkippedEmpty => self.metrics.empty_skipped += 1,
            CommitStatus::AlreadyCommitted => {}
        }

        if let Some(snapshot) = outcome.snapshot.clone() {
            Self::run_hooks(
                &mut self.hooks,
                &mut self.metrics,
                checkpoint_id,
                &mut failures,
                |hook| hook.post_commit(&manifest, &snapshot),
            )?;
            self.latest_snapshot = Some(snapshot);
        }
        for hook in self.hooks.iter_mut() {
            hook.on_checkpoint_committed(checkpoint_id);
        }
        outcome.hook_failures.extend(failures);

        let message = match (&outcome.status, &outcome.snapshot) {
            (CommitStatus::Committed, Some(snapshot)) => {
                format!("committed snapshot {} with {} files", snapshot.id, manifest.file_count())
            }
            (CommitStatus::SkippedEmpty, _) => "skipped empty commit".to_string(),
            _ => "already committed".to_string(),
        };
        self.record(LogLevel::Info, Some(checkpoint_id), &message);
        Ok(Some(outcome))
    }

    /// Runs `call` on every hook. Non-fatal failures are collected, fatal ones stop the loop.
    fn run_hooks<F>(
        hooks: &mut [Box<dyn CommitHook>],
        metrics: &mut CommitterMetrics,
        checkpoint_id: CheckpointId,
        failures: &mut Vec<String>,
        mut call: F,
    ) -> Result<(), SinkError>
    where
        F: FnMut(&mut dyn CommitHook) -> Result<(), SinkError>,
    {
        for hook in hooks.iter_mut() {
            if let Err(err) = call(hook.as_mut()) {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(hook = hook.name(), checkpoint_id, error = %err, "commit hook failed");
                metrics.hook_failures += 1;
                failures.push(format!("{}: {}", hook.name(), err));
            }
        }
        Ok(())
    }

    fn record(&mut self, level: LogLevel, checkpoint_id: Option<CheckpointId>, message: &str) {
        let ts = self.clock.now_ms();
        if let Err(err) = self.audit.log(ts, level, STAGE, checkpoint_id, message) {
            warn!(error = %err, "failed to append audit record");
        }
    }
}
