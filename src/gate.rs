//! Aligned input gate for single-instance stages.
//!
//! A stage fed by several upstream lanes sees checkpoint barriers once per
//! lane. After a lane delivers barrier N its later elements are held back until
//! every live lane has delivered N, so nothing stamped for N+1 is observed before
//! N is aligned. Lanes that reached end of input count as aligned.

use crate::committable::{CheckpointId, Committable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

/// Classification of a checkpoint by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointKind {
    Checkpoint,
    /// User-triggered durable recovery point.
    Savepoint,
}

/// Checkpoint boundary travelling alongside data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointBarrier {
    pub checkpoint_id: CheckpointId,
    pub kind: CheckpointKind,
}

impl CheckpointBarrier {
    pub fn checkpoint(checkpoint_id: CheckpointId) -> Self {
        Self {
            checkpoint_id,
            kind: CheckpointKind::Checkpoint,
        }
    }

    pub fn savepoint(checkpoint_id: CheckpointId) -> Self {
        Self {
            checkpoint_id,
            kind: CheckpointKind::Savepoint,
        }
    }

    pub fn is_savepoint(&self) -> bool {
        self.kind == CheckpointKind::Savepoint
    }
}

/// Element delivered on one upstream lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamElement {
    Committable(Committable),
    Watermark(i64),
    Barrier(CheckpointBarrier),
    EndOfInput,
}

/// Element released by the gate in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    Committable { lane: usize, committable: Committable },
    /// Minimum watermark across live lanes advanced.
    Watermark(i64),
    /// Every live lane delivered this barrier.
    Aligned(CheckpointBarrier),
    /// Every lane reached end of input.
    EndOfInput,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("lane {lane} out of range for gate with {lanes} lanes")]
    UnknownLane { lane: usize, lanes: usize },
    #[error("barrier {got} arrived while barrier {expected} is still aligning")]
    MisalignedBarrier {
        expected: CheckpointId,
        got: CheckpointId,
    },
    #[error("barrier {got} does not advance past aligned barrier {last}")]
    BarrierRegression { last: CheckpointId, got: CheckpointId },
    #[error("lane {lane} delivered data after end of input")]
    ElementAfterEnd { lane: usize },
}

/// Barrier aligner over a fixed number of upstream lanes.
#[derive(Debug, Clone)]
pub struct InputGate {
    lanes: usize,
    pending: Option<CheckpointBarrier>,
    arrived: BTreeSet<usize>,
    ended: BTreeSet<usize>,
    held: Vec<VecDeque<StreamElement>>,
    lane_watermarks: Vec<Option<i64>>,
    emitted_watermark: Option<i64>,
    last_aligned: Option<CheckpointId>,
    finished: bool,
}

impl InputGate {
    pub fn new(lanes: usize) -> Self {
        let lanes = lanes.max(1);
        Self {
            lanes,
            pending: None,
            arrived: BTreeSet::new(),
            ended: BTreeSet::new(),
            held: (0..lanes).map(|_| VecDeque::new()).collect(),
            lane_watermarks: vec![None; lanes],
            emitted_watermark: None,
            last_aligned: None,
            finished: false,
        }
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Barrier currently waiting for lanes, if any.
    pub fn pending_barrier(&self) -> Option<CheckpointBarrier> {
        self.pending
    }

    pub fn last_aligned(&self) -> Option<CheckpointId> {
        self.last_aligned
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Accepts an element from `lane` and returns whatever became releasable.
    pub fn push(&mut self, lane: usize, element: StreamElement) -> Result<Vec<GateEvent>, GateError> {
        if lane >= self.lanes {
            return Err(GateError::UnknownLane {
                lane,
                lanes: self.lanes,
            });
        }
        let mut released = Vec::new();
        self.accept(lane, element, &mut released)?;
        Ok(released)
    }

    fn accept(
        &mut self,
        lane: usize,
        element: StreamElement,
        out: &mut Vec<GateEvent>,
    ) -> Result<(), GateError> {
        if self.arrived.contains(&lane) {
            self.held[lane].push_back(element);
            return Ok(());
        }
        if self.ended.contains(&lane) {
            return Err(GateError::ElementAfterEnd { lane });
        }
        match element {
            StreamElement::Committable(committable) => {
                out.push(GateEvent::Committable { lane, committable });
            }
            StreamElement::Watermark(watermark) => {
                let slot = &mut self.lane_watermarks[lane];
                *slot = Some(slot.map_or(watermark, |current| current.max(watermark)));
                self.advance_watermark(out);
            }
            StreamElement::Barrier(barrier) => {
                match self.pending {
                    Some(expected) if expected.checkpoint_id != barrier.checkpoint_id => {
                        return Err(GateError::MisalignedBarrier {
                            expected: expected.checkpoint_id,
                            got: barrier.checkpoint_id,
                        });
                    }
                    Some(_) => {}
                    None => {
                        if let Some(last) = self.last_aligned {
                            if barrier.checkpoint_id <= last {
                                return Err(GateError::BarrierRegression {
                                    last,
                                    got: barrier.checkpoint_id,
                                });
                            }
                        }
                        self.pending = Some(barrier);
                    }
                }
                self.arrived.insert(lane);
                self.try_align(out)?;
            }
            StreamElement::EndOfInput => {
                self.ended.insert(lane);
                self.lane_watermarks[lane] = None;
                self.advance_watermark(out);
                self.try_align(out)?;
                if !self.finished && self.ended.len() == self.lanes {
                    self.finished = true;
                    out.push(GateEvent::EndOfInput);
                }
            }
        }
        Ok(())
    }

    fn try_align(&mut self, out: &mut Vec<GateEvent>) -> Result<(), GateError> {
        let Some(barrier) = self.pending else {
            return Ok(());
        };
        let aligned =
            (0..self.lanes).all(|lane| self.arrived.contains(&lane) || self.ended.contains(&lane));
        if !aligned {
            return Ok(());
        }
        self.pending = None;
        self.arrived.clear();
        self.last_aligned = Some(barrier.checkpoint_id);
        out.push(GateEvent::Aligned(barrier));
        let held: Vec<(usize, VecDeque<StreamElement>)> = self
            .held
            .iter_mut()
            .enumerate()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(lane, queue)| (lane, std::mem::take(queue)))
            .collect();
        for (lane, queue) in held {
            for element in queue {
                self.accept(lane, element, out)?;
            }
        }
        Ok(())
    }

    fn advance_watermark(&mut self, out: &mut Vec<GateEvent>) {
        let mut combined: Option<i64> = None;
        for (lane, watermark) in self.lane_watermarks.iter().enumerate() {
            if self.ended.contains(&lane) {
                continue;
            }
            match watermark {
                None => return,
                Some(value) => combined = Some(combined.map_or(*value, |c| c.min(*value))),
            }
        }
        if let Some(value) = combined {
            if self.emitted_watermark.map_or(true, |emitted| value > emitted) {
                self.emitted_watermark = Some(value);
                out.push(GateEvent::Watermark(value));
            }
        }
    }
}
