use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send {
    fn now_ms(&mut self) -> u64;
}

/// Clock backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&mut self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }
}

/// Clock replaying a fixed list of readings, repeating the last one when exhausted.
#[derive(Debug, Clone)]
pub struct ManualClock {
    readings: Vec<u64>,
    idx: usize,
}

impl ManualClock {
    pub fn new(readings: Vec<u64>) -> Self {
        Self { readings, idx: 0 }
    }

    /// Clock that always reports `at_ms`.
    pub fn fixed(at_ms: u64) -> Self {
        Self::new(vec![at_ms])
    }
}

impl Clock for ManualClock {
    fn now_ms(&mut self) -> u64 {
        let reading = self
            .readings
            .get(self.idx)
            .or_else(|| self.readings.last())
            .copied()
            .unwrap_or(0);
        self.idx += 1;
        reading
    }
}

/// Stamps strictly increasing creation times so files written by one producer never tie.
#[derive(Debug, Clone)]
pub struct CreationTicker<C: Clock> {
    clock: C,
    last_tick_ms: Option<u64>,
}

impl<C: Clock> CreationTicker<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last_tick_ms: None,
        }
    }

    /// Returns the next creation timestamp.
    pub fn next_tick_ms(&mut self) -> u64 {
        let mut tick_ms = self.clock.now_ms();
        if let Some(last) = self.last_tick_ms {
            if tick_ms <= last {
                tick_ms = last + 1;
            }
        }
        self.last_tick_ms = Some(tick_ms);
        tick_ms
    }
}
