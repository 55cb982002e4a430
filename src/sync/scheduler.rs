//! Retry scheduling
//!
//! Failed operations waiting out their backoff are kept in a deadline queue instead of spawning a
//! timer per operation. The control loop asks for due ids and sleeps until the next deadline. Time
//! comes from a [`Clock`] so tests can advance it by hand.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.origin + offset
    }
}

/// Deadline queue of operation ids awaiting another attempt
pub struct RetryScheduler {
    clock: Arc<dyn Clock>,
    /// `(deadline, sequence, operation id)`; the sequence keeps equal deadlines FIFO
    deadlines: BinaryHeap<Reverse<(Instant, u64, String)>>,
    sequence: u64,
}

impl RetryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            deadlines: BinaryHeap::new(),
            sequence: 0,
        }
    }

    /// Schedule an operation to become due after `delay`, replacing any earlier entry for it
    pub fn schedule(&mut self, operation_id: &str, delay: Duration) {
        self.cancel(operation_id);
        let deadline = self.clock.now() + delay;
        self.sequence += 1;
        self.deadlines
            .push(Reverse((deadline, self.sequence, operation_id.to_string())));
    }

    pub fn cancel(&mut self, operation_id: &str) -> bool {
        let before = self.deadlines.len();
        self.deadlines
            .retain(|Reverse((_, _, id))| id != operation_id);
        self.deadlines.len() != before
    }

    /// Remove and return every id whose deadline has passed, earliest first
    pub fn due(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = self.deadlines.pop() {
                due.push(id);
            }
        }
        due
    }

    /// Time until the earliest deadline; zero when something is already due
    pub fn next_due_in(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.deadlines
            .peek()
            .map(|Reverse((deadline, _, _))| deadline.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}
