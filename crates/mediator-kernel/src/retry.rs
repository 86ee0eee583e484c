use serde::{Deserialize, Serialize};

/// Capped schedule: delays are used in order, the last one repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    delays: Vec<u64>,
}

impl BackoffSchedule {
    /// An empty schedule degenerates to immediate retries.
    pub fn new(delays: Vec<u64>) -> Self {
        Self { delays }
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> u64 {
        if self.delays.is_empty() {
            return 0;
        }
        let idx = (failures.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn delays(&self) -> &[u64] {
        &self.delays
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Wait { delay_ms: u64 },
    Exhausted { elapsed_ms: u64, next_delay_ms: u64 },
}

/// Bounded retry state for one logical delivery.
///
/// Retrying stops once `elapsed + next_delay` reaches the window.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    schedule: BackoffSchedule,
    max_window_ms: u64,
    started_at_ms: i64,
    attempts: u32,
    applied_ms: Vec<u64>,
}

impl RetryBudget {
    pub fn new(schedule: BackoffSchedule, max_window_ms: u64, started_at_ms: i64) -> Self {
        Self {
            schedule,
            max_window_ms,
            started_at_ms,
            attempts: 0,
            applied_ms: Vec::new(),
        }
    }

    /// Registers an attempt and returns its 1-based index.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Decides what follows a retryable failure of the current attempt.
    pub fn after_retryable_failure(&mut self, now_ms: i64) -> RetryStep {
        let elapsed_ms = now_ms.saturating_sub(self.started_at_ms).max(0) as u64;
        let next_delay_ms = self.schedule.delay_after(self.attempts);
        if elapsed_ms.saturating_add(next_delay_ms) >= self.max_window_ms {
            return RetryStep::Exhausted {
                elapsed_ms,
                next_delay_ms,
            };
        }
        self.applied_ms.push(next_delay_ms);
        RetryStep::Wait {
            delay_ms: next_delay_ms,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn applied_ms(&self) -> &[u64] {
        &self.applied_ms
    }

    pub fn max_window_ms(&self) -> u64 {
        self.max_window_ms
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }
}
