use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};

/// Bounded exponential retry schedule for transient block I/O failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    time_budget: Option<Duration>,
}

impl RetryPolicy {
    /// Doubles `base_delay` after every failed attempt.
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
            time_budget: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay).filter(|delay| !delay.is_zero());
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget.filter(|duration| !duration.is_zero());
        self
    }

    pub fn handle(&self) -> RetryHandle {
        let started = Instant::now();
        RetryHandle {
            deadline: self
                .time_budget
                .and_then(|budget| started.checked_add(budget)),
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let raw = self.base_delay.saturating_mul(1u32 << shift);
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction == 0.0 {
            return bounded;
        }
        let factor = thread_rng()
            .gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        bounded.mul_f64(factor)
    }
}

/// Per-operation retry state produced by [`RetryPolicy::handle`].
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Delay to wait before the next attempt, or `None` once attempts or the
    /// time budget are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        let next = self.attempts + 1;
        let delay = self.policy.delay_for_attempt(next);
        if let Some(deadline) = self.deadline {
            match Instant::now().checked_add(delay) {
                Some(resume_at) if resume_at <= deadline => {}
                _ => return None,
            }
        }
        self.attempts = next;
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
