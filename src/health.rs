//! Health Monitor (C5): sliding-window hysteresis over probe results for
//! one backing store (primary or fallback).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum HealthCheckResult {
    Healthy { latency: Duration },
    Unhealthy { reason: String },
    Unknown,
}

impl HealthCheckResult {
    pub fn healthy(latency: Duration) -> Self {
        HealthCheckResult::Healthy { latency }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        HealthCheckResult::Unhealthy { reason: reason.into() }
    }

    pub fn unknown() -> Self {
        HealthCheckResult::Unknown
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthCheckResult::Healthy { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthCheckSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub timestamp_ms: Option<i64>,
    pub last_error: Option<String>,
    pub window_failure_rate: f64,
}

/// Tracks a sliding window of the last N probe outcomes alongside
/// consecutive-failure/success counters. The window is the authoritative
/// signal for state-transition decisions (it smooths over a single flaky
/// probe); the consecutive counters exist for fast-path logging and the
/// minimum-recovery-interval gate.
pub struct HealthTracker {
    window_size: usize,
    failure_threshold: u32,
    recovery_threshold: u32,
    min_recovery_interval: Duration,
    window: VecDeque<bool>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy: bool,
    last_error: Option<String>,
    last_timestamp_ms: Option<i64>,
    last_state_change: Instant,
}

impl HealthTracker {
    pub fn new(
        window_size: usize,
        failure_threshold: u32,
        recovery_threshold: u32,
        min_recovery_interval: Duration,
    ) -> Self {
        Self {
            window_size: window_size.max(1),
            failure_threshold,
            recovery_threshold,
            min_recovery_interval,
            window: VecDeque::with_capacity(window_size.max(1)),
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy: true,
            last_error: None,
            last_timestamp_ms: None,
            last_state_change: Instant::now(),
        }
    }

    pub fn process(&mut self, result: HealthCheckResult) {
        self.last_timestamp_ms = Some(crate::types::now_ms() as i64);

        match result {
            HealthCheckResult::Healthy { .. } => {
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
                self.last_error = None;
                self.push_window(true);
            }
            HealthCheckResult::Unhealthy { reason } => {
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                self.last_error = Some(reason);
                self.push_window(false);
            }
            HealthCheckResult::Unknown => {
                // Does not perturb the window; used for a store that is
                // configured off (e.g. fallback disabled).
                return;
            }
        }

        let was_healthy = self.healthy;
        if !self.healthy && self.is_recovery_threshold_reached() {
            self.healthy = true;
        } else if self.healthy && self.consecutive_failures >= self.failure_threshold {
            self.healthy = false;
        }
        if was_healthy != self.healthy {
            self.last_state_change = Instant::now();
        }
    }

    fn push_window(&mut self, ok: bool) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }

    pub fn is_recovery_threshold_reached(&self) -> bool {
        self.consecutive_successes >= self.recovery_threshold
            && self.last_state_change.elapsed() >= self.min_recovery_interval
    }

    fn window_failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn snapshot(&self) -> HealthCheckSnapshot {
        HealthCheckSnapshot {
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            timestamp_ms: self.last_timestamp_ms,
            last_error: self.last_error.clone(),
            window_failure_rate: self.window_failure_rate(),
        }
    }
}
