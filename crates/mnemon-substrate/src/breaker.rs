//! Write-path circuit breaker.
//!
//! Sheds ingestion load after a failure burst: `closed` (normal) -> `open`
//! (fast-fail) -> `half-open` (single trial) -> closed or open again. One
//! breaker instance is shared by every concurrent ingestion, so all state
//! lives behind a mutex-guarded sliding window of failure instants.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use mnemon_types::config::BreakerConfig;

/// Current state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    /// Normal operation, requests flow through.
    Closed,
    /// Failure threshold exceeded, requests fast-fail.
    Open,
    /// Cooldown expired; a single trial request is allowed through.
    HalfOpen,
}

/// Verdict for one incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// Breaker is closed, proceed normally.
    Allow,
    /// Breaker is half-open; this is the one trial request.
    AllowProbe,
    /// Breaker is open, fast-fail without invoking the pipeline.
    Reject {
        reason: String,
        retry_after_secs: u64,
    },
}

#[derive(Debug)]
struct Inner {
    /// Failure instants within the sliding window.
    failures: VecDeque<Instant>,
    /// When the breaker opened, if it is open.
    opened_at: Option<Instant>,
    /// Whether the half-open trial has been handed out.
    probe_inflight: bool,
    /// Reason attached to the most recent failure.
    last_reason: Option<String>,
}

/// Snapshot of the breaker for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub recent_failures: usize,
    pub open_remaining_secs: Option<u64>,
    pub last_failure_reason: Option<String>,
}

/// The write-path guard. Check before invoking the pipeline; report every
/// pipeline outcome back through `record_success` / `record_failure`.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                failures: VecDeque::new(),
                opened_at: None,
                probe_inflight: false,
                last_reason: None,
            }),
        }
    }

    /// Decide whether one request may proceed.
    ///
    /// While open, exactly one trial is handed out per half-open period;
    /// everything else is rejected until the trial reports back.
    pub fn check(&self) -> BreakerVerdict {
        let mut inner = self.lock();
        let Some(opened_at) = inner.opened_at else {
            return BreakerVerdict::Allow;
        };

        let reset_timeout = Duration::from_secs(self.config.reset_timeout_seconds);
        let elapsed = opened_at.elapsed();
        if elapsed < reset_timeout {
            let reason = inner
                .last_reason
                .clone()
                .unwrap_or_else(|| "failure burst".to_string());
            return BreakerVerdict::Reject {
                reason,
                retry_after_secs: (reset_timeout - elapsed).as_secs(),
            };
        }

        if inner.probe_inflight {
            return BreakerVerdict::Reject {
                reason: "half-open trial in flight".to_string(),
                retry_after_secs: 0,
            };
        }
        inner.probe_inflight = true;
        debug!("Circuit breaker half-open, allowing trial request");
        BreakerVerdict::AllowProbe
    }

    /// Whether requests would currently fast-fail.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Current breaker state.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) => {
                if opened_at.elapsed() < Duration::from_secs(self.config.reset_timeout_seconds) {
                    BreakerState::Open
                } else {
                    BreakerState::HalfOpen
                }
            }
        }
    }

    /// Report a successful pipeline outcome: closes the breaker and clears
    /// the failure window.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.opened_at.is_some() {
            info!("Circuit breaker closing: write path recovered");
        }
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_inflight = false;
        inner.last_reason = None;
    }

    /// Report a failed pipeline outcome. A failed half-open trial reopens
    /// the breaker; inside the closed state, failures accumulate in the
    /// sliding window until the threshold trips.
    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_reason = Some(reason.to_string());

        if inner.opened_at.is_some() {
            inner.opened_at = Some(now);
            inner.probe_inflight = false;
            warn!(reason, "Circuit breaker trial failed, reopening");
            return;
        }

        inner.failures.push_back(now);
        let window = Duration::from_secs(self.config.window_seconds);
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        if inner.failures.len() as u32 >= self.config.failure_threshold {
            inner.opened_at = Some(now);
            inner.probe_inflight = false;
            warn!(
                reason,
                failures = inner.failures.len(),
                window_seconds = self.config.window_seconds,
                "Circuit breaker opening"
            );
        }
    }

    /// Snapshot for health reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.lock();
        let open_remaining_secs = inner.opened_at.and_then(|opened_at| {
            let reset_timeout = Duration::from_secs(self.config.reset_timeout_seconds);
            let elapsed = opened_at.elapsed();
            if elapsed < reset_timeout {
                Some((reset_timeout - elapsed).as_secs())
            } else {
                None
            }
        });
        BreakerSnapshot {
            state,
            recent_failures: inner.failures.len(),
            open_remaining_secs,
            last_failure_reason: inner.last_reason.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned breaker mutex means a panic mid-update; recovering the
        // guard keeps the write path guarded rather than wedged.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
