//! Per-tool circuit breaker.
//!
//! State machine: Closed → Open → HalfOpen
//! - Tracks consecutive errors within a time window
//! - Exponential backoff on repeated trips, capped
//! - A failed probe reopens with a longer cooldown
//!
//! Time is read from `tokio::time::Instant`, so paused-clock tests can drive
//! recovery without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use warden_types::config::CircuitBreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy; calls pass through.
    Closed,
    /// Tripped; calls fail fast.
    Open,
    /// Cooling down is over; calls are probes.
    HalfOpen,
}

/// Circuit breaker for one tool backend.
///
/// Requires `&mut self`; [`CircuitBreakers`] wraps one per tool behind a lock.
#[derive(Debug)]
pub struct ToolCircuitBreaker {
    config: CircuitBreakerConfig,
    current_state: CircuitState,
    /// Timestamps of consecutive failures within the error window.
    failure_timestamps: Vec<Instant>,
    consecutive_probe_successes: u32,
    opened_at: Option<Instant>,
    /// Consecutive trips without a full recovery (drives backoff).
    consecutive_trips: u32,
    trips_count: u64,
}

impl ToolCircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            current_state: CircuitState::Closed,
            failure_timestamps: Vec::new(),
            consecutive_probe_successes: 0,
            opened_at: None,
            consecutive_trips: 0,
            trips_count: 0,
        }
    }

    /// Total number of times the circuit tripped open.
    pub fn trips(&self) -> u64 {
        self.trips_count
    }

    /// Current recovery timeout: base doubled per consecutive trip, capped.
    fn recovery_timeout(&self) -> Duration {
        let base = Duration::from_secs(self.config.recovery_timeout_secs);
        let max = Duration::from_secs(self.config.max_recovery_backoff_secs);

        let shift = self.consecutive_trips.saturating_sub(1).min(31);
        base.saturating_mul(1u32 << shift).min(max.max(base))
    }

    fn recovery_timeout_elapsed(&self) -> bool {
        match self.opened_at {
            Some(opened) => opened.elapsed() >= self.recovery_timeout(),
            None => false,
        }
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        self.current_state = new_state;
        match new_state {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.consecutive_probe_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_probe_successes = 0;
            }
            CircuitState::Closed => {
                self.failure_timestamps.clear();
                self.consecutive_trips = 0;
                self.consecutive_probe_successes = 0;
                self.opened_at = None;
            }
        }
    }

    /// State as seen by the next caller (an expired Open reads as HalfOpen).
    pub fn state(&self) -> CircuitState {
        if self.current_state == CircuitState::Open && self.recovery_timeout_elapsed() {
            return CircuitState::HalfOpen;
        }
        self.current_state
    }

    /// Whether a call may proceed now. Moves Open → HalfOpen once the
    /// cooldown has passed.
    pub fn allow_call(&mut self) -> bool {
        if self.current_state == CircuitState::Open && self.recovery_timeout_elapsed() {
            tracing::info!(
                consecutive_trips = self.consecutive_trips,
                "recovery timeout elapsed, circuit half-open"
            );
            self.transition_to(CircuitState::HalfOpen);
        }
        self.current_state != CircuitState::Open
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.current_state {
            CircuitState::Closed => self.failure_timestamps.clear(),
            CircuitState::HalfOpen => {
                self.consecutive_probe_successes += 1;
                if self.consecutive_probe_successes >= self.config.recovery_probes {
                    tracing::info!(
                        probes = self.consecutive_probe_successes,
                        "circuit recovered, closed"
                    );
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call (error or timeout).
    pub fn record_failure(&mut self) {
        match self.current_state {
            CircuitState::Closed => {
                let window = Duration::from_secs(self.config.error_window_secs);
                let now = Instant::now();
                self.failure_timestamps
                    .retain(|ts| now.duration_since(*ts) <= window);
                self.failure_timestamps.push(now);

                if self.failure_timestamps.len() as u32 >= self.config.error_threshold {
                    self.consecutive_trips += 1;
                    self.trips_count += 1;
                    tracing::warn!(
                        failures = self.failure_timestamps.len(),
                        threshold = self.config.error_threshold,
                        "circuit tripped open"
                    );
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_trips += 1;
                self.trips_count += 1;
                tracing::warn!(
                    consecutive_trips = self.consecutive_trips,
                    "probe failed, circuit reopened with backoff"
                );
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }
}

/// One breaker per tool name, created on first use.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, ToolCircuitBreaker>>,
}

impl CircuitBreakers {
    /// Create an empty set sharing one configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, tool: &str, f: impl FnOnce(&mut ToolCircuitBreaker) -> R) -> R {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = map
            .entry(tool.to_string())
            .or_insert_with(|| ToolCircuitBreaker::new(self.config.clone()));
        f(breaker)
    }

    /// Whether a call to `tool` may proceed now.
    pub fn allow_call(&self, tool: &str) -> bool {
        self.with_breaker(tool, |b| b.allow_call())
    }

    /// Record a successful call to `tool`.
    pub fn record_success(&self, tool: &str) {
        self.with_breaker(tool, |b| b.record_success());
    }

    /// Record a failed call to `tool`.
    pub fn record_failure(&self, tool: &str) {
        self.with_breaker(tool, |b| b.record_failure());
    }

    /// Current state for `tool`.
    pub fn state(&self, tool: &str) -> CircuitState {
        self.with_breaker(tool, |b| b.state())
    }
}
