//! Rate/budget ledger.
//!
//! Per-identity sliding windows over requests, tokens and cost. Each identity
//! has its own history behind its own lock; an admission checks every window
//! and debits all of them inside one critical section, so concurrent requests
//! for one identity are admitted in lock-acquisition order and never partially
//! debited. Different identities never contend beyond a map lookup.
//!
//! Usage only leaves a window by expiring out of it. Identities whose history
//! has fully expired are dropped by [`Ledger::evict_idle`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use warden_types::config::BudgetWindowConfig;
use warden_types::errors::BudgetExceeded;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Debited against every window.
    Allow,
    /// At least one window would be exceeded; nothing was debited.
    Reject(BudgetExceeded),
}

impl Admission {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Current consumption of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUsage {
    /// Window name.
    pub name: String,
    /// Requests admitted within the window.
    pub requests: u64,
    /// Tokens debited within the window.
    pub tokens: u64,
    /// Cost debited within the window.
    pub cost: f64,
}

#[derive(Debug, Clone)]
struct Entry {
    at: Instant,
    requests: u64,
    tokens: u64,
    cost: f64,
}

#[derive(Debug, Default)]
struct History {
    entries: VecDeque<Entry>,
}

impl History {
    fn prune(&mut self, now: Instant, keep: Duration) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.at) >= keep {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self, now: Instant, window: Duration) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(move |e| now.duration_since(e.at) < window)
    }

    fn usage(&self, now: Instant, config: &BudgetWindowConfig) -> WindowUsage {
        let window = Duration::from_secs(config.window_secs);
        let mut usage = WindowUsage {
            name: config.name.clone(),
            requests: 0,
            tokens: 0,
            cost: 0.0,
        };
        for e in self.in_window(now, window) {
            usage.requests += e.requests;
            usage.tokens += e.tokens;
            usage.cost += e.cost;
        }
        usage
    }

    /// Seconds until enough of `config`'s window expires for `metric` to drop
    /// to `target` or below. Falls back to the full window length.
    fn retry_after(
        &self,
        now: Instant,
        config: &BudgetWindowConfig,
        current: f64,
        target: f64,
        metric: fn(&Entry) -> f64,
    ) -> u64 {
        let window = Duration::from_secs(config.window_secs);
        let mut remaining = current;
        for e in self.in_window(now, window) {
            remaining -= metric(e);
            if remaining <= target {
                let expires = (e.at + window).saturating_duration_since(now);
                return ceil_secs(expires).max(1);
            }
        }
        config.window_secs.max(1)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Shared ledger for all identities.
#[derive(Default)]
pub struct Ledger {
    identities: Mutex<HashMap<String, Arc<Mutex<History>>>>,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn history(&self, identity: &str) -> Arc<Mutex<History>> {
        let mut map = self.identities.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(identity.to_string()).or_default().clone()
    }

    /// Admit one request estimated at `estimated_tokens` and `estimated_cost`.
    ///
    /// Either every window is debited or none is.
    pub fn admit(
        &self,
        identity: &str,
        estimated_tokens: u64,
        estimated_cost: f64,
        windows: &[BudgetWindowConfig],
    ) -> Admission {
        let history = self.history(identity);
        let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let longest = windows.iter().map(|w| w.window_secs).max().unwrap_or(0);
        history.prune(now, Duration::from_secs(longest));

        for window in windows {
            let usage = history.usage(now, window);

            if let Some(max) = window.max_requests {
                if usage.requests + 1 > max {
                    let retry = history.retry_after(
                        now,
                        window,
                        usage.requests as f64,
                        max.saturating_sub(1) as f64,
                        |e| e.requests as f64,
                    );
                    return reject(identity, window, format!("{max} requests"), retry);
                }
            }
            if let Some(max) = window.max_tokens {
                if usage.tokens + estimated_tokens > max {
                    let retry = history.retry_after(
                        now,
                        window,
                        usage.tokens as f64,
                        max.saturating_sub(estimated_tokens) as f64,
                        |e| e.tokens as f64,
                    );
                    return reject(identity, window, format!("{max} tokens"), retry);
                }
            }
            if let Some(max) = window.max_cost {
                if usage.cost + estimated_cost > max {
                    let retry = history.retry_after(
                        now,
                        window,
                        usage.cost,
                        (max - estimated_cost).max(0.0),
                        |e| e.cost,
                    );
                    return reject(identity, window, format!("cost {max:.4}"), retry);
                }
            }
        }

        history.entries.push_back(Entry {
            at: now,
            requests: 1,
            tokens: estimated_tokens,
            cost: estimated_cost,
        });
        debug!(identity = %identity, estimated_tokens, "request admitted");
        Admission::Allow
    }

    /// Record consumption beyond the admission estimate. Never rejects and
    /// never undoes an admission.
    pub fn record_usage(&self, identity: &str, extra_tokens: u64, extra_cost: f64) {
        if extra_tokens == 0 && extra_cost <= 0.0 {
            return;
        }
        let history = self.history(identity);
        let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
        history.entries.push_back(Entry {
            at: Instant::now(),
            requests: 0,
            tokens: extra_tokens,
            cost: extra_cost.max(0.0),
        });
        debug!(identity = %identity, extra_tokens, "usage settled");
    }

    /// Prune every history to `keep` and drop identities left with nothing.
    /// Histories held by an in-flight admission are left alone. Returns how
    /// many identities were removed.
    pub fn evict_idle(&self, keep: Duration) -> usize {
        let mut map = self.identities.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, history| {
            if Arc::strong_count(history) > 1 {
                return true;
            }
            let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
            history.prune(now, keep);
            !history.entries.is_empty()
        });
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, remaining = map.len(), "idle identities evicted");
        }
        evicted
    }

    /// Number of identities with tracked usage.
    pub fn tracked_identities(&self) -> usize {
        self.identities.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Current consumption of each window for `identity`.
    pub fn snapshot(&self, identity: &str, windows: &[BudgetWindowConfig]) -> Vec<WindowUsage> {
        let history = self.history(identity);
        let history = history.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        windows.iter().map(|w| history.usage(now, w)).collect()
    }
}

fn reject(
    identity: &str,
    window: &BudgetWindowConfig,
    limit: String,
    retry_after_secs: u64,
) -> Admission {
    info!(
        identity = %identity,
        window = %window.name,
        retry_after_secs,
        "budget window exceeded"
    );
    Admission::Reject(BudgetExceeded {
        window: window.name.clone(),
        limit,
        retry_after_secs,
    })
}
