//! Multi-turn session store.
//!
//! Every turn gets a fresh request context, but two things carry over within a
//! session: the turn count and the cumulative risk accumulator. Sessions are
//! keyed by identity and session id together, so one caller cannot continue
//! (or reset) another caller's session.
//!
//! Sessions idle for longer than the configured TTL are evicted; a later turn
//! with the same id starts a fresh session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// State carried into a new turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTurn {
    /// 1-based turn number.
    pub turn: u32,
    /// Risk accumulated over earlier turns.
    pub carried_risk: f64,
}

/// Why a session may not continue.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SessionRefusal {
    /// The session used up its turns.
    #[error("session reached {max} turns")]
    TurnLimit {
        /// Configured maximum.
        max: u32,
    },
    /// The session's accumulated risk reached the limit.
    #[error("session risk {risk:.2} reached limit {max:.2}")]
    RiskLimit {
        /// Accumulated risk.
        risk: f64,
        /// Configured maximum.
        max: f64,
    },
}

#[derive(Debug, Clone)]
struct SessionState {
    turns: u32,
    risk: f64,
    last_seen: Instant,
}

/// In-memory session store.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<(String, String), SessionState>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a turn, refusing sessions over their turn or risk limit.
    pub fn begin_turn(
        &self,
        identity: &str,
        session_id: &str,
        max_turns: u32,
        max_risk: f64,
    ) -> Result<SessionTurn, SessionRefusal> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let state = sessions
            .entry((identity.to_string(), session_id.to_string()))
            .or_insert_with(|| SessionState {
                turns: 0,
                risk: 0.0,
                last_seen: Instant::now(),
            });

        if state.turns >= max_turns {
            info!(identity = %identity, session_id = %session_id, turns = state.turns, "session turn limit reached");
            return Err(SessionRefusal::TurnLimit { max: max_turns });
        }
        if state.risk >= max_risk {
            info!(identity = %identity, session_id = %session_id, risk = state.risk, "session risk limit reached");
            return Err(SessionRefusal::RiskLimit {
                risk: state.risk,
                max: max_risk,
            });
        }

        state.turns += 1;
        state.last_seen = Instant::now();
        debug!(identity = %identity, session_id = %session_id, turn = state.turns, "session turn started");
        Ok(SessionTurn {
            turn: state.turns,
            carried_risk: state.risk,
        })
    }

    /// Store the risk accumulated by a finished turn. Never lowers it.
    pub fn record_risk(&self, identity: &str, session_id: &str, risk: f64) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = sessions.get_mut(&(identity.to_string(), session_id.to_string())) {
            state.risk = state.risk.max(risk.clamp(0.0, 1.0));
            state.last_seen = Instant::now();
        }
    }

    /// Accumulated risk of a session, if it exists.
    pub fn risk(&self, identity: &str, session_id: &str) -> Option<f64> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(&(identity.to_string(), session_id.to_string()))
            .map(|s| s.risk)
    }

    /// Drop sessions idle for `idle` or longer. Returns how many were removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_seen) < idle);
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "idle sessions evicted");
        }
        evicted
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_count_up() {
        let store = SessionStore::new();
        let first = store.begin_turn("alice", "s1", 10, 0.9).unwrap();
        let second = store.begin_turn("alice", "s1", 10, 0.9).unwrap();
        assert_eq!(first.turn, 1);
        assert_eq!(second.turn, 2);
    }

    #[test]
    fn test_turn_limit() {
        let store = SessionStore::new();
        store.begin_turn("alice", "s1", 2, 0.9).unwrap();
        store.begin_turn("alice", "s1", 2, 0.9).unwrap();
        assert_eq!(
            store.begin_turn("alice", "s1", 2, 0.9),
            Err(SessionRefusal::TurnLimit { max: 2 })
        );
    }

    #[test]
    fn test_risk_carries_and_never_drops() {
        let store = SessionStore::new();
        store.begin_turn("alice", "s1", 10, 0.9).unwrap();
        store.record_risk("alice", "s1", 0.4);
        store.record_risk("alice", "s1", 0.1);
        let turn = store.begin_turn("alice", "s1", 10, 0.9).unwrap();
        assert!((turn.carried_risk - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_risk_limit_blocks_next_turn() {
        let store = SessionStore::new();
        store.begin_turn("alice", "s1", 10, 0.9).unwrap();
        store.record_risk("alice", "s1", 0.95);
        assert!(matches!(
            store.begin_turn("alice", "s1", 10, 0.9),
            Err(SessionRefusal::RiskLimit { .. })
        ));
    }

    #[test]
    fn test_sessions_keyed_by_identity() {
        let store = SessionStore::new();
        store.begin_turn("alice", "shared", 10, 0.9).unwrap();
        store.record_risk("alice", "shared", 0.95);
        let bob = store.begin_turn("bob", "shared", 10, 0.9).unwrap();
        assert_eq!(bob.turn, 1);
        assert_eq!(bob.carried_risk, 0.0);
        assert_eq!(store.risk("alice", "shared"), Some(0.95));
    }

    #[test]
    fn test_record_risk_for_unknown_session_is_ignored() {
        let store = SessionStore::new();
        store.record_risk("alice", "never-started", 0.5);
        assert_eq!(store.risk("alice", "never-started"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let store = SessionStore::new();
        store.begin_turn("alice", "s1", 10, 0.9).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        store.begin_turn("bob", "s1", 10, 0.9).unwrap();

        assert_eq!(store.evict_idle(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.risk("alice", "s1"), None);
        assert_eq!(store.risk("bob", "s1"), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_session_starts_fresh() {
        let store = SessionStore::new();
        store.begin_turn("alice", "s1", 1, 0.9).unwrap();
        assert!(store.begin_turn("alice", "s1", 1, 0.9).is_err());

        tokio::time::advance(Duration::from_secs(120)).await;
        store.evict_idle(Duration::from_secs(60));
        assert_eq!(store.begin_turn("alice", "s1", 1, 0.9).unwrap().turn, 1);
    }
}
