//! Per-session conversational context.
//!
//! The outer map is only locked long enough to find or create a session; each
//! session then has its own mutex, so traffic on one session never waits on
//! another.

use crate::catalogue::Arguments;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// One prompt and what was done about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub prompt: String,
    /// `None` when retrieval found nothing.
    pub selected_function_name: Option<String>,
    pub parameters_used: Arguments,
    pub result_summary: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        prompt: impl Into<String>,
        selected_function_name: Option<String>,
        parameters_used: Arguments,
        result_summary: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            selected_function_name,
            parameters_used,
            result_summary: result_summary.into(),
            timestamp: Utc::now(),
        }
    }
}

type SessionTurns = Arc<Mutex<Vec<Turn>>>;

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionTurns>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, session_id: &str) -> Option<SessionTurns> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned()
    }

    fn get_or_create(&self, session_id: &str) -> SessionTurns {
        if let Some(turns) = self.existing(session_id) {
            return turns;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    /// Append `turn`, creating the session on first use.
    ///
    /// Timestamps never go backwards within a session, even if the wall clock
    /// does.
    pub fn append(&self, session_id: &str, mut turn: Turn) {
        let session = self.get_or_create(session_id);
        let mut turns = session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = turns.last() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }
        turns.push(turn);
    }

    /// Turns of `session_id` in append order; empty for unknown sessions.
    pub fn get(&self, session_id: &str) -> Vec<Turn> {
        match self.existing(session_id) {
            Some(session) => session.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => Vec::new(),
        }
    }

    /// Most recent turn of `session_id`, if any.
    pub fn latest(&self, session_id: &str) -> Option<Turn> {
        let session = self.existing(session_id)?;
        let turns = session.lock().unwrap_or_else(|e| e.into_inner());
        turns.last().cloned()
    }

    /// Drop every turn of `session_id`. Safe to call on unknown or already
    /// cleared sessions.
    pub fn clear(&self, session_id: &str) {
        if let Some(session) = self.existing(session_id) {
            session.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::thread;

    fn turn(prompt: &str, function: Option<&str>) -> Turn {
        Turn::new(prompt, function.map(str::to_string), Arguments::new(), "ok")
    }

    #[test]
    fn test_unknown_session_is_empty() {
        let store = SessionStore::new();
        assert!(store.get("nobody").is_empty());
        assert!(store.latest("nobody").is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_append_creates_and_orders() {
        let store = SessionStore::new();
        store.append("s", turn("first", Some("a")));
        store.append("s", turn("second", None));

        let turns = store.get("s");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].prompt, "first");
        assert_eq!(store.latest("s").unwrap().prompt, "second");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = SessionStore::new();
        store.append("a", turn("for a", None));
        assert!(store.get("b").is_empty());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = SessionStore::new();
        store.append("s", turn("x", None));

        store.clear("s");
        store.clear("s");
        store.clear("never-seen");

        assert!(store.get("s").is_empty());
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let store = SessionStore::new();
        let first = turn("first", None);
        let mut earlier = turn("second", None);
        earlier.timestamp = first.timestamp - Duration::seconds(10);

        store.append("s", first.clone());
        store.append("s", earlier);

        let turns = store.get("s");
        assert_eq!(turns[1].timestamp, first.timestamp);
    }

    #[test]
    fn test_concurrent_appends_keep_per_thread_order() {
        let store = Arc::new(SessionStore::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        store.append("shared", turn(&format!("{}-{}", t, i), None));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let turns = store.get("shared");
        assert_eq!(turns.len(), 200);
        for t in 0..4 {
            let seen: Vec<usize> = turns
                .iter()
                .filter_map(|turn| turn.prompt.strip_prefix(&format!("{}-", t)))
                .map(|i| i.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
        assert!(turns.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
