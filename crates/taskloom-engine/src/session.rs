use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use taskloom_core::types::{RequestCategory, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub request: String,
    pub category: RequestCategory,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: SessionStatus,
    pub last_result: Option<serde_json::Value>,
}

/// In-memory registry of graph sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionInfo>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a session as running. A resumed session keeps its original
    /// start time.
    pub fn start(&self, session_id: &SessionId, request: &str, category: RequestCategory) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let info = sessions
            .entry(session_id.0.clone())
            .or_insert_with(|| SessionInfo {
                session_id: session_id.clone(),
                request: request.to_string(),
                category,
                started_at: now,
                last_active: now,
                status: SessionStatus::Running,
                last_result: None,
            });
        info.status = SessionStatus::Running;
        info.last_active = now;
    }

    pub fn complete(&self, session_id: &str, result: Option<serde_json::Value>) {
        self.finish(session_id, SessionStatus::Completed, result);
    }

    pub fn fail(&self, session_id: &str, error: &str) {
        self.finish(
            session_id,
            SessionStatus::Failed,
            Some(serde_json::json!({ "error": error })),
        );
    }

    fn finish(&self, session_id: &str, status: SessionStatus, result: Option<serde_json::Value>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = sessions.get_mut(session_id) {
            info.status = status;
            info.last_active = Utc::now();
            info.last_result = result;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Drop finished sessions whose record is at least `max_age` old. Running
    /// sessions are kept. Returns the removed ids.
    ///
    /// A record's age counts from `last_active`, its last write: a resumed
    /// session restarts its TTL instead of expiring while it still has a live
    /// checkpoint.
    pub fn cleanup(&self, max_age: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.status != SessionStatus::Running && s.last_active <= cutoff)
            .map(|s| s.session_id.0.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let manager = SessionManager::new();
        let id = SessionId::from_string("s-1");
        manager.start(&id, "hello", RequestCategory::Chat);
        assert_eq!(manager.get("s-1").unwrap().status, SessionStatus::Running);

        manager.complete("s-1", Some(serde_json::json!({"ok": true})));
        let info = manager.get("s-1").unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.last_result.unwrap()["ok"], true);

        manager.fail("s-1", "boom");
        assert_eq!(manager.get("s-1").unwrap().status, SessionStatus::Failed);
    }

    #[test]
    fn test_restart_keeps_start_time() {
        let manager = SessionManager::new();
        let id = SessionId::from_string("s-1");
        manager.start(&id, "hello", RequestCategory::Chat);
        let first = manager.get("s-1").unwrap().started_at;
        manager.complete("s-1", None);

        manager.start(&id, "hello", RequestCategory::Chat);
        let info = manager.get("s-1").unwrap();
        assert_eq!(info.started_at, first);
        assert_eq!(info.status, SessionStatus::Running);
    }

    #[test]
    fn test_cleanup_age_counts_from_last_activity() {
        let manager = SessionManager::new();
        let id = SessionId::from_string("resumed");
        manager.start(&id, "hello", RequestCategory::Chat);
        manager.complete("resumed", None);
        std::thread::sleep(Duration::from_millis(60));

        manager.start(&id, "hello", RequestCategory::Chat);
        manager.complete("resumed", None);
        assert!(manager.cleanup(Duration::from_millis(40)).is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(manager.cleanup(Duration::from_millis(40)), vec!["resumed".to_string()]);
    }

    #[test]
    fn test_cleanup_skips_running() {
        let manager = SessionManager::new();
        manager.start(&SessionId::from_string("done"), "a", RequestCategory::Chat);
        manager.start(&SessionId::from_string("busy"), "b", RequestCategory::Device);
        manager.complete("done", None);

        assert!(manager.cleanup(Duration::from_secs(3600)).is_empty());
        assert_eq!(manager.cleanup(Duration::ZERO), vec!["done".to_string()]);
        assert_eq!(manager.list().len(), 1);
        assert!(manager.get("busy").is_some());
    }

    #[test]
    fn test_unknown_session_updates_ignored() {
        let manager = SessionManager::new();
        manager.complete("ghost", None);
        assert!(manager.get("ghost").is_none());
        assert!(manager.list().is_empty());
    }
}
