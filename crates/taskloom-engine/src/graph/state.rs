use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskloom_core::types::{Payload, RequestCategory, SessionId};

/// Metadata keys written by the executor and the built-in nodes.
pub mod keys {
    pub const SESSION_ID: &str = "session_id";
    pub const STARTED_AT: &str = "started_at";
    pub const CONFIG: &str = "config";
    pub const LAST_NODE: &str = "last_node";
    pub const HYBRID_CATEGORIES: &str = "hybrid_categories";
    pub const PARENT_SESSION: &str = "parent_session";
}

/// Who produced a message in the session transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Node,
    System,
}

/// One entry of the append-only session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMessage {
    pub role: MessageRole,
    /// Node that produced the message (absent for the user request).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl GraphMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            node: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn node(node: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Node,
            node: Some(node.into()),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            node: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The envelope threaded through a session graph.
///
/// Nodes read the request and context, write their output under their own
/// name in `results`, and append to `messages`. `context` is caller-supplied
/// and nodes treat it as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub messages: Vec<GraphMessage>,
    pub category: RequestCategory,
    pub request: String,
    #[serde(default)]
    pub context: Payload,
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Ids of checkpoints taken for this session.
    #[serde(default)]
    pub checkpoints: Vec<String>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub iteration: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub final_response: Option<serde_json::Value>,
}

impl GraphState {
    pub fn new(
        session_id: &SessionId,
        category: RequestCategory,
        request: impl Into<String>,
        context: Payload,
        max_iterations: u32,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(keys::SESSION_ID.to_string(), serde_json::json!(session_id.0));
        metadata.insert(
            keys::STARTED_AT.to_string(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
        Self {
            messages: vec![],
            category,
            request: request.into(),
            context,
            results: HashMap::new(),
            metadata,
            checkpoints: vec![],
            error_count: 0,
            iteration: 0,
            max_iterations,
            final_response: None,
        }
    }

    /// Fresh state for a sub-graph: same request, context and iteration cap,
    /// empty transcript and results.
    pub fn child(&self, category: RequestCategory) -> Self {
        let child_id = SessionId::from_string(&format!("{}:{}", self.session_id(), category));
        let mut child = Self::new(
            &child_id,
            category,
            self.request.clone(),
            self.context.clone(),
            self.max_iterations,
        );
        child.metadata.insert(
            keys::PARENT_SESSION.to_string(),
            serde_json::json!(self.session_id()),
        );
        child
    }

    pub fn session_id(&self) -> &str {
        self.metadata
            .get(keys::SESSION_ID)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn push_message(&mut self, message: GraphMessage) {
        self.messages.push(message);
    }

    /// Store a node's output under its name.
    pub fn set_result(&mut self, node: impl Into<String>, value: serde_json::Value) {
        self.results.insert(node.into(), value);
    }

    pub fn result(&self, node: &str) -> Option<&serde_json::Value> {
        self.results.get(node)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Record a swallowed node failure.
    pub fn record_error(&mut self, node: &str, error: impl std::fmt::Display) {
        self.error_count += 1;
        self.push_message(GraphMessage::system(format!("{} failed: {}", node, error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GraphState {
        let mut context = Payload::new();
        context.insert("site".into(), serde_json::json!("hq"));
        GraphState::new(
            &SessionId::from_string("s-1"),
            RequestCategory::Hybrid,
            "check everything",
            context,
            10,
        )
    }

    #[test]
    fn test_new_state_metadata() {
        let s = state();
        assert_eq!(s.session_id(), "s-1");
        assert!(s.metadata_str(keys::STARTED_AT).is_some());
        assert!(s.messages.is_empty());
        assert_eq!(s.iteration, 0);
    }

    #[test]
    fn test_child_shares_request_and_context() {
        let mut parent = state();
        parent.set_result("classify", serde_json::json!(["device"]));

        let child = parent.child(RequestCategory::Device);
        assert_eq!(child.request, parent.request);
        assert_eq!(child.context, parent.context);
        assert_eq!(child.category, RequestCategory::Device);
        assert!(child.results.is_empty());
        assert_eq!(child.session_id(), "s-1:device");
        assert_eq!(child.metadata_str(keys::PARENT_SESSION), Some("s-1"));
    }

    #[test]
    fn test_record_error_appends_message() {
        let mut s = state();
        s.record_error("device", "timeout");
        assert_eq!(s.error_count, 1);
        assert_eq!(s.messages.last().unwrap().content, "device failed: timeout");
        assert_eq!(s.messages.last().unwrap().role, MessageRole::System);
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let mut s = state();
        s.push_message(GraphMessage::user("check everything"));
        s.push_message(GraphMessage::node("classify", "touches device"));
        s.set_result("classify", serde_json::json!({"categories": ["device"], "score": 0.5}));
        s.final_response = Some(serde_json::json!({"ok": true}));

        let json = serde_json::to_string(&s).unwrap();
        let back: GraphState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
