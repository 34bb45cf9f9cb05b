use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Action — the type of file access observed from ACP messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// User embedded file content in prompt (@mention)
    UserProvided,
    /// User sent resource_link in prompt
    UserReferenced,
    /// Agent read file (tool call or fs/read_text_file)
    Read,
    /// Agent wrote file (tool call or fs/write_text_file)
    Write,
    /// Agent searched (grep/glob — path is a directory)
    Search,
    /// Request was denied by zone policy
    Blocked,
}

impl Action {
    /// Tie-breaker ordering used when two observations share a timestamp,
    /// and by the orchestrator's last-action merge rule.
    pub fn priority(self) -> u8 {
        match self {
            Action::Write => 3,
            Action::Search => 2,
            Action::Read | Action::UserProvided | Action::UserReferenced | Action::Blocked => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// FileNode — a tracked file in the graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub path: String,
    /// 0.0 to 1.0 — activity level, decayed over time
    pub heat: f32,
    /// Whether the file is inferred to still be in the agent's context window
    pub in_context: bool,
    /// Most recent action type
    pub last_action: Action,
    /// Last turn this file was accessed
    pub turn_accessed: u32,
    /// Wall-clock milliseconds (epoch) when this file was last accessed.
    /// Used by the orchestrator for LWW merge ordering across providers.
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// NodeUpdate — an update to a single file within a delta
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub path: String,
    pub heat: f32,
    pub in_context: bool,
    pub last_action: Action,
    pub turn_accessed: u32,
    /// Wall-clock milliseconds (epoch) when this event was recorded.
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// SessionKey / SessionMode — session identity
// ---------------------------------------------------------------------------

/// Identifies one conversational thread with one agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(agent_id: &str, session_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    SingleAgent,
    Orchestrator,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::SingleAgent
    }
}

// ---------------------------------------------------------------------------
// Session registry entries (persisted)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// One persisted entry in the session registry (§4.7 / §6 persisted state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub agent_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<SessionModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub history: Vec<serde_json::Value>,
    #[serde(default)]
    pub context: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<SessionKey>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl SessionState {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.agent_id, &self.session_id)
    }
}

/// Summarised view of a session, returned by the `list_sessions` RPC.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub agent_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<SessionModel>,
    pub updated_at_ms: u64,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Wire messages: server -> client
// ---------------------------------------------------------------------------

/// Full state snapshot, sent on connect and on request_snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "type")]
    pub msg_type: String, // always "snapshot"
    pub agent_id: String,
    pub session_id: String,
    pub session_mode: SessionMode,
    pub seq: u64,
    pub nodes: HashMap<String, FileNode>,
}

/// Incremental update — only changed nodes since last emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    #[serde(rename = "type")]
    pub msg_type: String, // always "delta"
    pub agent_id: String,
    pub session_id: String,
    pub session_mode: SessionMode,
    pub seq: u64,
    pub updates: Vec<NodeUpdate>,
    pub removed: Vec<String>,
}

/// Token usage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMessage {
    #[serde(rename = "type")]
    pub msg_type: String, // always "usage"
    pub agent_id: String,
    pub session_id: String,
    pub session_mode: SessionMode,
    pub used: u32,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub amount: f64,
    pub currency: String,
}

/// A zone-denied fs request, broadcast as an in-band event (§4.5, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedMessage {
    #[serde(rename = "type")]
    pub msg_type: String, // always "blocked"
    pub agent_id: String,
    pub session_id: String,
    pub path: String,
    pub action: Action, // Read or Write
    pub timestamp_ms: u64,
}

impl BlockedMessage {
    pub fn new(agent_id: &str, session_id: &str, path: &str, action: Action, timestamp_ms: u64) -> Self {
        Self {
            msg_type: "blocked".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            path: path.to_string(),
            action,
            timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// RPC — client -> server requests and their replies
// ---------------------------------------------------------------------------

/// Inbound message from a UI client (§4.1, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestSnapshot {
        #[serde(default)]
        session_id: Option<String>,
    },
    SetStreamFilter {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        session_mode: Option<SessionMode>,
    },
    Rpc {
        id: String,
        method: String,
        #[serde(default)]
        params: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Reply to an `rpc` client message, correlated by `id` (§4.6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RpcResponse {
    #[serde(rename = "rpc_result")]
    Result { id: String, result: serde_json::Value },
    #[serde(rename = "rpc_error")]
    Error { id: String, error: RpcError },
}

impl RpcResponse {
    pub fn result(id: String, result: serde_json::Value) -> Self {
        RpcResponse::Result { id, result }
    }

    pub fn error(id: String, code: i64, message: String) -> Self {
        RpcResponse::Error {
            id,
            error: RpcError { code, message },
        }
    }
}

/// JSON-RPC error code returned to the agent for a zone-denied fs request (§6).
pub const ZONE_DENIED_ERROR_CODE: i64 = -32001;

// ---------------------------------------------------------------------------
// TrackerConfig — tuning knobs for the ContextTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Number of turns before a file exits context (default: 3)
    pub context_turns: u32,
    /// Usage drop ratio that signals compaction (default: 0.5)
    pub compaction_threshold: f32,
    /// Heat multiplier per tick for non-context files (default: 0.95)
    pub decay_rate: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            context_turns: 3,
            compaction_threshold: 0.5,
            decay_rate: 0.95,
        }
    }
}

// ---------------------------------------------------------------------------
// ZoneConfig — glob-based allow/deny policy (§4.4)
// ---------------------------------------------------------------------------

/// Two ordered glob lists controlling which workspace-relative paths an
/// agent may read or write. Deny always wins; if neither list matches, the
/// path is denied by default.
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
}

impl ZoneConfig {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed,
            denied: Vec::new(),
        }
    }

    pub fn with_denied(allowed: Vec<String>, denied: Vec<String>) -> Self {
        Self { allowed, denied }
    }

    /// Evaluate a path against the deny list, then the allow list.
    /// `*` and `?` never cross a `/`; `**` matches any number of segments.
    pub fn is_allowed(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let normalized = path.trim_start_matches('/');
        if build_globset(&self.denied).is_match(normalized) {
            return false;
        }
        build_globset(&self.allowed).is_match(normalized)
    }
}

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim_start_matches('/');
        if let Ok(glob) = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
        {
            builder.add(glob);
        }
    }
    builder
        .build()
        .unwrap_or_else(|_| GlobSetBuilder::new().build().expect("empty globset always builds"))
}

// ---------------------------------------------------------------------------
// Constructors for wire messages
// ---------------------------------------------------------------------------

impl Snapshot {
    pub fn new(
        agent_id: &str,
        session_id: &str,
        session_mode: SessionMode,
        seq: u64,
        nodes: HashMap<String, FileNode>,
    ) -> Self {
        Self {
            msg_type: "snapshot".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            session_mode,
            seq,
            nodes,
        }
    }
}

impl Delta {
    pub fn new(
        agent_id: &str,
        session_id: &str,
        session_mode: SessionMode,
        seq: u64,
        updates: Vec<NodeUpdate>,
        removed: Vec<String>,
    ) -> Self {
        Self {
            msg_type: "delta".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            session_mode,
            seq,
            updates,
            removed,
        }
    }
}

impl UsageMessage {
    pub fn new(
        agent_id: &str,
        session_id: &str,
        session_mode: SessionMode,
        used: u32,
        size: u32,
        cost: Option<Cost>,
    ) -> Self {
        Self {
            msg_type: "usage".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            session_mode,
            used,
            size,
            cost,
        }
    }
}

impl FileNode {
    pub fn to_update(&self) -> NodeUpdate {
        NodeUpdate {
            path: self.path.clone(),
            heat: self.heat,
            in_context: self.in_context,
            last_action: self.last_action,
            turn_accessed: self.turn_accessed,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InitParams {
    pub root_path: String,
}

// ---------------------------------------------------------------------------
// UI types — used by flatten.rs to produce graph snapshots for the webview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UiLineRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<UiLineRange>,
    #[serde(rename = "lastWrite", skip_serializing_if = "Option::is_none")]
    pub last_write: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiCallEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiSnapshot {
    pub seq: u64,
    pub nodes: HashMap<String, UiNode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<UiCallEdge>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_priority_order() {
        assert!(Action::Write.priority() > Action::Search.priority());
        assert!(Action::Search.priority() > Action::Read.priority());
        assert_eq!(Action::Read.priority(), Action::Blocked.priority());
    }

    #[test]
    fn session_key_equality() {
        let a = SessionKey::new("claude", "s1");
        let b = SessionKey::new("claude", "s1");
        let c = SessionKey::new("claude", "s2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zone_allows_matching_glob() {
        let zone = ZoneConfig::new(vec!["src/ui/**".to_string()]);
        assert!(zone.is_allowed("src/ui/button.tsx"));
        assert!(!zone.is_allowed("core/auth.rs"));
    }

    #[test]
    fn zone_deny_wins_over_allow() {
        let zone = ZoneConfig::with_denied(
            vec!["src/**".to_string()],
            vec!["**/.env".to_string()],
        );
        assert!(zone.is_allowed("src/app.ts"));
        assert!(!zone.is_allowed("src/.env"));
    }

    #[test]
    fn zone_empty_path_denied() {
        let zone = ZoneConfig::new(vec!["**".to_string()]);
        assert!(!zone.is_allowed(""));
    }

    #[test]
    fn client_message_parses_request_snapshot() {
        let v: ClientMessage = serde_json::from_str(r#"{"type":"request_snapshot"}"#).unwrap();
        assert!(matches!(v, ClientMessage::RequestSnapshot { session_id: None }));
    }

    #[test]
    fn client_message_parses_rpc() {
        let v: ClientMessage =
            serde_json::from_str(r#"{"type":"rpc","id":"1","method":"list_sessions"}"#).unwrap();
        match v {
            ClientMessage::Rpc { id, method, params } => {
                assert_eq!(id, "1");
                assert_eq!(method, "list_sessions");
                assert!(params.is_none());
            }
            _ => panic!("expected Rpc variant"),
        }
    }

    #[test]
    fn rpc_response_serializes_tagged() {
        let r = RpcResponse::result("7".to_string(), serde_json::json!({"ok": true}));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "rpc_result");
        assert_eq!(v["id"], "7");

        let e = RpcResponse::error("8".to_string(), -32001, "denied".to_string());
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "rpc_error");
        assert_eq!(v["error"]["code"], -32001);
    }
}
