use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{Action, Cost, Delta, FileNode, Snapshot, SessionMode, TrackerConfig, UsageMessage};

/// Current wall-clock time in milliseconds since Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Decide which action wins `last_action` when a new observation arrives
/// (§4.3 edge case): a strictly newer timestamp always wins; an equal
/// timestamp is broken by action priority; a strictly older timestamp
/// never overwrites the stored action, regardless of priority.
fn resolve_last_action(stored_ts: u64, stored_action: Action, ts: u64, action: Action) -> Action {
    if ts > stored_ts {
        action
    } else if ts == stored_ts && action.priority() > stored_action.priority() {
        action
    } else {
        stored_action
    }
}

/// Directories whose contents are never tracked, regardless of workspace
/// root. Overridable via the `--ignore` CLI flag (see main.rs); these are
/// the defaults a hard-coded list would have used (§9 Open Question).
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "__pycache__",
    ".venv",
];

/// Convert an extracted path to workspace-relative form, or drop it (§4.2).
///
/// With no workspace root bound, the path is passed through unchanged — we
/// simply don't know enough yet to normalise it. Once a root is bound,
/// absolute paths outside it are dropped, and any path with a component
/// matching `ignored_dirs` (`.git`, `node_modules`, ...) is dropped too.
fn normalize_path(path: &str, workspace_root: Option<&std::path::Path>, ignored_dirs: &[String]) -> Option<String> {
    let normalized = match workspace_root {
        None => path.to_string(),
        Some(root) => {
            let p = std::path::Path::new(path);
            if p.is_absolute() {
                match p.strip_prefix(root) {
                    Ok(rel) => rel.to_string_lossy().to_string(),
                    Err(_) => return None,
                }
            } else {
                path.to_string()
            }
        }
    };

    let ignored = std::path::Path::new(&normalized).components().any(|c| {
        matches!(c, std::path::Component::Normal(seg)
            if ignored_dirs.iter().any(|d| d.as_str() == seg.to_string_lossy()))
    });
    if ignored {
        return None;
    }

    Some(normalized)
}

/// Per-session state: the set of tracked files, turn/sequence counters, and
/// the bookkeeping needed to emit minimal deltas. This is exactly the
/// teacher's single-session `ContextTracker` internals, now held once per
/// (agent, session) pair inside the multi-session `ContextTracker` below.
struct SessionState {
    mode: SessionMode,
    workspace_root: Option<PathBuf>,
    files: HashMap<String, FileNode>,
    seq: u64,
    current_turn: u32,
    last_used_tokens: u32,
    context_size: u32,
    changed_paths: HashSet<String>,
    pending_usage: Vec<UsageMessage>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            mode: SessionMode::SingleAgent,
            workspace_root: None,
            files: HashMap::new(),
            seq: 0,
            current_turn: 0,
            last_used_tokens: 0,
            context_size: 0,
            changed_paths: HashSet::new(),
            pending_usage: Vec::new(),
        }
    }
}

/// ContextTracker is the stateful core of Eisen.
///
/// It holds one `SessionState` per (agent, session) pair observed on this
/// `observe` connection, since a single ACP stdio stream may multiplex
/// several conversational sessions via `session/new`. Most callers (the
/// extractor, the proxy) deal with a single "current" session — the one
/// most recently learned from the stream, or set via `--session-id` — and
/// use the unparameterized methods below. The broadcast server and
/// orchestrator address specific sessions by id via the `_for` methods.
///
/// Concurrency: wrapped in `Arc<Mutex<ContextTracker>>` by the caller.
/// All mutation goes through the public methods below. The caller is
/// responsible for locking; this struct is not internally synchronized.
pub struct ContextTracker {
    agent_id: String,
    current_session_id: String,
    sessions: HashMap<String, SessionState>,
    config: TrackerConfig,
    pending_terminal_output_ids: HashSet<u64>,
    ignored_dirs: Vec<String>,
    /// A workspace root learned from `session/new`'s `cwd` param before the
    /// session id has been assigned (it only arrives in the response).
    pending_workspace_root: Option<PathBuf>,
}

impl ContextTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            agent_id: String::new(),
            current_session_id: String::new(),
            sessions: HashMap::new(),
            config,
            pending_terminal_output_ids: HashSet::new(),
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
            pending_workspace_root: None,
        }
    }

    /// Override the ignored-directory list (CLI `--ignore`, repeatable).
    pub fn set_ignored_dirs(&mut self, dirs: Vec<String>) {
        self.ignored_dirs = dirs;
    }

    /// Directory names whose contents are never tracked.
    pub fn ignored_dirs(&self) -> &[String] {
        &self.ignored_dirs
    }

    /// Stash a workspace root learned from an upstream `session/new` request,
    /// to be claimed once the corresponding session id is known.
    pub fn set_pending_workspace_root(&mut self, root: PathBuf) {
        self.pending_workspace_root = Some(root);
    }

    /// Claim the pending workspace root, if any, binding it to `session_id`.
    pub fn resolve_pending_workspace_root(&mut self, session_id: &str) {
        if let Some(root) = self.pending_workspace_root.take() {
            self.set_workspace_root(session_id, root);
        }
    }

    /// Set the agent instance ID. Called from the `--agent-id` CLI flag.
    pub fn set_agent_id(&mut self, id: String) {
        self.agent_id = id;
    }

    /// Return the current agent instance ID (empty string if not yet set).
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Set the current session ID. Called when sessionId is detected from
    /// the ACP stream or provided via CLI flag. Creates the session's state
    /// if it doesn't already exist.
    pub fn set_session_id(&mut self, id: String) {
        self.sessions.entry(id.clone()).or_insert_with(SessionState::new);
        self.current_session_id = id;
    }

    /// Return the current session ID (empty string if not yet set).
    pub fn session_id(&self) -> &str {
        &self.current_session_id
    }

    /// All session ids with live state on this tracker, in arbitrary order.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Record the session mode for a session (driven by the session
    /// registry via the `create_session` / `set_orchestrator_providers`
    /// RPCs). Creates the session if it doesn't yet exist.
    pub fn set_session_mode(&mut self, session_id: &str, mode: SessionMode) {
        self.ensure_session(session_id).mode = mode;
    }

    /// Bind a session to a workspace root, used to resolve workspace-relative
    /// paths during extraction (§4.2, §4.3). Learned from `session/new`'s
    /// `cwd` parameter.
    pub fn set_workspace_root(&mut self, session_id: &str, root: PathBuf) {
        self.ensure_session(session_id).workspace_root = Some(root);
    }

    /// The workspace root bound to a session, if any.
    pub fn workspace_root(&self, session_id: &str) -> Option<&std::path::Path> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.workspace_root.as_deref())
    }

    fn ensure_session(&mut self, session_id: &str) -> &mut SessionState {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionState::new)
    }

    fn ensure_current(&mut self) -> &mut SessionState {
        let id = self.current_session_id.clone();
        self.ensure_session(&id)
    }

    // -------------------------------------------------------------------
    // Public API — called by the proxy/extract layer, defaulting to the
    // current session.
    // -------------------------------------------------------------------

    pub fn add_pending_terminal_output(&mut self, id: u64) {
        self.pending_terminal_output_ids.insert(id);
    }

    pub fn take_pending_terminal_output(&mut self, id: u64) -> bool {
        self.pending_terminal_output_ids.remove(&id)
    }

    /// Record a file access on the current session. See `file_access_for`.
    pub fn file_access(&mut self, path: &str, action: Action) {
        let id = self.current_session_id.clone();
        self.file_access_for(&id, path, action);
    }

    /// Record a file access from any extraction channel, against a specific
    /// session (§4.3 transition 1): sets heat to 1.0, marks the file
    /// in-context, and records the turn it happened on. Creates the session
    /// and/or file node if either doesn't exist yet.
    ///
    /// The path is normalised first (§4.2): converted workspace-relative
    /// when a workspace root is bound, dropped if it falls outside that
    /// root or under an ignored directory. With no workspace root bound yet
    /// the path is stored as extracted, unchanged.
    ///
    /// An observation older than the file's stored timestamp still updates
    /// heat/in-context but never overwrites `last_action` (§4.3 edge cases).
    pub fn file_access_for(&mut self, session_id: &str, path: &str, action: Action) {
        let root = self.sessions.get(session_id).and_then(|s| s.workspace_root.clone());
        let Some(path) = normalize_path(path, root.as_deref(), &self.ignored_dirs) else {
            return;
        };
        let path = path.as_str();

        let ts = now_ms();
        let turn = self.sessions.get(session_id).map(|s| s.current_turn).unwrap_or(0);
        let session = self.ensure_session(session_id);

        let node = session
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileNode {
                path: path.to_string(),
                heat: 0.0,
                in_context: false,
                last_action: action,
                turn_accessed: 0,
                timestamp_ms: 0,
            });

        node.heat = 1.0;
        node.in_context = true;
        node.turn_accessed = turn;
        node.last_action = resolve_last_action(node.timestamp_ms, node.last_action, ts, action);
        node.timestamp_ms = node.timestamp_ms.max(ts);

        session.changed_paths.insert(path.to_string());
    }

    /// Record a token usage update on the current session. See
    /// `usage_update_for`.
    pub fn usage_update(&mut self, used: u32, size: u32) {
        let id = self.current_session_id.clone();
        self.usage_update_for(&id, used, size);
    }

    /// Record a token usage update, with an optional reported cost, on the
    /// current session. See `usage_update_with_cost_for`.
    pub fn usage_update_with_cost(&mut self, used: u32, size: u32, cost: Option<Cost>) {
        let id = self.current_session_id.clone();
        self.usage_update_with_cost_for(&id, used, size, cost);
    }

    /// Record a token usage update from the agent for a specific session.
    /// See `usage_update_with_cost_for`.
    pub fn usage_update_for(&mut self, session_id: &str, used: u32, size: u32) {
        self.usage_update_with_cost_for(session_id, used, size, None);
    }

    /// Record a token usage update from the agent for a specific session,
    /// with an optional reported cost (§6 `usage` wire message).
    ///
    /// If the usage drops by more than `compaction_threshold` relative to
    /// the previous report, we infer that the LLM runtime compacted the
    /// context (§4.3 compaction detection). All files in that session are
    /// evicted from context — only files re-accessed in subsequent turns
    /// will re-enter. Heat is left unchanged: files remain visible until
    /// decay prunes them.
    pub fn usage_update_with_cost_for(
        &mut self,
        session_id: &str,
        used: u32,
        size: u32,
        cost: Option<Cost>,
    ) {
        let agent_id = self.agent_id.clone();
        let session = self.ensure_session(session_id);
        let previous = session.last_used_tokens;
        session.last_used_tokens = used;
        session.context_size = size;

        if previous > 0 {
            let drop_ratio = 1.0 - (used as f32 / previous as f32);
            if drop_ratio > self.config.compaction_threshold {
                for (path, node) in &mut session.files {
                    if node.in_context {
                        node.in_context = false;
                        session.changed_paths.insert(path.clone());
                    }
                }
            }
        }

        let mode = session.mode;
        session.pending_usage.push(UsageMessage::new(
            &agent_id,
            session_id,
            mode,
            used,
            size,
            cost,
        ));
    }

    /// Drain any pending usage messages queued for the current session.
    pub fn take_pending_usage(&mut self) -> Vec<UsageMessage> {
        let id = self.current_session_id.clone();
        self.sessions
            .get_mut(&id)
            .map(|s| std::mem::take(&mut s.pending_usage))
            .unwrap_or_default()
    }

    /// Drain pending usage messages across every session, in no particular
    /// order. Used by the tick driver (§4.9) instead of per-session draining.
    pub fn drain_usage_all(&mut self) -> Vec<UsageMessage> {
        let mut all = Vec::new();
        for session in self.sessions.values_mut() {
            all.append(&mut session.pending_usage);
        }
        all
    }

    /// Signal the end of a turn on the current session. See `end_turn_for`.
    pub fn end_turn(&mut self) {
        let id = self.current_session_id.clone();
        self.end_turn_for(&id);
    }

    /// Signal the end of an agent turn for a specific session (§4.3
    /// transition 3): increments that session's turn counter and transitions
    /// files not accessed within the context window out of context.
    pub fn end_turn_for(&mut self, session_id: &str) {
        let session = self.ensure_session(session_id);
        session.current_turn += 1;
        let turn = session.current_turn;
        for (path, node) in &mut session.files {
            if node.in_context && turn.saturating_sub(node.turn_accessed) > self.config.context_turns {
                node.in_context = false;
                session.changed_paths.insert(path.clone());
            }
        }
    }

    /// Tick the current session only. See `tick_all` for driving every
    /// live session at once (used by the tick driver).
    pub fn tick(&mut self) -> Option<Delta> {
        let id = self.current_session_id.clone();
        self.tick_session(&id)
    }

    /// Apply decay and emit a delta for every session with live state
    /// (§4.9 step 3). Sessions that produce no changes are omitted.
    pub fn tick_all(&mut self) -> Vec<Delta> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.into_iter().filter_map(|id| self.tick_session(&id)).collect()
    }

    /// Apply heat decay to non-context files in one session (§4.3 transition
    /// 2), collect all changes since the last tick, and return a Delta if
    /// anything changed.
    fn tick_session(&mut self, session_id: &str) -> Option<Delta> {
        let agent_id = self.agent_id.clone();
        let decay_rate = self.config.decay_rate;
        let session = self.sessions.get_mut(session_id)?;

        for (path, node) in &mut session.files {
            if !node.in_context && node.heat > 0.01 {
                node.heat *= decay_rate;
                if node.heat <= 0.01 {
                    node.heat = 0.0;
                }
                session.changed_paths.insert(path.clone());
            }
        }

        if session.changed_paths.is_empty() {
            return None;
        }

        let mut updates = Vec::new();
        let mut removed = Vec::new();

        for path in session.changed_paths.drain().collect::<Vec<_>>() {
            if let Some(node) = session.files.get(&path) {
                if node.heat > 0.0 || node.in_context {
                    updates.push(node.to_update());
                } else {
                    removed.push(path.clone());
                }
            }
        }

        for path in &removed {
            session.files.remove(path);
        }

        if updates.is_empty() && removed.is_empty() {
            return None;
        }

        session.seq += 1;
        Some(Delta::new(
            &agent_id,
            session_id,
            session.mode,
            session.seq,
            updates,
            removed,
        ))
    }

    /// Return a full snapshot of the current session's state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_for_session(&self.current_session_id)
    }

    /// Return a full snapshot of a specific session's state (used when a
    /// new TCP client connects, on `request_snapshot`, and by the
    /// orchestrator when reading provider state).
    pub fn snapshot_for_session(&self, session_id: &str) -> Snapshot {
        let Some(session) = self.sessions.get(session_id) else {
            return Snapshot::new(&self.agent_id, session_id, SessionMode::SingleAgent, 0, HashMap::new());
        };
        let nodes: HashMap<String, FileNode> = session
            .files
            .iter()
            .filter(|(_, n)| n.heat > 0.0 || n.in_context)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Snapshot::new(&self.agent_id, session_id, session.mode, session.seq, nodes)
    }

    /// Current sequence number of the current session (diagnostics/tests).
    pub fn seq(&self) -> u64 {
        self.sessions.get(&self.current_session_id).map(|s| s.seq).unwrap_or(0)
    }

    /// Current turn number of the current session.
    pub fn current_turn(&self) -> u32 {
        self.sessions
            .get(&self.current_session_id)
            .map(|s| s.current_turn)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn files(&self) -> &HashMap<String, FileNode> {
        &self.sessions.get(&self.current_session_id).unwrap().files
    }
}

// =======================================================================
// Tests
// =======================================================================
