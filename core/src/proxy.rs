//! Bidirectional stdio proxy between editor and ACP agent.
//!
//! Reads lines from editor stdin, inspects for context, forwards to agent stdin.
//! Reads lines from agent stdout, inspects for context, forwards to editor stdout.
//! Agent stderr is inherited (passes through to the editor's stderr).
//!
//! The downstream leg also enforces the zone policy: a `fs/read_text_file`
//! or `fs/write_text_file` request for a path outside the allowed zones is
//! never forwarded to the editor. Instead a JSON-RPC error is synthesized
//! back to the agent's stdin, and a `blocked` event is broadcast to
//! connected UI clients.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use agent_client_protocol_schema::CLIENT_METHOD_NAMES;
use anyhow::Result;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::extract;
use crate::tcp::WireLine;
use crate::tracker::ContextTracker;
use crate::types::{Action, BlockedMessage, ZoneConfig, ZONE_DENIED_ERROR_CODE};

/// Budget for a single extractor/tracker call. Transparency of the pipe
/// outranks correctness of extraction: if acquiring the tracker lock and
/// running extraction together take longer than this, the line is still
/// forwarded and a warning is logged, rather than stalling the pipe.
const EXTRACTION_BUDGET: Duration = Duration::from_millis(50);

/// Run `extract_fn` against the tracker under its lock, bounded by
/// `EXTRACTION_BUDGET`. Never propagates a failure — a timeout only logs.
async fn extract_with_budget(
    tracker: &Arc<Mutex<ContextTracker>>,
    line: &str,
    direction: &'static str,
    extract_fn: impl FnOnce(&str, &mut ContextTracker),
) {
    let work = async {
        let mut t = tracker.lock().await;
        extract_fn(line, &mut t);
    };
    if tokio::time::timeout(EXTRACTION_BUDGET, work).await.is_err() {
        warn!(
            direction,
            budget_ms = EXTRACTION_BUDGET.as_millis() as u64,
            "extraction exceeded budget; forwarding continues unaffected"
        );
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Spawn the ACP agent as a child process with piped stdin/stdout.
pub fn spawn_agent(command: &str, args: &[String]) -> Result<Child> {
    let child = Command::new(command)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Task 1: Read from editor stdin, extract context, forward to agent stdin.
///
/// Returns when editor closes stdin (EOF).
pub async fn upstream_task(
    tracker: Arc<Mutex<ContextTracker>>,
    agent_stdin: Arc<Mutex<ChildStdin>>,
) -> Result<()> {
    let mut reader = BufReader::new(io::stdin());
    let mut line = String::new();
    while reader.read_line(&mut line).await? > 0 {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&line) {
            let method = v.get("method").and_then(|m| m.as_str()).unwrap_or("<response>");
            let id = v.get("id").and_then(|i| i.as_u64());
            debug!(direction = "upstream", method, id, bytes = line.len(), "editor -> agent");
        }
        extract_with_budget(&tracker, &line, "upstream", extract::extract_upstream).await;
        write_line(&agent_stdin, &line).await?;
        line.clear();
    }
    Ok(())
}

/// Task 2: Read from agent stdout, extract context, forward to editor stdout.
///
/// Denies `fs/read_text_file` / `fs/write_text_file` requests for paths
/// outside the configured zones: the request is answered directly (never
/// reaches the editor), the denial is broadcast, and the tracker records an
/// `Action::Blocked` observation.
///
/// Returns when agent closes stdout (EOF / exit).
pub async fn downstream_task(
    tracker: Arc<Mutex<ContextTracker>>,
    agent_stdout: impl AsyncRead + Unpin,
    agent_stdin: Arc<Mutex<ChildStdin>>,
    zone: Arc<ZoneConfig>,
    delta_tx: broadcast::Sender<WireLine>,
) -> Result<()> {
    let mut reader = BufReader::new(agent_stdout);
    let mut writer = io::stdout();
    let mut line = String::new();
    while reader.read_line(&mut line).await? > 0 {
        let parsed: Option<serde_json::Value> = serde_json::from_str(&line).ok();

        if let Some(v) = &parsed {
            let method = v.get("method").and_then(|m| m.as_str()).unwrap_or("<response>");
            let id = v.get("id").and_then(|i| i.as_u64());
            debug!(direction = "downstream", method, id, bytes = line.len(), "agent -> editor");
        }

        if let Some(denial) = check_zone_denial(&parsed, &zone, &tracker, &delta_tx).await {
            write_line(&agent_stdin, &denial).await?;
            line.clear();
            continue;
        }

        extract_with_budget(&tracker, &line, "downstream", extract::extract_downstream).await;
        writer.write_all(line.as_bytes()).await?;
        line.clear();
    }
    Ok(())
}

/// If `parsed` is an `fs/read_text_file` or `fs/write_text_file` request for
/// a path the zone policy denies, returns the JSON-RPC error line to send
/// back to the agent (and records/broadcasts the denial as a side effect).
/// Returns `None` for anything else, including allowed fs requests.
async fn check_zone_denial(
    parsed: &Option<serde_json::Value>,
    zone: &ZoneConfig,
    tracker: &Arc<Mutex<ContextTracker>>,
    delta_tx: &broadcast::Sender<WireLine>,
) -> Option<String> {
    let v = parsed.as_ref()?;
    let method = v.get("method").and_then(|m| m.as_str())?;

    let action = if method == CLIENT_METHOD_NAMES.fs_read_text_file {
        Action::Read
    } else if method == CLIENT_METHOD_NAMES.fs_write_text_file {
        Action::Write
    } else {
        return None;
    };

    let params = v.get("params")?;
    let path = params.get("path").and_then(|p| p.as_str())?;
    if zone.is_allowed(path) {
        return None;
    }

    let id = v.get("id").cloned().unwrap_or(serde_json::Value::Null);
    warn!(path, method, "zone policy denied fs request");

    let (agent_id, session_id) = {
        let mut t = tracker.lock().await;
        let aid = t.agent_id().to_string();
        let sid = t.session_id().to_string();
        t.file_access(path, Action::Blocked);
        (aid, sid)
    };

    let blocked = BlockedMessage::new(&agent_id, &session_id, path, action, now_ms());
    crate::tcp::broadcast_line(delta_tx, &blocked);

    let response = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": ZONE_DENIED_ERROR_CODE,
            "message": format!(
                "path '{path}' is outside the allowed zones; route through the orchestrator instead"
            ),
        }
    });
    Some(format!("{}\n", response))
}

async fn write_line(stdin: &Arc<Mutex<ChildStdin>>, line: &str) -> Result<()> {
    let mut s = stdin.lock().await;
    s.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackerConfig;

    #[tokio::test]
    async fn extraction_over_budget_does_not_panic_or_hang() {
        let tracker = Arc::new(Mutex::new(ContextTracker::new(TrackerConfig::default())));

        // Hold the lock longer than EXTRACTION_BUDGET to force a timeout.
        let held = tracker.clone();
        let guard = held.lock_owned().await;
        let holder = tokio::spawn(async move {
            tokio::time::sleep(EXTRACTION_BUDGET * 3).await;
            drop(guard);
        });

        let start = tokio::time::Instant::now();
        extract_with_budget(&tracker, "{}", "upstream", extract::extract_upstream).await;
        // The call must return promptly (bounded by the budget), not wait for the lock.
        assert!(start.elapsed() < EXTRACTION_BUDGET * 2);

        holder.await.unwrap();
    }

    #[tokio::test]
    async fn extraction_within_budget_still_applies() {
        let tracker = Arc::new(Mutex::new(ContextTracker::new(TrackerConfig::default())));
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"fs/read_text_file","params":{"sessionId":"s1","path":"/a.rs"}}"#;
        extract_with_budget(&tracker, line, "downstream", extract::extract_downstream).await;
        let snap = tracker.lock().await.snapshot();
        assert!(snap.nodes.contains_key("/a.rs"));
    }

    #[tokio::test]
    async fn zone_denial_synthesizes_error_and_records_blocked() {
        let tracker = Arc::new(Mutex::new(ContextTracker::new(TrackerConfig::default())));
        let zone = ZoneConfig::new(vec!["/allowed/**".to_string()]);
        let (delta_tx, mut delta_rx) = broadcast::channel(16);

        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "fs/read_text_file",
            "params": {"sessionId": "s1", "path": "/outside/secret.env"}
        });
        let parsed = Some(line);

        let denial = check_zone_denial(&parsed, &zone, &tracker, &delta_tx).await;
        assert!(denial.is_some());
        let denial = denial.unwrap();
        assert!(denial.contains("-32001"));
        assert!(denial.contains("/outside/secret.env"));

        let broadcasted = delta_rx.try_recv().unwrap();
        assert!(broadcasted.contains("\"blocked\""));

        let snap = tracker.lock().await.snapshot();
        assert_eq!(snap.nodes["/outside/secret.env"].last_action, Action::Blocked);
    }

    #[tokio::test]
    async fn zone_allowed_path_is_not_denied() {
        let tracker = Arc::new(Mutex::new(ContextTracker::new(TrackerConfig::default())));
        let zone = ZoneConfig::new(vec!["/allowed/**".to_string()]);
        let (delta_tx, _rx) = broadcast::channel(16);

        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 8,
            "method": "fs/read_text_file",
            "params": {"sessionId": "s1", "path": "/allowed/file.rs"}
        });
        let parsed = Some(line);

        let denial = check_zone_denial(&parsed, &zone, &tracker, &delta_tx).await;
        assert!(denial.is_none());
    }

    #[tokio::test]
    async fn non_fs_methods_are_never_denied() {
        let tracker = Arc::new(Mutex::new(ContextTracker::new(TrackerConfig::default())));
        let zone = ZoneConfig::new(vec![]); // deny everything
        let (delta_tx, _rx) = broadcast::channel(16);

        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"sessionId": "s1"}
        });
        let parsed = Some(line);

        let denial = check_zone_denial(&parsed, &zone, &tracker, &delta_tx).await;
        assert!(denial.is_none());
    }
}
