//! eisen-core library: ACP proxy, context tracker, zone policy, broadcast
//! server, session registry, and orchestrator.
//!
//! The symbol-graph parser (`parser`, `flatten`) is a separate collaborator
//! consumed by the `snapshot` subcommand and by external bindings
//! (`eisen-napi`, `pybridge`, the Tauri app); it does not participate in the
//! proxy/tracker/broadcast core.

pub mod extract;
pub mod flatten;
pub mod orchestrator;
pub mod parser;
pub mod proxy;
pub mod session_registry;
pub mod tcp;
pub mod tracker;
pub mod types;
