//! legion-core - runtime core for orchestrating fleets of cooperating AI
//! agent sessions.
//!
//! Nine components own one concern each (§2): an append-only per-session
//! Event Log, a JSON-file State Store for durable metadata, an Agent Driver
//! abstraction over external agent processes, a per-session Session Runtime
//! actor, a Comm Router for inter-minion messaging, a Legion Coordinator for
//! spawn/dispose hierarchies, a cron-driven Scheduler, an Observer Hub
//! fanning events out to subscribers, and a Control Surface tying all of the
//! above into one RPC-shaped facade.

#![allow(clippy::too_many_arguments)]

pub mod comm;
pub mod config;
pub mod control;
pub mod domain;
pub mod driver;
pub mod error;
pub mod event_log;
pub mod legion;
pub mod observer;
pub mod runtime;
pub mod scheduler;
pub mod state_store;

pub use control::ControlSurface;
pub use error::{CoreError, CoreResult};

/// Install a `tracing-subscriber` global subscriber from `RUST_LOG` (or
/// `info` if unset). The crate itself never calls this — every `tracing`
/// event it emits goes through whatever subscriber the embedding binary
/// (an HTTP/WebSocket server, a CLI) installs. Exposed as a convenience for
/// that binary, not invoked from anywhere in this crate.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}
