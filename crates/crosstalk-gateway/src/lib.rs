//! The crosstalk gateway: operator WS protocol, webhook ingress, inbound
//! routing into per-session lanes, and exec approval mediation. The binary
//! in `main.rs` wires this together; embedders can build an
//! [`app::AppState`] with their own [`crosstalk_agent::AgentRunner`].

pub mod app;
pub mod auth;
pub mod control;
pub mod executor;
pub mod http;
pub mod ingest;
pub mod nodes;
pub mod ws;

use tracing::warn;

/// SIGUSR1-equivalent restart signal: the process signals itself; the
/// signal handler in `main` re-execs the binary.
pub fn restart_signal() {
    let pid = nix::unistd::getpid();
    if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGUSR1) {
        warn!(error = %e, "restart signal failed");
    }
}
