//! Devgate - on-demand local development host adapter
//!
//! This library supervises one long-running backend process per app and
//! routes HTTP traffic to it by hostname:
//! - Launches each app's shell command on a freshly allocated loopback port
//! - Captures merged stdout/stderr into a bounded log buffer
//! - Stops the backend when its output matches a restart pattern
//! - Probes the port until the backend accepts connections
//! - Reverse proxies requests (including upgrades) to the running backend

pub mod adapter;
pub mod config;
pub mod error;
pub mod launcher;
pub mod logbuf;
pub mod probe;
pub mod registry;
pub mod router;
pub mod server;
