//! Anonymous one-to-one chat server: pairs strangers over WebSocket and relays
//! their messages.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for chat server operations.
pub mod error;
/// Health, readiness, metrics and static assets over HTTP.
pub mod http;
mod ledger;
/// Pairing state machine and session transitions.
pub mod lobby;
/// Prometheus metric helpers and readiness state.
pub mod metrics;
/// Content checks against an external moderation service.
pub mod moderation;
mod queue;
mod ratelimit;
/// Connection registry and identity issuance.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
