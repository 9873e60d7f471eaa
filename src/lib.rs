//! # adt-core
//!
//! Local-host command center for AI coding agents. The core accepts task
//! descriptions for registered projects, decides when and where to launch
//! agent CLI processes, supervises their lifetimes, captures and scrubs
//! their output, chains dependent tasks, and exposes the whole picture over
//! an authenticated HTTP+WebSocket surface.
//!
//! ## Architecture
//!
//! - **Task store**: durable, priority-ordered queue with dependencies,
//!   retries, and an atomic claim operation
//! - **Agent supervisor**: one agent child per project, log capture, exit
//!   detection
//! - **Process supervisor**: long-running dev servers with coordinated
//!   ports and crash classification
//! - **Orchestrator**: the control loop matching pending tasks to idle
//!   projects under a global concurrency cap
//! - **Security plane**: bearer tokens with roles, a hash-chained audit
//!   log, a secret vault, and read-side output scrubbing

/// Agent lifecycle supervision
pub mod agents;
/// HTTP API server and WebSocket gateway
pub mod api;
/// Hash-chained audit logging
pub mod audit;
/// Token authentication and role-based authorization
pub mod auth;
/// Discord chat channel adapter
pub mod chat;
/// Command-line interface
pub mod cli;
/// Configuration and the external project registry
pub mod config;
/// System-wide constants
pub mod constants;
/// Assembly of all subsystems
pub mod core;
/// Error types and handling
pub mod error;
/// In-process event bus
pub mod events;
/// Core data models
pub mod models;
/// Orchestration loop
pub mod orchestrator;
/// Port assignment registry
pub mod ports;
/// Dev-server process supervision
pub mod processes;
/// Request rate limiting
pub mod rate_limit;
/// Secret scrubbing
pub mod scrubber;
/// Durable task and history storage
pub mod store;
/// Real-time log streaming
pub mod streaming;
/// Secrets vault
pub mod vault;

#[cfg(test)]
mod tests;

pub use error::{AdtError, Result};
