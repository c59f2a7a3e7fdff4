//! worldsrv - world server core
//!
//! Keyed delayed-event scheduling for monster status effects, plus the
//! server-wide registry that tracks accounts, characters and worlds through
//! login, logout and world transfer.

/// Server configuration (YAML)
pub mod config;
/// Server lifecycle and periodic tasks
pub mod core;
/// Shared timer pool
pub mod timer;
/// Delay engine and mob status scheduler
pub mod scheduler;
/// Account, character, world and guild registry
pub mod registry;
/// Client session boundary
pub mod session;
/// MySQL persistence
pub mod database;
