//! Client-side team trust engine.
//!
//! Teams are signed, append-only chains of membership and key events. This
//! crate loads and verifies those chains, derives roles and capabilities
//! (including admin authority inherited from ancestor teams), manages the
//! per-generation shared secret, and keeps a local cache converged with the
//! server through push notifications and bounded polling.
//!
//! The server side is abstracted behind [`chain::TeamTransport`] and
//! [`keys::UserKeyResolver`]; [`memory`] provides in-process versions of
//! both.

extern crate hex;
extern crate serde;

// Signed chains: loading, verification, editing
pub mod chain;

// Engine settings from the environment
pub mod config;

// Per-client handles shared by every operation
pub mod context;

// Push invalidation and polling
pub mod convergence;

// Device keys, the key directory and shared secret generations
pub mod keys;

// In-process transport and key directory
pub mod memory;

// Roles, capabilities and implicit admin
pub mod permissions;

pub use chain::{LoadTeamArg, Team, TeamError, TeamId, TeamName, UserId};
pub use config::{ConfigError, EngineSettings};
pub use context::TeamContext;
pub use permissions::TeamCapabilities;
