//! Sandbox execution engine for agent sessions.
//!
//! Decides per session whether work runs on the host or in a hardened
//! container, manages ephemeral, named and default containers, and
//! reconciles runtime state against intended state.

pub mod backoff;
pub mod config;
pub mod container;
pub mod context;
pub mod credentials;
pub mod engine;
pub mod environments;
pub mod error;
pub mod exec;
pub mod filecache;
pub mod health;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod scratch;

pub use config::Config;
pub use engine::{EngineStatus, SandboxEngine, SessionRecord, SessionRun};
pub use error::{SandboxError, SandboxResult};
pub use policy::{ExecutionMode, ExecutionOutcome, ExecutionRequest, SessionSource, TrustLevel};
