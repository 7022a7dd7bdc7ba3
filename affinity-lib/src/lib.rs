//! Affinity CLI Library
//!
//! Provisions a dedicated Wine prefix and drives an unattended installation
//! of the Affinity Universal installer inside it: host preflight checks,
//! resumable downloads, idempotent prefix configuration, verification and
//! desktop integration, coordinated by a checkpointed phase state machine.

pub mod config;
pub mod deps;
pub mod download;
pub mod engine;
pub mod error;
pub mod guardrail;
pub mod installer;
pub mod integrate;
pub mod lock;
pub mod prefix;
pub mod profile;
pub mod runner;
pub mod state;
pub mod uninstall;
pub mod verify;
pub mod wine;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigLoader, ConfigOverrides};
pub use engine::{inspect, Collaborators, Orchestrator, RunFailure, RunOutcome, StatusReport};
pub use error::{AffinityError, Result};
pub use guardrail::{CheckResult, CheckSeverity, GuardrailReport};
pub use installer::{discover_all, InstallerCandidate};
pub use profile::{ComponentCatalog, ProfileName};
pub use state::{Phase, PhaseStatus, RunState};
pub use uninstall::{uninstall, UninstallReport};
pub use wine::Wine;
