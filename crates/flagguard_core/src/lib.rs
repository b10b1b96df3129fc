//! flagguard_core: guarded feature changes.
//!
//! Intercepts structural edits to guarded features and routes them through a
//! human approval workflow. Pure domain logic: storage and every outside
//! collaborator sit behind the traits in [`ports`]. Zero sqlx.
//!
//! - `classify` / `diff` / `registry`: what changed, field by field
//! - `conflict`: overlap with outstanding pending changes
//! - `guard`: proceed / conflict / pending decision
//! - `approval` / `apply`: approve, reject, cancel, replay onto live config
//! - `memory`: transactional in-process store

pub mod apply;
pub mod approval;
pub mod classify;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod entities;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod memory;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod rollout;
pub mod types;

pub use approval::{ApprovalCoordinator, ApprovalCredential, ApproveRequest};
pub use config::GuardConfig;
pub use error::{ApplyError, GuardError, Result};
pub use guard::{GuardDecision, GuardDecisionService};
pub use types::*;
