//! flagguard_postgres: Postgres adapters for the guard ports.
//!
//! Implements `GuardStore`/`GuardTx` and the live-configuration repositories
//! over one sqlx transaction, plus `GuardPolicy` and `ApproverDirectory` over
//! the project tables. Schema lives in `migrations/`.

pub mod config;
pub mod policy;
pub mod sqlx_types;
pub mod store;

pub use config::PgConfig;
pub use policy::{PgApproverDirectory, PgGuardPolicy};
pub use store::{PgGuardStore, PgGuardTx};

/// Schema for the guard tables, applied by deployments and integration tests.
pub const MIGRATION_SQL: &str = include_str!("../../../migrations/0001_guarded_changes.sql");
