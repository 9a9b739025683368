//! Scour - retention & housekeeping job coordination for event analytics tables
//!
//! This crate decides, for each (job type, target key, calendar day), whether
//! a purge/audit job may run, executes it exactly-once-at-a-time under
//! contention, and keeps a queryable audit trail. The key components are:
//!
//! ## Coordination
//!
//! - [`HousekeepingService`]: the run state machine and query surface
//! - [`Database`]: snapshot store, run ledger and batched purge primitives
//!
//! ## Wiring
//!
//! - [`registry`]: resolves logical event keys to physical tables
//! - [`scheduler`]: binds jobs to cron expressions and fires them
//! - [`config`]: housekeeping tunables and the registry file

pub mod config;
pub mod db;
pub mod housekeeping;
pub mod registry;
pub mod scheduler;

// Coordination
pub use db::{
    DailyRow, Database, DbError, DbResult, JobType, RunId, RunItemRow, RunRow, RunStatus,
    RunSummaryRow, TriggerType,
};
pub use housekeeping::{
    HousekeepingError, HousekeepingService, Preview, PreviewEvent, RunHistoryEntry, RunItemOutcome,
    RunOutcome, EVENT_KEY_ALL, EVENT_KEY_AUDIT,
};

// Wiring
pub use config::{AppConfig, ConfigError, HousekeepingConfig};
pub use registry::{EventDefinition, EventRegistry, RegistryError};
pub use scheduler::{next_cron_run, spawn_scheduler, validate_cron, JobBinding};
