//! custody_sentinel - Custodial EVM deposit monitor
//!
//! Scans an EVM chain for activity on managed deposit addresses, reports it
//! to an external ledger and consolidates balances into a fee-deposit
//! account.
//!
//! # Modules
//!
//! - [`config`] - Process configuration (logging, database, sentinel)
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool
//! - [`sentinel`] - Scanner, classifier, notifier, drains and reconciler

pub mod config;
pub mod db;
pub mod logging;
pub mod sentinel;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use sentinel::{
    BlockScanner, ClassifiedEvent, DrainOrchestrator, LookupOutcome, Notifier, SentinelConfig,
    SentinelError, ShutdownSignal,
};
