//! Sentinel Service Module
//!
//! Watches an EVM chain for value moving into, out of, or between managed
//! addresses. It supports:
//! - Batched block scanning behind a confirmation lag
//! - Native, token and internal-call (heuristic) classification
//! - At-least-once ledger notification through a durable outbox
//! - Single-flight drains into the fee-deposit account
//! - Periodic balance reconciliation

pub mod amount;
pub mod assets;
pub mod chain;
pub mod classifier;
pub mod config;
pub mod drain;
pub mod error;
pub mod eth;
pub mod lookup;
pub mod matcher;
pub mod mock;
pub mod notifier;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-exports for convenience
pub use assets::{Asset, AssetRegistry};
pub use chain::{Block, BlockTag, ChainClient, ChainTransaction, TransferLog};
pub use classifier::{Category, ClassifiedEvent};
pub use config::SentinelConfig;
pub use drain::{DrainExecutor, DrainOrchestrator, DrainOutcome, DryRunExecutor};
pub use error::{ChainError, DrainError, NotifyError, SentinelError, StoreError};
pub use eth::EthRpcClient;
pub use lookup::{LookupOutcome, TransactionLookup};
pub use notifier::{HttpTransport, Notifier, NotifyTransport, OutboxDispatcher};
pub use reconciler::{BalanceReconciler, ReconcileReport};
pub use registry::{AddressRegistry, MemoryRegistry, PgAddressRegistry, TrackedAddress};
pub use scheduler::{Job, JobHandler, JobRouter, JobScheduler, TokioScheduler};
pub use shutdown::ShutdownSignal;
pub use store::{CursorStore, LockStore, MemoryStore, OutboxStore, PgStore};
pub use worker::{BlockScanner, CycleOutcome, ScanStatus};
