//! Cap-Table Engine Library
//!
//! Contribution-based equity rebalancing and cap-table ledger for ventures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Scheduler                           │
//! │   (owns Clock, drives batch worker pool + window ticks)      │
//! └──────────────────────────────────────────────────────────────┘
//!               │                                   │
//!               ▼                                   ▼
//!     ┌───────────────────┐               ┌───────────────────┐
//!     │ RebalancingEngine │               │ ConversionWindow  │
//!     │ (median-relative) │               │ Manager           │
//!     └─────────┬─────────┘               └─────────┬─────────┘
//!               │  ContributionScorer               │ token balances
//!               ▼                                   ▼
//!     ┌──────────────────────────────────────────────────────────┐
//!     │                     CapTableLedger                       │
//!     │  (per-venture lock, bounds, Σ pct == 100.00, retries)    │
//!     └──────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//!     ┌──────────────────────────────────────────────────────────┐
//!     │   LedgerRepository (SQLite / in-memory) + Auditor fold   │
//!     └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutating call takes an explicit [`OpContext`]; nothing reads ambient
//! state or wall-clock time below the scheduler.

pub mod audit;
pub mod config;
pub mod context;
pub mod conversion;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod rebalancing;
pub mod repository;
pub mod scheduler;
pub mod scoring;

#[cfg(test)]
pub(crate) mod test_support;

pub use audit::{ReconciliationReport, TransactionAuditor};
pub use config::EngineConfig;
pub use context::OpContext;
pub use conversion::ConversionWindowManager;
pub use error::{EngineError, RepositoryError};
pub use events::{BroadcastEventSink, DomainEvent, EventSink, RecordingEventSink};
pub use ledger::{from_pct, to_pct, CapTableLedger, Pct, HUNDRED_PCT, PCT_SCALE};
pub use rebalancing::{RebalancingEngine, RunOutcome};
pub use repository::{InMemoryLedgerRepository, LedgerRepository, SqliteLedgerRepository};
pub use scheduler::{BatchReport, BatchRunner, Clock, FakeClock, Scheduler, SystemClock};
pub use scoring::{rules::Rule, ContributionScorer};
