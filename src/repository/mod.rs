//! Ledger Repository
//!
//! Single storage seam for the engine. Algorithms only see this trait; the
//! SQLite backend is used in production and the in-memory backend in tests.
//!
//! `append` is the only way cap-table rows change after inception. It writes
//! the transactions and the resulting rows atomically and bumps the
//! per-venture version, failing with `VersionConflict` if the caller's
//! snapshot is stale.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryLedgerRepository;
pub use sqlite::SqliteLedgerRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::models::{
    Adjustment, CapTableEntry, CapTableSnapshot, CapTableState, Contribution, ConversionRecord,
    ConversionWindow, LedgerTransaction, RebalancingPeriod, TokenBalance, Venture,
};

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    // -- ventures -------------------------------------------------------------

    /// Insert a venture with its genesis rows. Fails with `AlreadyExists`.
    async fn create_venture(&self, venture: &Venture, genesis: &[CapTableEntry]) -> RepoResult<()>;

    async fn venture(&self, venture_id: &str) -> RepoResult<Option<Venture>>;

    /// All ventures ordered by id.
    async fn list_ventures(&self) -> RepoResult<Vec<Venture>>;

    /// `Some(reason)` flags, `None` clears.
    async fn set_review_flag(&self, venture_id: &str, reason: Option<&str>) -> RepoResult<()>;

    // -- cap table + log ------------------------------------------------------

    async fn read_state(&self, venture_id: &str) -> RepoResult<CapTableSnapshot>;

    /// Atomically append `txns` and apply their `after_pct` to the live rows.
    /// Returns the new version.
    async fn append(
        &self,
        venture_id: &str,
        expected_version: u64,
        txns: &[LedgerTransaction],
    ) -> RepoResult<u64>;

    async fn genesis(&self, venture_id: &str) -> RepoResult<Vec<CapTableEntry>>;

    /// Transactions ordered by seq, optionally only those at or before `upto`.
    async fn transactions(
        &self,
        venture_id: &str,
        upto: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<LedgerTransaction>>;

    async fn has_transactions_for(&self, venture_id: &str, cause_ref: &str) -> RepoResult<bool>;

    async fn transactions_for(
        &self,
        venture_id: &str,
        cause_ref: &str,
    ) -> RepoResult<Vec<LedgerTransaction>>;

    // -- contributions (written by intake, read by the scorer) ----------------

    async fn insert_contribution(&self, contribution: &Contribution) -> RepoResult<()>;

    /// APPROVED contributions with `accepted_at` in `[start, end)`.
    async fn approved_contributions(
        &self,
        venture_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepoResult<Vec<Contribution>>;

    // -- rebalancing periods --------------------------------------------------

    async fn period(&self, period_id: Uuid) -> RepoResult<Option<RebalancingPeriod>>;

    async fn save_period(&self, period: &RebalancingPeriod) -> RepoResult<()>;

    /// Store `period` (already RUNNING) unless any period of the same venture
    /// is RUNNING, this one included. The running period's id is returned and
    /// nothing is written.
    async fn try_begin_period(&self, period: &RebalancingPeriod) -> RepoResult<Option<Uuid>>;

    async fn running_periods(&self, venture_id: Option<&str>) -> RepoResult<Vec<RebalancingPeriod>>;

    async fn record_adjustments(&self, adjustments: &[Adjustment]) -> RepoResult<()>;

    async fn adjustments(&self, period_id: Uuid) -> RepoResult<Vec<Adjustment>>;

    // -- conversion windows ---------------------------------------------------

    async fn save_window(&self, window: &ConversionWindow) -> RepoResult<()>;

    async fn window(&self, window_id: Uuid) -> RepoResult<Option<ConversionWindow>>;

    /// Windows ordered by `opens_at`.
    async fn windows(&self, venture_id: Option<&str>) -> RepoResult<Vec<ConversionWindow>>;

    async fn record_conversions(&self, records: &[ConversionRecord]) -> RepoResult<()>;

    async fn conversion_records(&self, window_id: Uuid) -> RepoResult<Vec<ConversionRecord>>;

    // -- token balances (external) --------------------------------------------

    async fn upsert_token_balance(&self, balance: &TokenBalance) -> RepoResult<()>;

    /// Balances ordered by holder id.
    async fn token_balances(&self, venture_id: &str) -> RepoResult<Vec<TokenBalance>>;
}

/// Apply appended transactions to a live state. Shared by both backends.
pub(crate) fn apply_to_state(state: &mut CapTableState, txns: &[LedgerTransaction]) {
    for txn in txns {
        let entry = state
            .entries
            .entry(txn.holder_id.clone())
            .or_insert_with(|| CapTableEntry {
                venture_id: txn.venture_id.clone(),
                holder_id: txn.holder_id.clone(),
                holder_type: txn.holder_type,
                pct: 0,
                source: String::new(),
                updated_at: txn.timestamp,
            });
        entry.pct = txn.after_pct;
        entry.source = txn.kind.as_str().to_string();
        entry.updated_at = txn.timestamp;
    }
}

/// Seq numbers must continue from `last_seq` without gaps.
pub(crate) fn check_seq(venture_id: &str, last_seq: u64, txns: &[LedgerTransaction]) -> RepoResult<()> {
    for (i, txn) in txns.iter().enumerate() {
        let expected = last_seq + 1 + i as u64;
        if txn.venture_id != venture_id || txn.seq != expected {
            return Err(RepositoryError::Corrupt(format!(
                "transaction {} for {} has seq {}, expected {} for {}",
                txn.id, txn.venture_id, txn.seq, expected, venture_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod repository_tests;
