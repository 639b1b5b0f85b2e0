//! In-memory repository.
//!
//! Same contract as the SQLite backend, plus a few fault-injection hooks so
//! tests can provoke version conflicts, slow reads and ledger corruption.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::{apply_to_state, check_seq, LedgerRepository, RepoResult};
use crate::error::RepositoryError;
use crate::ledger::Pct;
use crate::models::{
    Adjustment, CapTableEntry, CapTableSnapshot, CapTableState, Contribution, ContributionStatus,
    ConversionRecord, ConversionWindow, LedgerTransaction, PeriodStatus,
    RebalancingPeriod, TokenBalance, Venture,
};

struct VentureRow {
    venture: Venture,
    genesis: Vec<CapTableEntry>,
    state: CapTableState,
    version: u64,
    last_seq: u64,
    log: Vec<LedgerTransaction>,
}

#[derive(Default)]
struct Inner {
    ventures: BTreeMap<String, VentureRow>,
    contributions: Vec<Contribution>,
    periods: HashMap<Uuid, RebalancingPeriod>,
    adjustments: Vec<Adjustment>,
    windows: HashMap<Uuid, ConversionWindow>,
    conversions: Vec<ConversionRecord>,
    balances: BTreeMap<(String, String), TokenBalance>,
}

#[derive(Default)]
pub struct InMemoryLedgerRepository {
    inner: Mutex<Inner>,
    forced_conflicts: AtomicU32,
    failing_window_saves: AtomicU32,
    contribution_delay: Mutex<Option<Duration>>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` appends fail with `VersionConflict`.
    pub fn fail_next_appends(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` window saves fail as if the database were locked.
    pub fn fail_next_window_saves(&self, n: u32) {
        self.failing_window_saves.store(n, Ordering::SeqCst);
    }

    /// Make contribution reads slow (simulates a stalled scoring query).
    pub fn set_contribution_delay(&self, delay: Option<Duration>) {
        *self.contribution_delay.lock() = delay;
    }

    /// Overwrite a live row without logging it. Corrupts the ledger on purpose.
    pub fn force_set_pct(&self, venture_id: &str, holder_id: &str, pct: Pct) {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.ventures.get_mut(venture_id) {
            if let Some(entry) = row.state.entries.get_mut(holder_id) {
                entry.pct = pct;
            }
        }
    }

    pub fn transaction_count(&self, venture_id: &str) -> usize {
        self.inner
            .lock()
            .ventures
            .get(venture_id)
            .map(|r| r.log.len())
            .unwrap_or(0)
    }

    fn not_found(what: &'static str, id: impl ToString) -> RepositoryError {
        RepositoryError::NotFound {
            what,
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn create_venture(&self, venture: &Venture, genesis: &[CapTableEntry]) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if inner.ventures.contains_key(&venture.id) {
            return Err(RepositoryError::AlreadyExists {
                what: "venture",
                id: venture.id.clone(),
            });
        }
        inner.ventures.insert(
            venture.id.clone(),
            VentureRow {
                venture: venture.clone(),
                genesis: genesis.to_vec(),
                state: CapTableState::from_entries(&venture.id, genesis.iter().cloned()),
                version: 0,
                last_seq: 0,
                log: Vec::new(),
            },
        );
        Ok(())
    }

    async fn venture(&self, venture_id: &str) -> RepoResult<Option<Venture>> {
        Ok(self
            .inner
            .lock()
            .ventures
            .get(venture_id)
            .map(|r| r.venture.clone()))
    }

    async fn list_ventures(&self) -> RepoResult<Vec<Venture>> {
        Ok(self
            .inner
            .lock()
            .ventures
            .values()
            .map(|r| r.venture.clone())
            .collect())
    }

    async fn set_review_flag(&self, venture_id: &str, reason: Option<&str>) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .ventures
            .get_mut(venture_id)
            .ok_or_else(|| Self::not_found("venture", venture_id))?;
        row.venture.flagged_for_review = reason.is_some();
        row.venture.flag_reason = reason.map(str::to_string);
        Ok(())
    }

    async fn read_state(&self, venture_id: &str) -> RepoResult<CapTableSnapshot> {
        let inner = self.inner.lock();
        let row = inner
            .ventures
            .get(venture_id)
            .ok_or_else(|| Self::not_found("venture", venture_id))?;
        Ok(CapTableSnapshot {
            state: row.state.clone(),
            version: row.version,
            last_seq: row.last_seq,
        })
    }

    async fn append(
        &self,
        venture_id: &str,
        expected_version: u64,
        txns: &[LedgerTransaction],
    ) -> RepoResult<u64> {
        let mut inner = self.inner.lock();
        let row = inner
            .ventures
            .get_mut(venture_id)
            .ok_or_else(|| Self::not_found("venture", venture_id))?;

        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced || row.version != expected_version {
            return Err(RepositoryError::VersionConflict {
                venture_id: venture_id.to_string(),
                expected: expected_version,
                actual: if forced { row.version + 1 } else { row.version },
            });
        }
        check_seq(venture_id, row.last_seq, txns)?;

        apply_to_state(&mut row.state, txns);
        row.log.extend_from_slice(txns);
        row.last_seq += txns.len() as u64;
        row.version += 1;
        Ok(row.version)
    }

    async fn genesis(&self, venture_id: &str) -> RepoResult<Vec<CapTableEntry>> {
        let inner = self.inner.lock();
        let row = inner
            .ventures
            .get(venture_id)
            .ok_or_else(|| Self::not_found("venture", venture_id))?;
        Ok(row.genesis.clone())
    }

    async fn transactions(
        &self,
        venture_id: &str,
        upto: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<LedgerTransaction>> {
        let inner = self.inner.lock();
        let Some(row) = inner.ventures.get(venture_id) else {
            return Ok(Vec::new());
        };
        Ok(row
            .log
            .iter()
            .filter(|t| upto.map_or(true, |cutoff| t.timestamp <= cutoff))
            .cloned()
            .collect())
    }

    async fn has_transactions_for(&self, venture_id: &str, cause_ref: &str) -> RepoResult<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .ventures
            .get(venture_id)
            .map(|r| r.log.iter().any(|t| t.cause_ref == cause_ref))
            .unwrap_or(false))
    }

    async fn transactions_for(
        &self,
        venture_id: &str,
        cause_ref: &str,
    ) -> RepoResult<Vec<LedgerTransaction>> {
        let inner = self.inner.lock();
        Ok(inner
            .ventures
            .get(venture_id)
            .map(|r| {
                r.log
                    .iter()
                    .filter(|t| t.cause_ref == cause_ref)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_contribution(&self, contribution: &Contribution) -> RepoResult<()> {
        let mut inner = self.inner.lock();
        if inner.contributions.iter().any(|c| c.id == contribution.id) {
            return Err(RepositoryError::AlreadyExists {
                what: "contribution",
                id: contribution.id.clone(),
            });
        }
        inner.contributions.push(contribution.clone());
        Ok(())
    }

    async fn approved_contributions(
        &self,
        venture_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepoResult<Vec<Contribution>> {
        let delay = *self.contribution_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner.lock();
        let mut rows: Vec<Contribution> = inner
            .contributions
            .iter()
            .filter(|c| c.venture_id == venture_id && c.status == ContributionStatus::Approved)
            .filter(|c| matches!(c.accepted_at, Some(at) if at >= start && at < end))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn period(&self, period_id: Uuid) -> RepoResult<Option<RebalancingPeriod>> {
        Ok(self.inner.lock().periods.get(&period_id).cloned())
    }

    async fn save_period(&self, period: &RebalancingPeriod) -> RepoResult<()> {
        self.inner.lock().periods.insert(period.id, period.clone());
        Ok(())
    }

    async fn try_begin_period(&self, period: &RebalancingPeriod) -> RepoResult<Option<Uuid>> {
        let mut inner = self.inner.lock();
        let busy = inner
            .periods
            .values()
            .find(|p| p.venture_id == period.venture_id && p.status == PeriodStatus::Running)
            .map(|p| p.id);
        if busy.is_none() {
            inner.periods.insert(period.id, period.clone());
        }
        Ok(busy)
    }

    async fn running_periods(&self, venture_id: Option<&str>) -> RepoResult<Vec<RebalancingPeriod>> {
        let inner = self.inner.lock();
        let mut rows: Vec<RebalancingPeriod> = inner
            .periods
            .values()
            .filter(|p| p.status == PeriodStatus::Running)
            .filter(|p| venture_id.map_or(true, |v| p.venture_id == v))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.venture_id, a.period_start).cmp(&(&b.venture_id, b.period_start)));
        Ok(rows)
    }

    async fn record_adjustments(&self, adjustments: &[Adjustment]) -> RepoResult<()> {
        self.inner.lock().adjustments.extend_from_slice(adjustments);
        Ok(())
    }

    async fn adjustments(&self, period_id: Uuid) -> RepoResult<Vec<Adjustment>> {
        Ok(self
            .inner
            .lock()
            .adjustments
            .iter()
            .filter(|a| a.period_id == period_id)
            .cloned()
            .collect())
    }

    async fn save_window(&self, window: &ConversionWindow) -> RepoResult<()> {
        if self
            .failing_window_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RepositoryError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_string()),
            )));
        }
        self.inner.lock().windows.insert(window.id, window.clone());
        Ok(())
    }

    async fn window(&self, window_id: Uuid) -> RepoResult<Option<ConversionWindow>> {
        Ok(self.inner.lock().windows.get(&window_id).cloned())
    }

    async fn windows(&self, venture_id: Option<&str>) -> RepoResult<Vec<ConversionWindow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<ConversionWindow> = inner
            .windows
            .values()
            .filter(|w| venture_id.map_or(true, |v| w.venture_id == v))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.opens_at, a.id).cmp(&(b.opens_at, b.id)));
        Ok(rows)
    }

    async fn record_conversions(&self, records: &[ConversionRecord]) -> RepoResult<()> {
        self.inner.lock().conversions.extend_from_slice(records);
        Ok(())
    }

    async fn conversion_records(&self, window_id: Uuid) -> RepoResult<Vec<ConversionRecord>> {
        Ok(self
            .inner
            .lock()
            .conversions
            .iter()
            .filter(|r| r.window_id == window_id)
            .cloned()
            .collect())
    }

    async fn upsert_token_balance(&self, balance: &TokenBalance) -> RepoResult<()> {
        self.inner.lock().balances.insert(
            (balance.venture_id.clone(), balance.holder_id.clone()),
            balance.clone(),
        );
        Ok(())
    }

    async fn token_balances(&self, venture_id: &str) -> RepoResult<Vec<TokenBalance>> {
        Ok(self
            .inner
            .lock()
            .balances
            .values()
            .filter(|b| b.venture_id == venture_id)
            .cloned()
            .collect())
    }
}

