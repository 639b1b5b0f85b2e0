//! Transaction Log Auditor
//!
//! Replays genesis + transactions to reconstruct the cap table at any instant
//! and compares the replay against the live rows. The replay is the oracle:
//! if the two disagree, the live table is the one under suspicion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

use crate::context::OpContext;
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::ledger::{format_pct, Pct, HUNDRED_PCT};
use crate::models::{CapTableEntry, CapTableState, HolderId, LedgerTransaction};
use crate::repository::LedgerRepository;

/// A transaction whose `before_pct` does not match the replayed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainBreak {
    pub seq: u64,
    pub holder_id: HolderId,
    pub replayed_before: Pct,
    pub recorded_before: Pct,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub holder_id: HolderId,
    pub live: Pct,
    pub replayed: Pct,
}

#[derive(Debug, Clone)]
pub struct FoldResult {
    pub state: CapTableState,
    pub chain_breaks: Vec<ChainBreak>,
    pub applied: usize,
}

/// Replay `txns` (any order; sorted by seq here) over `genesis`.
///
/// Transactions after `upto` are ignored. A holder first seen in the log is
/// created from the transaction's `holder_type`.
pub fn fold_transactions(
    venture_id: &str,
    genesis: &[CapTableEntry],
    txns: &[LedgerTransaction],
    upto: Option<DateTime<Utc>>,
) -> FoldResult {
    let mut state = CapTableState::from_entries(venture_id, genesis.iter().cloned());
    let mut ordered: Vec<&LedgerTransaction> = txns
        .iter()
        .filter(|t| t.venture_id == venture_id)
        .filter(|t| upto.map_or(true, |cutoff| t.timestamp <= cutoff))
        .collect();
    ordered.sort_by_key(|t| t.seq);

    let mut chain_breaks = Vec::new();
    for txn in &ordered {
        let replayed_before = state.pct_of(&txn.holder_id);
        if replayed_before != txn.before_pct {
            chain_breaks.push(ChainBreak {
                seq: txn.seq,
                holder_id: txn.holder_id.clone(),
                replayed_before,
                recorded_before: txn.before_pct,
            });
        }

        let entry = state
            .entries
            .entry(txn.holder_id.clone())
            .or_insert_with(|| CapTableEntry {
                venture_id: venture_id.to_string(),
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

    FoldResult {
        state,
        chain_breaks,
        applied: ordered.len(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub venture_id: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub live_total: Pct,
    pub replayed_total: Pct,
    pub transactions: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub chain_breaks: Vec<ChainBreak>,
    pub tolerance: Pct,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
            && self.chain_breaks.is_empty()
            && (self.live_total - HUNDRED_PCT).abs() <= self.tolerance
            && (self.replayed_total - HUNDRED_PCT).abs() <= self.tolerance
    }
}

/// Compare live rows against a replayed state.
pub fn compare_states(
    live: &CapTableState,
    replayed: &CapTableState,
    tolerance: Pct,
) -> Vec<Discrepancy> {
    let holders: BTreeSet<&HolderId> = live.entries.keys().chain(replayed.entries.keys()).collect();
    holders
        .into_iter()
        .filter_map(|holder_id| {
            let live_pct = live.pct_of(holder_id);
            let replayed_pct = replayed.pct_of(holder_id);
            ((live_pct - replayed_pct).abs() > tolerance).then(|| Discrepancy {
                holder_id: holder_id.clone(),
                live: live_pct,
                replayed: replayed_pct,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct TransactionAuditor {
    repo: Arc<dyn LedgerRepository>,
    events: Arc<dyn EventSink>,
    tolerance: Pct,
}

impl TransactionAuditor {
    pub fn new(repo: Arc<dyn LedgerRepository>, events: Arc<dyn EventSink>, tolerance: Pct) -> Self {
        Self {
            repo,
            events,
            tolerance,
        }
    }

    /// Cap table as of `upto` (inclusive), or now when `None`.
    pub async fn fold_transactions(
        &self,
        venture_id: &str,
        upto: Option<DateTime<Utc>>,
    ) -> Result<CapTableState, EngineError> {
        self.ensure_venture(venture_id).await?;
        let genesis = self.repo.genesis(venture_id).await?;
        let txns = self.repo.transactions(venture_id, upto).await?;
        Ok(fold_transactions(venture_id, &genesis, &txns, upto).state)
    }

    /// Read-only comparison; no flagging, no events.
    pub async fn check(&self, venture_id: &str) -> Result<ReconciliationReport, EngineError> {
        self.ensure_venture(venture_id).await?;
        let genesis = self.repo.genesis(venture_id).await?;
        let txns = self.repo.transactions(venture_id, None).await?;
        let live = self.repo.read_state(venture_id).await?.state;

        let fold = fold_transactions(venture_id, &genesis, &txns, None);
        Ok(ReconciliationReport {
            venture_id: venture_id.to_string(),
            checked_at: None,
            live_total: live.total(),
            replayed_total: fold.state.total(),
            transactions: fold.applied,
            discrepancies: compare_states(&live, &fold.state, self.tolerance),
            chain_breaks: fold.chain_breaks,
            tolerance: self.tolerance,
        })
    }

    /// Check and, on mismatch, flag the venture and emit an alert.
    pub async fn reconcile(
        &self,
        ctx: &OpContext,
        venture_id: &str,
    ) -> Result<ReconciliationReport, EngineError> {
        let mut report = self.check(venture_id).await?;
        report.checked_at = Some(ctx.now);

        if report.is_consistent() {
            info!(
                venture_id = %venture_id,
                transactions = report.transactions,
                "reconciliation ok"
            );
            return Ok(report);
        }

        error!(
            venture_id = %venture_id,
            discrepancies = report.discrepancies.len(),
            chain_breaks = report.chain_breaks.len(),
            live_total = %format_pct(report.live_total),
            replayed_total = %format_pct(report.replayed_total),
            "reconciliation mismatch"
        );
        let reason = format!(
            "reconciliation mismatch: {} discrepancies, {} chain breaks",
            report.discrepancies.len(),
            report.chain_breaks.len()
        );
        self.repo.set_review_flag(venture_id, Some(&reason)).await?;
        self.events.emit(
            ctx,
            DomainEvent::ReconciliationMismatch {
                venture_id: venture_id.to_string(),
                discrepancies: report.discrepancies.len(),
                chain_breaks: report.chain_breaks.len(),
            },
        );
        self.events.emit(
            ctx,
            DomainEvent::VentureFlagged {
                venture_id: venture_id.to_string(),
                reason,
            },
        );
        Ok(report)
    }

    /// Reconcile every venture. One venture failing to load does not stop the rest.
    pub async fn reconcile_all(&self, ctx: &OpContext) -> Result<Vec<ReconciliationReport>, EngineError> {
        let ventures = self.repo.list_ventures().await?;
        let mut reports = Vec::with_capacity(ventures.len());
        for venture in ventures {
            match self.reconcile(ctx, &venture.id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(venture_id = %venture.id, error = %e, "reconciliation failed"),
            }
        }
        Ok(reports)
    }

    async fn ensure_venture(&self, venture_id: &str) -> Result<(), EngineError> {
        match self.repo.venture(venture_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound {
                what: "venture",
                id: venture_id.to_string(),
            }),
        }
    }
}
