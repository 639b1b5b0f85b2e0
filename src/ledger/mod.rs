//! Cap-Table Ledger
//!
//! The only writer of cap-table rows after inception. Every mutation:
//!
//! 1. takes the in-process venture lock,
//! 2. reads the versioned snapshot,
//! 3. plans the batch with [`plan::plan_batch`] (bounds, reserve balancing,
//!    Σ == 100 post-check),
//! 4. appends the resulting transactions with an optimistic version check,
//!    retrying with exponential backoff on conflict.
//!
//! A planned sum mismatch commits nothing and flags the venture for review.

pub mod pct;
pub mod plan;

pub use pct::*;
pub use plan::{plan_batch, BatchPlan, HolderDelta, PlannedChange, SkippedChange};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::TransactionAuditor;
use crate::config::LedgerConfig;
use crate::context::OpContext;
use crate::error::{EngineError, RepositoryError};
use crate::events::{DomainEvent, EventSink};
use crate::models::{
    CapTableEntry, HolderId, HolderType, LedgerTransaction, TransactionKind, Venture,
};
use crate::repository::LedgerRepository;

#[cfg(test)]
mod ledger_tests;

/// Source tag on rows written at inception.
pub const GENESIS_SOURCE: &str = "GENESIS";

/// Inception allocation for one holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub holder_id: HolderId,
    pub holder_type: HolderType,
    pub pct: Pct,
}

/// What a batch is for. Determines the transaction kind and `cause_ref`.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause {
    Rebalance { period_id: Uuid },
    Conversion { window_id: Uuid },
    Manual { reference: String },
}

impl Cause {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Cause::Rebalance { .. } => TransactionKind::Rebalance,
            Cause::Conversion { .. } => TransactionKind::Conversion,
            Cause::Manual { .. } => TransactionKind::Manual,
        }
    }

    pub fn cause_ref(&self) -> String {
        match self {
            Cause::Rebalance { period_id } => period_id.to_string(),
            Cause::Conversion { window_id } => window_id.to_string(),
            Cause::Manual { reference } => format!("manual:{}", reference),
        }
    }
}

/// Result of one committed (or empty) batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Holder transactions in planning order, then the reserve transaction.
    pub transactions: Vec<LedgerTransaction>,
    pub skipped: Vec<SkippedChange>,
    /// Commit attempts used; 0 when nothing needed committing.
    pub attempts: u32,
}

impl BatchOutcome {
    /// Transactions for the targeted holders (excludes the reserve move).
    pub fn applied(&self) -> impl Iterator<Item = &LedgerTransaction> {
        self.transactions
            .iter()
            .filter(|t| t.holder_type != HolderType::Reserve)
    }

    pub fn reserve_delta(&self) -> Pct {
        self.transactions
            .iter()
            .filter(|t| t.holder_type == HolderType::Reserve)
            .map(|t| t.delta())
            .sum()
    }
}

/// Proof that the caller holds a venture's mutation lock.
pub struct VentureGuard {
    venture_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl VentureGuard {
    pub fn venture_id(&self) -> &str {
        &self.venture_id
    }
}

#[derive(Clone)]
pub struct CapTableLedger {
    repo: Arc<dyn LedgerRepository>,
    events: Arc<dyn EventSink>,
    auditor: TransactionAuditor,
    config: LedgerConfig,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CapTableLedger {
    pub fn new(
        repo: Arc<dyn LedgerRepository>,
        events: Arc<dyn EventSink>,
        config: LedgerConfig,
    ) -> Self {
        let auditor = TransactionAuditor::new(repo.clone(), events.clone(), config.sum_tolerance());
        Self {
            repo,
            events,
            auditor,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn repository(&self) -> &Arc<dyn LedgerRepository> {
        &self.repo
    }

    pub fn auditor(&self) -> &TransactionAuditor {
        &self.auditor
    }

    pub fn tolerance(&self) -> Pct {
        self.config.sum_tolerance()
    }

    /// Wait for exclusive mutation rights on a venture.
    pub async fn lock_venture(&self, venture_id: &str) -> VentureGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(venture_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        VentureGuard {
            venture_id: venture_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    // =========================================================================
    // INCEPTION / QUERIES
    // =========================================================================

    pub async fn create_venture(
        &self,
        ctx: &OpContext,
        venture: Venture,
        genesis: &[GenesisAllocation],
    ) -> Result<(), EngineError> {
        validate_venture(&venture)?;
        validate_genesis(&venture, genesis, self.tolerance())?;

        let entries: Vec<CapTableEntry> = genesis
            .iter()
            .map(|g| CapTableEntry {
                venture_id: venture.id.clone(),
                holder_id: g.holder_id.clone(),
                holder_type: g.holder_type,
                pct: g.pct,
                source: GENESIS_SOURCE.to_string(),
                updated_at: ctx.now,
            })
            .collect();

        self.repo
            .create_venture(&venture, &entries)
            .await
            .map_err(|e| match e {
                RepositoryError::AlreadyExists { .. } => EngineError::validation_for(
                    &venture.id,
                    "venture already exists",
                ),
                other => other.into(),
            })?;

        info!(
            venture_id = %venture.id,
            holders = entries.len(),
            actor = %ctx.actor,
            "venture created"
        );
        Ok(())
    }

    pub async fn get_cap_table(&self, venture_id: &str) -> Result<Vec<CapTableEntry>, EngineError> {
        self.load_venture(venture_id).await?;
        let snapshot = self.repo.read_state(venture_id).await?;
        Ok(snapshot.state.into_entries())
    }

    async fn load_venture(&self, venture_id: &str) -> Result<Venture, EngineError> {
        self.repo
            .venture(venture_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                what: "venture",
                id: venture_id.to_string(),
            })
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Apply rebalancing deltas for one period.
    pub async fn apply_adjustments(
        &self,
        ctx: &OpContext,
        venture_id: &str,
        period_id: Uuid,
        deltas: &[HolderDelta],
    ) -> Result<BatchOutcome, EngineError> {
        let guard = self.lock_venture(venture_id).await;
        self.apply_locked(&guard, ctx, Cause::Rebalance { period_id }, deltas)
            .await
    }

    /// Apply conversion grants funded from the reserve.
    pub async fn apply_conversions(
        &self,
        ctx: &OpContext,
        venture_id: &str,
        window_id: Uuid,
        grants: &[HolderDelta],
    ) -> Result<BatchOutcome, EngineError> {
        if let Some(bad) = grants.iter().find(|g| g.delta < 0) {
            return Err(EngineError::validation_for(
                venture_id,
                format!("conversion for {} is negative", bad.holder_id),
            ));
        }
        let guard = self.lock_venture(venture_id).await;
        self.apply_locked(&guard, ctx, Cause::Conversion { window_id }, grants)
            .await
    }

    /// Operator correction for a single holder. A refused change is an error.
    pub async fn manual_adjustment(
        &self,
        ctx: &OpContext,
        venture_id: &str,
        holder_id: &str,
        delta: Pct,
        reason: &str,
    ) -> Result<BatchOutcome, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::validation_for(
                venture_id,
                "manual adjustment needs a reason",
            ));
        }
        if delta == 0 {
            return Err(EngineError::validation_for(venture_id, "delta is zero"));
        }

        let guard = self.lock_venture(venture_id).await;
        let outcome = self
            .apply_locked(
                &guard,
                ctx,
                Cause::Manual {
                    reference: reason.trim().to_string(),
                },
                &[HolderDelta::new(holder_id, delta)],
            )
            .await?;

        match outcome.skipped.first() {
            Some(skip) => Err(skip.to_error(venture_id)),
            None => Ok(outcome),
        }
    }

    /// Apply a batch while the caller already holds the venture lock.
    pub async fn apply_locked(
        &self,
        guard: &VentureGuard,
        ctx: &OpContext,
        cause: Cause,
        deltas: &[HolderDelta],
    ) -> Result<BatchOutcome, EngineError> {
        let venture_id = guard.venture_id();
        let items: Vec<HolderDelta> = deltas.iter().filter(|d| d.delta != 0).cloned().collect();
        let cause_ref = cause.cause_ref();
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let venture = self.load_venture(venture_id).await?;
            if venture.flagged_for_review {
                return Err(EngineError::VentureFlagged {
                    venture_id: venture_id.to_string(),
                });
            }

            let snapshot = self.repo.read_state(venture_id).await?;
            let plan = match plan_batch(&venture, &snapshot.state, &items, self.tolerance(), ctx.now) {
                Ok(plan) => plan,
                Err(e) if e.requires_manual_review() => {
                    self.flag_for_review(ctx, venture_id, &e.to_string()).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let transactions = build_transactions(ctx, venture_id, &cause, &cause_ref, snapshot.last_seq, &plan);
            if transactions.is_empty() {
                let outcome = BatchOutcome {
                    transactions,
                    skipped: plan.skipped,
                    attempts: 0,
                };
                self.emit_outcome(ctx, venture_id, &cause, &outcome);
                return Ok(outcome);
            }

            match self
                .repo
                .append(venture_id, snapshot.version, &transactions)
                .await
            {
                Ok(new_version) => {
                    debug!(
                        venture_id = %venture_id,
                        cause_ref = %cause_ref,
                        version = new_version,
                        summary = %plan::describe(&plan),
                        "ledger batch committed"
                    );
                    let outcome = BatchOutcome {
                        transactions,
                        skipped: plan.skipped,
                        attempts: attempt,
                    };
                    self.emit_outcome(ctx, venture_id, &cause, &outcome);
                    return Ok(outcome);
                }
                Err(RepositoryError::VersionConflict {
                    expected, actual, ..
                }) => {
                    if attempt >= max_attempts {
                        warn!(
                            venture_id = %venture_id,
                            attempts = attempt,
                            "giving up after repeated version conflicts"
                        );
                        return Err(EngineError::ConcurrencyConflict {
                            venture_id: venture_id.to_string(),
                            attempts: attempt,
                        });
                    }
                    let backoff = self.config.backoff(attempt);
                    debug!(
                        venture_id = %venture_id,
                        expected,
                        actual,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "version conflict, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn flag_for_review(&self, ctx: &OpContext, venture_id: &str, reason: &str) {
        error!(venture_id = %venture_id, reason = %reason, "flagging venture for manual review");
        if let Err(e) = self.repo.set_review_flag(venture_id, Some(reason)).await {
            error!(venture_id = %venture_id, error = %e, "failed to persist review flag");
        }
        self.events.emit(
            ctx,
            DomainEvent::VentureFlagged {
                venture_id: venture_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Operator action. Refuses while the live table disagrees with the log.
    pub async fn clear_review_flag(&self, ctx: &OpContext, venture_id: &str) -> Result<(), EngineError> {
        let _guard = self.lock_venture(venture_id).await;
        let venture = self.load_venture(venture_id).await?;
        if !venture.flagged_for_review {
            return Ok(());
        }

        let report = self.auditor.check(venture_id).await?;
        if !report.is_consistent() {
            return Err(EngineError::validation_for(
                venture_id,
                format!(
                    "ledger still disagrees with the transaction log ({} discrepancies, {} chain breaks, live sum {})",
                    report.discrepancies.len(),
                    report.chain_breaks.len(),
                    format_pct(report.live_total)
                ),
            ));
        }

        self.repo.set_review_flag(venture_id, None).await?;
        info!(venture_id = %venture_id, actor = %ctx.actor, "review flag cleared");
        Ok(())
    }

    fn emit_outcome(&self, ctx: &OpContext, venture_id: &str, cause: &Cause, outcome: &BatchOutcome) {
        for txn in &outcome.transactions {
            let event = match cause {
                Cause::Conversion { window_id } if txn.holder_type != HolderType::Reserve => {
                    DomainEvent::ConversionApplied {
                        venture_id: venture_id.to_string(),
                        window_id: *window_id,
                        holder_id: txn.holder_id.clone(),
                        equity_delta: from_pct(txn.delta()),
                    }
                }
                _ => DomainEvent::EquityAdjusted {
                    venture_id: venture_id.to_string(),
                    holder_id: txn.holder_id.clone(),
                    delta: from_pct(txn.delta()),
                    kind: txn.kind,
                    cause_ref: txn.cause_ref.clone(),
                },
            };
            self.events.emit(ctx, event);
        }

        for skip in &outcome.skipped {
            warn!(
                venture_id = %venture_id,
                holder_id = %skip.holder_id,
                delta = %format_pct(skip.delta),
                reason = %skip.reason,
                "holder change skipped"
            );
            let event = match cause {
                Cause::Conversion { window_id } => DomainEvent::ConversionSkipped {
                    venture_id: venture_id.to_string(),
                    window_id: *window_id,
                    holder_id: skip.holder_id.clone(),
                    equity_delta: from_pct(skip.delta),
                    reason: skip.reason.to_string(),
                },
                _ => DomainEvent::AdjustmentSkipped {
                    venture_id: venture_id.to_string(),
                    holder_id: skip.holder_id.clone(),
                    delta: from_pct(skip.delta),
                    cause_ref: cause.cause_ref(),
                    reason: skip.reason.to_string(),
                },
            };
            self.events.emit(ctx, event);
        }
    }
}

fn build_transactions(
    ctx: &OpContext,
    venture_id: &str,
    cause: &Cause,
    cause_ref: &str,
    last_seq: u64,
    plan: &BatchPlan,
) -> Vec<LedgerTransaction> {
    plan.changes
        .iter()
        .chain(plan.reserve_change.iter())
        .enumerate()
        .map(|(i, change)| LedgerTransaction {
            id: Uuid::new_v4(),
            venture_id: venture_id.to_string(),
            seq: last_seq + 1 + i as u64,
            holder_id: change.holder_id.clone(),
            holder_type: change.holder_type,
            kind: cause.kind(),
            before_pct: change.before,
            after_pct: change.after,
            timestamp: ctx.now,
            cause_ref: cause_ref.to_string(),
        })
        .collect()
}

fn validate_venture(venture: &Venture) -> Result<(), EngineError> {
    let fail = |reason: String| Err(EngineError::validation_for(&venture.id, reason));

    if venture.id.trim().is_empty() {
        return Err(EngineError::validation("venture id is empty"));
    }
    if venture.owner_id.trim().is_empty() {
        return fail("owner id is empty".to_string());
    }
    for (name, value) in [
        ("owner_min_pct", venture.owner_min_pct),
        ("alice_cap_pct", venture.alice_cap_pct),
        ("reserve_pct", venture.reserve_pct),
    ] {
        if !(0..=HUNDRED_PCT).contains(&value) {
            return fail(format!("{} {} is outside 0..100", name, format_pct(value)));
        }
    }
    if venture.alice_cap_pct == 0 {
        return fail("alice_cap_pct must be positive".to_string());
    }
    if venture.flagged_for_review {
        return fail("a new venture cannot start flagged".to_string());
    }
    Ok(())
}

fn validate_genesis(
    venture: &Venture,
    genesis: &[GenesisAllocation],
    tolerance: Pct,
) -> Result<(), EngineError> {
    let fail = |reason: String| Err(EngineError::validation_for(&venture.id, reason));

    let mut seen = BTreeSet::new();
    for g in genesis {
        if g.holder_id.trim().is_empty() {
            return fail("genesis holder id is empty".to_string());
        }
        if !seen.insert(g.holder_id.as_str()) {
            return fail(format!("holder {} listed twice in genesis", g.holder_id));
        }
        if !(0..=HUNDRED_PCT).contains(&g.pct) {
            return fail(format!(
                "holder {} genesis pct {} is outside 0..100",
                g.holder_id,
                format_pct(g.pct)
            ));
        }
    }

    let owners: Vec<_> = genesis
        .iter()
        .filter(|g| g.holder_type == HolderType::Owner)
        .collect();
    match owners.as_slice() {
        [owner] if owner.holder_id == venture.owner_id => {
            if owner.pct < venture.owner_min_pct {
                return fail(format!(
                    "owner genesis {} is below the floor {}",
                    format_pct(owner.pct),
                    format_pct(venture.owner_min_pct)
                ));
            }
        }
        [owner] => {
            return fail(format!(
                "OWNER row {} does not match owner_id {}",
                owner.holder_id, venture.owner_id
            ))
        }
        _ => return fail(format!("expected exactly one OWNER row, found {}", owners.len())),
    }

    let reserves: Vec<_> = genesis
        .iter()
        .filter(|g| g.holder_type == HolderType::Reserve)
        .collect();
    match reserves.as_slice() {
        [reserve] if reserve.pct == venture.reserve_pct => {}
        [reserve] => {
            return fail(format!(
                "RESERVE genesis {} does not match reserve_pct {}",
                format_pct(reserve.pct),
                format_pct(venture.reserve_pct)
            ))
        }
        _ => {
            return fail(format!(
                "expected exactly one RESERVE row, found {}",
                reserves.len()
            ))
        }
    }

    let total: Pct = genesis.iter().map(|g| g.pct).sum();
    if (total - HUNDRED_PCT).abs() > tolerance {
        return fail(format!("genesis sums to {}, not 100", format_pct(total)));
    }
    Ok(())
}
