//! Rebalancing Engine
//!
//! Median-relative redistribution, once per venture per period:
//!
//! ```text
//! median          = median(scores)            (0 when ≤ 1 holder scored)
//! total_abs_diff  = Σ |score − median|
//! delta(holder)   = clamp((score − median) / total_abs_diff × max_delta, ±max_delta)
//! ```
//!
//! Deltas under `epsilon` are dropped. The batch goes through the ledger,
//! which skips holders that would breach a bound.
//!
//! Period lifecycle: SCHEDULED → RUNNING → {COMPLETED | FAILED}. The mutation
//! phase runs in its own task under the venture lock so a caller-side timeout
//! never interrupts a commit; [`RebalancingEngine::mark_timed_out`] resolves
//! the period afterwards.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{RebalancingConfig, MAX_ADJUSTMENT_DELTA};
use crate::context::OpContext;
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::ledger::{to_pct, BatchOutcome, CapTableLedger, Cause, HolderDelta, VentureGuard};
use crate::models::{Adjustment, AdjustmentOutcome, HolderId, PeriodStatus, RebalancingPeriod};
use crate::repository::LedgerRepository;
use crate::scoring::ContributionScorer;


// =============================================================================
// PURE ALGORITHM
// =============================================================================

/// Median; mean of the two middle values for even counts, 0 for ≤ 1 value.
pub fn median(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Per-holder deltas in percentage points, already clamped and filtered.
pub fn compute_deltas(scores: &BTreeMap<HolderId, f64>, cfg: &RebalancingConfig) -> BTreeMap<HolderId, f64> {
    if scores.len() <= 1 {
        return BTreeMap::new();
    }

    // configs built in code skip validation
    let max_delta = cfg.max_delta.clamp(0.0, MAX_ADJUSTMENT_DELTA);
    let values: Vec<f64> = scores.values().copied().collect();
    let med = median(&values);
    let total_abs_diff: f64 = values.iter().map(|s| (s - med).abs()).sum();
    if total_abs_diff <= 0.0 {
        return BTreeMap::new();
    }

    scores
        .iter()
        .filter_map(|(holder, score)| {
            let raw = (score - med) / total_abs_diff * max_delta;
            let delta = raw.clamp(-max_delta, max_delta);
            (delta.abs() >= cfg.epsilon).then(|| (holder.clone(), delta))
        })
        .collect()
}

/// Fixed-point batch for the ledger, in holder order.
pub fn to_batch(deltas: &BTreeMap<HolderId, f64>) -> Vec<HolderDelta> {
    deltas
        .iter()
        .map(|(holder, delta)| HolderDelta::new(holder.clone(), to_pct(*delta)))
        .filter(|d| d.delta != 0)
        .collect()
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        period_id: Uuid,
        applied: usize,
        skipped: usize,
    },
    /// Period had already committed; nothing recomputed.
    AlreadyCompleted { period_id: Uuid },
    Failed {
        period_id: Uuid,
        kind: &'static str,
        reason: String,
    },
}

impl RunOutcome {
    pub fn period_id(&self) -> Uuid {
        match self {
            RunOutcome::Completed { period_id, .. }
            | RunOutcome::AlreadyCompleted { period_id }
            | RunOutcome::Failed { period_id, .. } => *period_id,
        }
    }
}

#[derive(Clone)]
pub struct RebalancingEngine {
    repo: Arc<dyn LedgerRepository>,
    ledger: CapTableLedger,
    scorer: ContributionScorer,
    events: Arc<dyn EventSink>,
    config: RebalancingConfig,
}

impl RebalancingEngine {
    pub fn new(
        ledger: CapTableLedger,
        scorer: ContributionScorer,
        events: Arc<dyn EventSink>,
        config: RebalancingConfig,
    ) -> Self {
        Self {
            repo: ledger.repository().clone(),
            ledger,
            scorer,
            events,
            config,
        }
    }

    pub fn ledger(&self) -> &CapTableLedger {
        &self.ledger
    }

    /// Record a SCHEDULED period ahead of time. Existing records are returned unchanged.
    pub async fn schedule(
        &self,
        ctx: &OpContext,
        venture_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<RebalancingPeriod, EngineError> {
        validate_window(venture_id, period_start, period_end)?;
        self.require_venture(venture_id).await?;

        let id = RebalancingPeriod::id_for(venture_id, period_start, period_end);
        if let Some(existing) = self.repo.period(id).await? {
            return Ok(existing);
        }
        let period = RebalancingPeriod::scheduled(venture_id, period_start, period_end);
        self.repo.save_period(&period).await?;
        info!(venture_id = %venture_id, period_id = %id, actor = %ctx.actor, "period scheduled");
        Ok(period)
    }

    pub async fn run(
        &self,
        ctx: &OpContext,
        venture_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<RunOutcome, EngineError> {
        validate_window(venture_id, period_start, period_end)?;
        let venture = self.require_venture(venture_id).await?;

        let period_id = RebalancingPeriod::id_for(venture_id, period_start, period_end);
        let cause_ref = period_id.to_string();
        let mut period = self
            .repo
            .period(period_id)
            .await?
            .unwrap_or_else(|| RebalancingPeriod::scheduled(venture_id, period_start, period_end));

        if period.status == PeriodStatus::Completed {
            return Ok(RunOutcome::AlreadyCompleted { period_id });
        }
        if self.repo.has_transactions_for(venture_id, &cause_ref).await? {
            // Committed but the period record never caught up (crash).
            period.status = PeriodStatus::Completed;
            period.failure_reason = None;
            period.finished_at.get_or_insert(ctx.now);
            self.repo.save_period(&period).await?;
            info!(venture_id = %venture_id, period_id = %period_id, "period already committed");
            return Ok(RunOutcome::AlreadyCompleted { period_id });
        }
        if period.status == PeriodStatus::Running {
            return Err(EngineError::PeriodBusy {
                venture_id: venture_id.to_string(),
                running_period: period_id,
            });
        }
        if venture.flagged_for_review {
            let err = EngineError::VentureFlagged {
                venture_id: venture_id.to_string(),
            };
            return self.fail_period(ctx, period, &err).await;
        }

        period.status = PeriodStatus::Running;
        period.started_at = Some(ctx.now);
        period.finished_at = None;
        period.failure_reason = None;
        if let Some(running_period) = self.repo.try_begin_period(&period).await? {
            return Err(EngineError::PeriodBusy {
                venture_id: venture_id.to_string(),
                running_period,
            });
        }
        info!(venture_id = %venture_id, period_id = %period_id, "rebalancing period started");

        let scores = match self
            .scorer
            .compute_scores(venture_id, period_start, period_end)
            .await
        {
            Ok(scores) => scores,
            Err(e) => return self.fail_period(ctx, period, &e).await,
        };
        let deltas = compute_deltas(&scores, &self.config);
        let batch = to_batch(&deltas);

        let engine = self.clone();
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { engine.commit_period(task_ctx, period, batch).await });
        handle
            .await
            .map_err(|e| EngineError::Task(format!("rebalancing commit for {}: {}", venture_id, e)))?
    }

    /// Mutation phase. Runs detached from the caller's future.
    async fn commit_period(
        &self,
        ctx: OpContext,
        period: RebalancingPeriod,
        batch: Vec<HolderDelta>,
    ) -> Result<RunOutcome, EngineError> {
        let guard = self.ledger.lock_venture(&period.venture_id).await;

        let current = self.repo.period(period.id).await?;
        if current.as_ref().map(|p| p.status) != Some(PeriodStatus::Running) {
            warn!(
                venture_id = %period.venture_id,
                period_id = %period.id,
                planned = batch.len(),
                "period no longer running, discarding planned adjustments"
            );
            let skipped: Vec<Adjustment> = batch
                .iter()
                .map(|d| Adjustment {
                    period_id: period.id,
                    holder_id: d.holder_id.clone(),
                    delta: d.delta,
                    applied_at: ctx.now,
                    outcome: AdjustmentOutcome::SkippedTimeout,
                })
                .collect();
            self.repo.record_adjustments(&skipped).await?;
            return Err(EngineError::Timeout {
                venture_id: period.venture_id.clone(),
                period_id: Some(period.id),
            });
        }

        let outcome = match self
            .ledger
            .apply_locked(&guard, &ctx, Cause::Rebalance { period_id: period.id }, &batch)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_period_locked(&guard, &ctx, period, &e).await,
        };

        self.repo
            .record_adjustments(&adjustment_records(&period, &ctx, &outcome))
            .await?;

        let applied = outcome.applied().count();
        let skipped = outcome.skipped.len();
        let mut done = period;
        done.status = PeriodStatus::Completed;
        done.finished_at = Some(ctx.now);
        self.repo.save_period(&done).await?;
        drop(guard);

        info!(
            venture_id = %done.venture_id,
            period_id = %done.id,
            applied,
            skipped,
            "rebalancing period completed"
        );
        self.events.emit(
            &ctx,
            DomainEvent::RebalancingCompleted {
                venture_id: done.venture_id.clone(),
                period_id: done.id,
                applied,
                skipped,
            },
        );
        Ok(RunOutcome::Completed {
            period_id: done.id,
            applied,
            skipped,
        })
    }

    /// Resolve a period whose caller gave up waiting.
    ///
    /// Waits for any in-flight mutation on the venture. COMPLETED if the
    /// period committed, otherwise FAILED with reason `timeout`, including a
    /// period that was still SCHEDULED.
    pub async fn mark_timed_out(&self, ctx: &OpContext, period_id: Uuid) -> Result<PeriodStatus, EngineError> {
        self.resolve_stale(ctx, period_id, "timeout").await
    }

    /// Resolve RUNNING periods left behind by a crash. Call once at startup.
    pub async fn recover_interrupted(&self, ctx: &OpContext) -> Result<Vec<RebalancingPeriod>, EngineError> {
        let stale = self.repo.running_periods(None).await?;
        let mut resolved = Vec::with_capacity(stale.len());
        for period in stale {
            self.resolve_stale(ctx, period.id, "interrupted").await?;
            if let Some(p) = self.repo.period(period.id).await? {
                resolved.push(p);
            }
        }
        if !resolved.is_empty() {
            info!(count = resolved.len(), "recovered interrupted rebalancing periods");
        }
        Ok(resolved)
    }

    async fn resolve_stale(&self, ctx: &OpContext, period_id: Uuid, reason: &str) -> Result<PeriodStatus, EngineError> {
        let period = self
            .repo
            .period(period_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                what: "rebalancing period",
                id: period_id.to_string(),
            })?;

        let guard = self.ledger.lock_venture(&period.venture_id).await;
        let Some(mut period) = self.repo.period(period_id).await? else {
            return Err(EngineError::NotFound {
                what: "rebalancing period",
                id: period_id.to_string(),
            });
        };
        // SCHEDULED means the caller gave up before the period began
        if !matches!(period.status, PeriodStatus::Running | PeriodStatus::Scheduled) {
            return Ok(period.status);
        }

        if self
            .repo
            .has_transactions_for(&period.venture_id, &period_id.to_string())
            .await?
        {
            period.status = PeriodStatus::Completed;
            period.finished_at = Some(ctx.now);
            self.repo.save_period(&period).await?;
            info!(
                venture_id = %period.venture_id,
                period_id = %period_id,
                "stale period had committed, marked completed"
            );
            return Ok(PeriodStatus::Completed);
        }

        let err = EngineError::Timeout {
            venture_id: period.venture_id.clone(),
            period_id: Some(period_id),
        };
        self.mark_failed(&guard, ctx, period, err.kind(), reason).await?;
        Ok(PeriodStatus::Failed)
    }

    async fn fail_period(
        &self,
        ctx: &OpContext,
        period: RebalancingPeriod,
        err: &EngineError,
    ) -> Result<RunOutcome, EngineError> {
        let guard = self.ledger.lock_venture(&period.venture_id).await;
        self.fail_period_locked(&guard, ctx, period, err).await
    }

    async fn fail_period_locked(
        &self,
        guard: &VentureGuard,
        ctx: &OpContext,
        period: RebalancingPeriod,
        err: &EngineError,
    ) -> Result<RunOutcome, EngineError> {
        let period_id = period.id;
        let reason = err.to_string();
        self.mark_failed(guard, ctx, period, err.kind(), &reason).await?;
        Ok(RunOutcome::Failed {
            period_id,
            kind: err.kind(),
            reason,
        })
    }

    async fn mark_failed(
        &self,
        _guard: &VentureGuard,
        ctx: &OpContext,
        mut period: RebalancingPeriod,
        kind: &'static str,
        reason: &str,
    ) -> Result<(), EngineError> {
        period.status = PeriodStatus::Failed;
        period.failure_reason = Some(reason.to_string());
        period.finished_at = Some(ctx.now);
        self.repo.save_period(&period).await?;

        warn!(
            venture_id = %period.venture_id,
            period_id = %period.id,
            kind,
            reason = %reason,
            "rebalancing period failed"
        );
        self.events.emit(
            ctx,
            DomainEvent::RebalancingFailed {
                venture_id: period.venture_id.clone(),
                period_id: period.id,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    async fn require_venture(&self, venture_id: &str) -> Result<crate::models::Venture, EngineError> {
        self.repo
            .venture(venture_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                what: "venture",
                id: venture_id.to_string(),
            })
    }
}

fn validate_window(venture_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), EngineError> {
    if end <= start {
        return Err(EngineError::validation_for(
            venture_id,
            format!("period end {} is not after start {}", end, start),
        ));
    }
    Ok(())
}

fn adjustment_records(period: &RebalancingPeriod, ctx: &OpContext, outcome: &BatchOutcome) -> Vec<Adjustment> {
    let applied = outcome.applied().map(|t| Adjustment {
        period_id: period.id,
        holder_id: t.holder_id.clone(),
        delta: t.delta(),
        applied_at: ctx.now,
        outcome: AdjustmentOutcome::Applied,
    });
    let skipped = outcome.skipped.iter().map(|s| Adjustment {
        period_id: period.id,
        holder_id: s.holder_id.clone(),
        delta: s.delta,
        applied_at: ctx.now,
        outcome: AdjustmentOutcome::SkippedBound,
    });
    applied.chain(skipped).collect()
}
