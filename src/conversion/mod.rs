//! Conversion Window Manager
//!
//! Time-boxed windows that turn accrued utility-token balances into equity
//! funded from the venture reserve.
//!
//! ```text
//! SCHEDULED ──open──▶ OPEN ──close──▶ CLOSED
//! ```
//!
//! Opening applies every eligible holder's conversion in one ledger batch,
//! in ascending holder order, under the venture lock. A holder the reserve can
//! no longer fund is skipped; the rest of the window proceeds.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConversionConfig;
use crate::context::OpContext;
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::ledger::{from_pct, to_pct, CapTableLedger, Cause, HolderDelta, Pct, BPS_DENOMINATOR};
use crate::models::{
    ConversionOutcome, ConversionRecord, ConversionWindow, HolderId, HolderType, TokenBalance,
    WindowStatus,
};
use crate::repository::LedgerRepository;
use crate::scoring::rules::{Metric, MetricSet};


/// Metrics a window eligibility rule may read.
pub const WINDOW_METRICS: [Metric; 1] = [Metric::TokenBalance];

/// Equity for a balance: `balance × bps / 10000` equity units, scaled to
/// fixed-point percentage by `pct_per_unit`.
pub fn equity_for(balance: i64, equity_rate_bps: u32, pct_per_unit: Pct) -> Pct {
    let raw = balance as i128 * equity_rate_bps as i128 * pct_per_unit as i128 / BPS_DENOMINATOR;
    raw.clamp(0, Pct::MAX as i128) as Pct
}

/// What one `tick` did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub opened: Vec<Uuid>,
    pub closed: Vec<Uuid>,
    /// Windows left SCHEDULED because opening failed; retried next tick.
    pub failed: Vec<(Uuid, String)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct ConversionWindowManager {
    repo: Arc<dyn LedgerRepository>,
    ledger: CapTableLedger,
    events: Arc<dyn EventSink>,
    config: ConversionConfig,
}

impl ConversionWindowManager {
    pub fn new(ledger: CapTableLedger, events: Arc<dyn EventSink>, config: ConversionConfig) -> Self {
        Self {
            repo: ledger.repository().clone(),
            ledger,
            events,
            config,
        }
    }

    fn pct_per_unit(&self) -> Pct {
        to_pct(self.config.pct_per_equity_unit)
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    pub async fn schedule_window(
        &self,
        ctx: &OpContext,
        window: ConversionWindow,
    ) -> Result<ConversionWindow, EngineError> {
        let venture_id = window.venture_id.clone();
        if window.closes_at <= window.opens_at {
            return Err(EngineError::validation_for(
                &venture_id,
                format!(
                    "window closes at {} which is not after it opens at {}",
                    window.closes_at, window.opens_at
                ),
            ));
        }
        if window.equity_rate_bps == 0 {
            return Err(EngineError::validation_for(&venture_id, "equity_rate_bps must be positive"));
        }
        if window.status != WindowStatus::Scheduled {
            return Err(EngineError::validation_for(
                &venture_id,
                format!("new window must be SCHEDULED, got {}", window.status.as_str()),
            ));
        }
        if let Some(rule) = &window.eligibility {
            rule.require_metrics(&WINDOW_METRICS, "conversion")?;
        }
        if self.repo.venture(&venture_id).await?.is_none() {
            return Err(EngineError::NotFound {
                what: "venture",
                id: venture_id,
            });
        }

        for existing in self.repo.windows(Some(venture_id.as_str())).await? {
            if existing.id == window.id {
                return Err(EngineError::validation_for(
                    &venture_id,
                    format!("window {} already exists", window.id),
                ));
            }
            if existing.overlaps(&window) {
                return Err(EngineError::validation_for(
                    &venture_id,
                    format!("window overlaps {} ({} .. {})", existing.id, existing.opens_at, existing.closes_at),
                ));
            }
        }

        self.repo.save_window(&window).await?;
        info!(
            venture_id = %venture_id,
            window_id = %window.id,
            opens_at = %window.opens_at,
            closes_at = %window.closes_at,
            equity_rate_bps = window.equity_rate_bps,
            actor = %ctx.actor,
            "conversion window scheduled"
        );
        Ok(window)
    }

    // =========================================================================
    // OPEN / CLOSE
    // =========================================================================

    /// Apply conversions and move the window to OPEN.
    pub async fn open(&self, ctx: &OpContext, window_id: Uuid) -> Result<Vec<ConversionRecord>, EngineError> {
        let window = self.load(window_id).await?;
        let guard = self.ledger.lock_venture(&window.venture_id).await;

        // re-read under the lock
        let mut window = self.load(window_id).await?;
        if window.status != WindowStatus::Scheduled {
            return Err(transition_error(&window, WindowStatus::Open));
        }
        let venture_id = window.venture_id.clone();
        let cause_ref = window_id.to_string();

        if self.repo.has_transactions_for(&venture_id, &cause_ref).await? {
            // Conversions committed before a crash; finish the transition only.
            let mut records = self.repo.conversion_records(window_id).await?;
            if records.is_empty() {
                let balances = self.balances_by_holder(&venture_id).await?;
                records = self
                    .repo
                    .transactions_for(&venture_id, &cause_ref)
                    .await?
                    .into_iter()
                    .filter(|t| t.holder_type != HolderType::Reserve)
                    .map(|t| ConversionRecord {
                        window_id,
                        venture_id: venture_id.clone(),
                        token_balance: balances.get(&t.holder_id).map(|b| b.balance).unwrap_or(0),
                        holder_id: t.holder_id.clone(),
                        equity_delta: t.delta(),
                        outcome: ConversionOutcome::Applied,
                        recorded_at: ctx.now,
                    })
                    .collect();
                self.repo.record_conversions(&records).await?;
            }
            window.status = WindowStatus::Open;
            self.repo.save_window(&window).await?;
            drop(guard);
            warn!(
                venture_id = %venture_id,
                window_id = %window_id,
                "window conversions already committed, not reapplying"
            );
            self.emit_opened(ctx, &window, &records);
            return Ok(records);
        }

        let pct_per_unit = self.pct_per_unit();
        let mut records: BTreeMap<HolderId, ConversionRecord> = BTreeMap::new();
        let mut grants = Vec::new();
        let mut balances: BTreeMap<HolderId, i64> = BTreeMap::new();
        let mut ineligible = Vec::new();

        for balance in self.repo.token_balances(&venture_id).await? {
            if balance.balance <= 0 {
                continue;
            }
            let equity = equity_for(balance.balance, window.equity_rate_bps, pct_per_unit);
            if equity == 0 {
                debug!(
                    venture_id = %venture_id,
                    holder_id = %balance.holder_id,
                    balance = balance.balance,
                    "balance too small to convert"
                );
                continue;
            }
            balances.insert(balance.holder_id.clone(), balance.balance);

            if let Some(rule) = &window.eligibility {
                let metrics = MetricSet::new().with(Metric::TokenBalance, balance.balance as f64);
                if !rule.evaluate(&metrics)? {
                    ineligible.push((balance.holder_id.clone(), equity));
                    records.insert(
                        balance.holder_id.clone(),
                        record(&window, ctx, &balance.holder_id, balance.balance, equity, ConversionOutcome::SkippedIneligible),
                    );
                    continue;
                }
            }
            grants.push(HolderDelta::new(balance.holder_id, equity));
        }

        if !grants.is_empty() {
            let outcome = self
                .ledger
                .apply_locked(&guard, ctx, Cause::Conversion { window_id }, &grants)
                .await?;

            for txn in outcome.applied() {
                let balance = balances.get(&txn.holder_id).copied().unwrap_or(0);
                records.insert(
                    txn.holder_id.clone(),
                    record(&window, ctx, &txn.holder_id, balance, txn.delta(), ConversionOutcome::Applied),
                );
            }
            for skip in &outcome.skipped {
                let outcome = if skip.is_reserve_shortfall() {
                    ConversionOutcome::SkippedInsufficientReserve
                } else {
                    ConversionOutcome::SkippedBound
                };
                let balance = balances.get(&skip.holder_id).copied().unwrap_or(0);
                records.insert(
                    skip.holder_id.clone(),
                    record(&window, ctx, &skip.holder_id, balance, skip.delta, outcome),
                );
            }
        }

        let records: Vec<ConversionRecord> = records.into_values().collect();
        self.repo.record_conversions(&records).await?;
        window.status = WindowStatus::Open;
        self.repo.save_window(&window).await?;
        drop(guard);

        for (holder_id, equity) in ineligible {
            self.events.emit(
                ctx,
                DomainEvent::ConversionSkipped {
                    venture_id: venture_id.clone(),
                    window_id,
                    holder_id,
                    equity_delta: from_pct(equity),
                    reason: "ineligible".to_string(),
                },
            );
        }
        self.emit_opened(ctx, &window, &records);
        Ok(records)
    }

    /// Move an OPEN window to CLOSED. Closing a CLOSED window is a no-op.
    pub async fn close(&self, ctx: &OpContext, window_id: Uuid) -> Result<(), EngineError> {
        let window = self.load(window_id).await?;
        let _guard = self.ledger.lock_venture(&window.venture_id).await;

        let mut window = self.load(window_id).await?;
        match window.status {
            WindowStatus::Closed => return Ok(()),
            WindowStatus::Scheduled => return Err(transition_error(&window, WindowStatus::Closed)),
            WindowStatus::Open => {}
        }

        window.status = WindowStatus::Closed;
        self.repo.save_window(&window).await?;
        info!(venture_id = %window.venture_id, window_id = %window_id, "conversion window closed");
        self.events.emit(
            ctx,
            DomainEvent::WindowClosed {
                venture_id: window.venture_id.clone(),
                window_id,
            },
        );
        Ok(())
    }

    /// Open every due SCHEDULED window and close every due OPEN window as of `ctx.now`.
    pub async fn tick(&self, ctx: &OpContext) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();

        for window in self.repo.windows(None).await? {
            let mut status = window.status;

            if status == WindowStatus::Scheduled && window.opens_at <= ctx.now {
                match self.open(ctx, window.id).await {
                    Ok(_) => {
                        report.opened.push(window.id);
                        status = WindowStatus::Open;
                    }
                    Err(e) => {
                        warn!(
                            venture_id = %window.venture_id,
                            window_id = %window.id,
                            error = %e,
                            "failed to open conversion window"
                        );
                        report.failed.push((window.id, e.to_string()));
                        continue;
                    }
                }
            }

            if status == WindowStatus::Open && window.closes_at <= ctx.now {
                match self.close(ctx, window.id).await {
                    Ok(()) => report.closed.push(window.id),
                    Err(e) => {
                        warn!(
                            venture_id = %window.venture_id,
                            window_id = %window.id,
                            error = %e,
                            "failed to close conversion window"
                        );
                        report.failed.push((window.id, e.to_string()));
                    }
                }
            }
        }

        if !report.is_empty() {
            info!(
                opened = report.opened.len(),
                closed = report.closed.len(),
                failed = report.failed.len(),
                "window tick"
            );
        }
        Ok(report)
    }

    pub async fn window(&self, window_id: Uuid) -> Result<ConversionWindow, EngineError> {
        self.load(window_id).await
    }

    async fn load(&self, window_id: Uuid) -> Result<ConversionWindow, EngineError> {
        self.repo
            .window(window_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                what: "conversion window",
                id: window_id.to_string(),
            })
    }

    async fn balances_by_holder(&self, venture_id: &str) -> Result<BTreeMap<HolderId, TokenBalance>, EngineError> {
        Ok(self
            .repo
            .token_balances(venture_id)
            .await?
            .into_iter()
            .map(|b| (b.holder_id.clone(), b))
            .collect())
    }

    fn emit_opened(&self, ctx: &OpContext, window: &ConversionWindow, records: &[ConversionRecord]) {
        let applied = records
            .iter()
            .filter(|r| r.outcome == ConversionOutcome::Applied)
            .count();
        let skipped = records.len() - applied;
        info!(
            venture_id = %window.venture_id,
            window_id = %window.id,
            applied,
            skipped,
            "conversion window opened"
        );
        self.events.emit(
            ctx,
            DomainEvent::WindowOpened {
                venture_id: window.venture_id.clone(),
                window_id: window.id,
                applied,
                skipped,
            },
        );
    }
}

fn record(
    window: &ConversionWindow,
    ctx: &OpContext,
    holder_id: &str,
    token_balance: i64,
    equity_delta: Pct,
    outcome: ConversionOutcome,
) -> ConversionRecord {
    ConversionRecord {
        window_id: window.id,
        venture_id: window.venture_id.clone(),
        holder_id: holder_id.to_string(),
        token_balance,
        equity_delta,
        outcome,
        recorded_at: ctx.now,
    }
}

fn transition_error(window: &ConversionWindow, to: WindowStatus) -> EngineError {
    EngineError::InvalidTransition {
        entity: "conversion window",
        id: window.id.to_string(),
        from: window.status.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}
