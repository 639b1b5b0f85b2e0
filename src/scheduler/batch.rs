//! Bounded worker pool for a rebalancing batch.
//!
//! One venture per worker, end to end. A failing or slow venture never takes
//! the batch down with it. Cancellation is checked before each venture starts;
//! a venture already running always finishes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::audit::TransactionAuditor;
use crate::config::BatchConfig;
use crate::context::OpContext;
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::models::{PeriodStatus, RebalancingPeriod, VentureId};
use crate::rebalancing::{RebalancingEngine, RunOutcome};

use super::clock::Clock;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VentureOutcome {
    Completed { applied: usize, skipped: usize },
    AlreadyCompleted,
    Failed { kind: String, message: String },
    /// Budget exceeded. `committed` is true when the commit had already landed.
    TimedOut { committed: bool },
    /// Never started because the batch was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<VentureId, VentureOutcome>,
    /// Ventures whose post-run reconciliation disagreed with the log.
    pub reconciliation_mismatches: Vec<VentureId>,
}

impl BatchReport {
    pub fn count(&self, pred: impl Fn(&VentureOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, VentureOutcome::Completed { .. } | VentureOutcome::AlreadyCompleted))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, VentureOutcome::Failed { .. } | VentureOutcome::TimedOut { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, VentureOutcome::Cancelled))
    }
}

#[derive(Clone)]
pub struct BatchRunner {
    engine: RebalancingEngine,
    auditor: TransactionAuditor,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(
        engine: RebalancingEngine,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: BatchConfig,
    ) -> Self {
        let auditor = engine.ledger().auditor().clone();
        Self {
            engine,
            auditor,
            events,
            clock,
            config,
        }
    }

    pub async fn run(
        &self,
        ctx: &OpContext,
        venture_ids: Vec<VentureId>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> BatchReport {
        let started_at = ctx.now;
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut outcomes = BTreeMap::new();
        let mut handles = Vec::with_capacity(venture_ids.len());

        info!(
            ventures = venture_ids.len(),
            workers = self.config.workers,
            period_start = %period_start,
            period_end = %period_end,
            "rebalancing batch started"
        );

        let mut pending = venture_ids.into_iter();
        while let Some(venture_id) = pending.next() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "worker pool closed");
                    outcomes.insert(
                        venture_id,
                        VentureOutcome::Failed {
                            kind: "task".to_string(),
                            message: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            if *cancel.borrow() {
                warn!("batch cancelled, remaining ventures not started");
                outcomes.insert(venture_id, VentureOutcome::Cancelled);
                outcomes.extend(pending.by_ref().map(|v| (v, VentureOutcome::Cancelled)));
                break;
            }

            let runner = self.clone();
            let ctx = ctx.clone();
            let id = venture_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                runner.run_one(&ctx, &id, period_start, period_end).await
            });
            handles.push((venture_id, handle));
        }

        let mut mismatches = Vec::new();
        for (venture_id, handle) in handles {
            match handle.await {
                Ok((outcome, mismatch)) => {
                    if mismatch {
                        mismatches.push(venture_id.clone());
                    }
                    outcomes.insert(venture_id, outcome);
                }
                Err(e) => {
                    error!(venture_id = %venture_id, error = %e, "venture worker panicked");
                    outcomes.insert(
                        venture_id,
                        VentureOutcome::Failed {
                            kind: "task".to_string(),
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        let report = BatchReport {
            started_at,
            finished_at: self.clock.now().max(started_at),
            outcomes,
            reconciliation_mismatches: mismatches,
        };
        info!(
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            mismatches = report.reconciliation_mismatches.len(),
            "rebalancing batch finished"
        );
        report
    }

    async fn run_one(
        &self,
        ctx: &OpContext,
        venture_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> (VentureOutcome, bool) {
        let budget = self.config.venture_timeout();
        let period_id = RebalancingPeriod::id_for(venture_id, period_start, period_end);

        let outcome = match tokio::time::timeout(
            budget,
            self.engine.run(ctx, venture_id, period_start, period_end),
        )
        .await
        {
            Ok(Ok(RunOutcome::Completed { applied, skipped, .. })) => {
                VentureOutcome::Completed { applied, skipped }
            }
            Ok(Ok(RunOutcome::AlreadyCompleted { .. })) => VentureOutcome::AlreadyCompleted,
            Ok(Ok(RunOutcome::Failed { kind, reason, .. })) => VentureOutcome::Failed {
                kind: kind.to_string(),
                message: reason,
            },
            Ok(Err(e)) => {
                warn!(venture_id = %venture_id, kind = e.kind(), error = %e, "venture not processed");
                self.events.emit(
                    ctx,
                    DomainEvent::RebalancingFailed {
                        venture_id: venture_id.to_string(),
                        period_id,
                        reason: e.to_string(),
                    },
                );
                VentureOutcome::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    venture_id = %venture_id,
                    period_id = %period_id,
                    budget_ms = budget.as_millis() as u64,
                    "venture exceeded its budget"
                );
                match self.engine.mark_timed_out(ctx, period_id).await {
                    Ok(status) => VentureOutcome::TimedOut {
                        committed: status == PeriodStatus::Completed,
                    },
                    // never began; nothing to resolve
                    Err(EngineError::NotFound { .. }) => {
                        VentureOutcome::TimedOut { committed: false }
                    }
                    Err(e) => {
                        error!(venture_id = %venture_id, error = %e, "failed to resolve timed out period");
                        VentureOutcome::Failed {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        }
                    }
                }
            }
        };

        let mismatch = if self.config.reconcile_after_run
            && matches!(outcome, VentureOutcome::Completed { .. })
        {
            match self.auditor.reconcile(ctx, venture_id).await {
                Ok(report) => !report.is_consistent(),
                Err(e) => {
                    error!(venture_id = %venture_id, error = %e, "post-run reconciliation failed");
                    false
                }
            }
        } else {
            false
        };

        (outcome, mismatch)
    }
}
