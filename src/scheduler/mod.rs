//! Scheduler
//!
//! Owns the clock and turns "now" into explicit [`OpContext`]s for the
//! engine, the window manager and the batch pool. Calendar policy (which
//! quarter to rebalance, how often to tick) stays with the caller.

pub mod batch;
pub mod clock;

pub use batch::{BatchReport, BatchRunner, VentureOutcome};
pub use clock::{Clock, FakeClock, SystemClock};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::context::OpContext;
use crate::conversion::{ConversionWindowManager, TickReport};
use crate::error::EngineError;
use crate::events::EventSink;
use crate::models::{RebalancingPeriod, VentureId};
use crate::rebalancing::RebalancingEngine;
use crate::repository::LedgerRepository;

#[cfg(test)]
mod scheduler_tests;

const ACTOR: &str = "scheduler";

#[derive(Clone)]
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    repo: Arc<dyn LedgerRepository>,
    engine: RebalancingEngine,
    windows: ConversionWindowManager,
    batch: BatchRunner,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        engine: RebalancingEngine,
        windows: ConversionWindowManager,
        events: Arc<dyn EventSink>,
        config: &EngineConfig,
    ) -> Self {
        let batch = BatchRunner::new(engine.clone(), events, clock.clone(), config.batch.clone());
        Self {
            repo: engine.ledger().repository().clone(),
            clock,
            engine,
            windows,
            batch,
        }
    }

    pub fn context(&self) -> OpContext {
        OpContext::new(ACTOR, self.clock.now())
    }

    /// Rebalance every venture for `[period_start, period_end)`.
    pub async fn run_rebalancing_batch(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchReport, EngineError> {
        let ventures: Vec<VentureId> = self
            .repo
            .list_ventures()
            .await?
            .into_iter()
            .map(|v| v.id)
            .collect();
        Ok(self
            .run_rebalancing_for(ventures, period_start, period_end, cancel)
            .await)
    }

    pub async fn run_rebalancing_for(
        &self,
        venture_ids: Vec<VentureId>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> BatchReport {
        let ctx = self.context();
        self.batch
            .run(&ctx, venture_ids, period_start, period_end, cancel)
            .await
    }

    pub async fn tick_windows(&self) -> Result<TickReport, EngineError> {
        self.windows.tick(&self.context()).await
    }

    /// Resolve periods left RUNNING by a previous process.
    pub async fn recover(&self) -> Result<Vec<RebalancingPeriod>, EngineError> {
        self.engine.recover_interrupted(&self.context()).await
    }

    /// Tick windows every `interval` until `cancel` turns true.
    pub async fn run_daemon(
        &self,
        interval: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        self.recover().await?;
        info!(interval_secs = interval.as_secs(), "window daemon started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_windows().await {
                        error!(error = %e, "window tick failed");
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("window daemon stopped");
        Ok(())
    }
}
