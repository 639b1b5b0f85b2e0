//! Shared fixtures for unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use crate::config::{EngineConfig, LedgerConfig};
use crate::context::OpContext;
use crate::conversion::ConversionWindowManager;
use crate::events::{EventSink, RecordingEventSink};
use crate::ledger::{to_pct, CapTableLedger, GenesisAllocation, Pct};
use crate::models::{Contribution, ContributionStatus, HolderType, TokenBalance, Venture};
use crate::rebalancing::RebalancingEngine;
use crate::repository::{InMemoryLedgerRepository, LedgerRepository};
use crate::scoring::ContributionScorer;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Quarter starting at `t0`.
pub fn quarter() -> (DateTime<Utc>, DateTime<Utc>) {
    (t0(), t0() + Duration::days(90))
}

pub fn venture(id: &str, owner_min: f64, alice_cap: f64, reserve: f64) -> Venture {
    Venture {
        id: id.to_string(),
        owner_id: "owner".to_string(),
        owner_min_pct: to_pct(owner_min),
        alice_cap_pct: to_pct(alice_cap),
        reserve_pct: to_pct(reserve),
        flagged_for_review: false,
        flag_reason: None,
        created_at: t0(),
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        ledger: LedgerConfig {
            backoff_base_ms: 1,
            ..LedgerConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    pub repo: Arc<InMemoryLedgerRepository>,
    pub events: Arc<RecordingEventSink>,
    pub ledger: CapTableLedger,
    pub engine: RebalancingEngine,
    pub windows: ConversionWindowManager,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(cfg: EngineConfig) -> Self {
        let repo = Arc::new(InMemoryLedgerRepository::new());
        let events = Arc::new(RecordingEventSink::new());
        let dyn_repo: Arc<dyn LedgerRepository> = repo.clone();
        let dyn_events: Arc<dyn EventSink> = events.clone();

        let ledger = CapTableLedger::new(dyn_repo.clone(), dyn_events.clone(), cfg.ledger.clone());
        let scorer = ContributionScorer::new(dyn_repo);
        let engine = RebalancingEngine::new(
            ledger.clone(),
            scorer,
            dyn_events.clone(),
            cfg.rebalancing.clone(),
        );
        let windows = ConversionWindowManager::new(ledger.clone(), dyn_events, cfg.conversion.clone());

        Self {
            repo,
            events,
            ledger,
            engine,
            windows,
        }
    }

    pub fn ctx(&self) -> OpContext {
        OpContext::new("test", t0())
    }

    /// Create a venture. The `owner` and `reserve` rows are typed from the id.
    pub async fn seed(&self, venture: Venture, holders: &[(&str, f64)]) {
        let genesis: Vec<GenesisAllocation> = holders
            .iter()
            .map(|(holder, pct)| GenesisAllocation {
                holder_id: holder.to_string(),
                holder_type: match *holder {
                    "owner" => HolderType::Owner,
                    "reserve" => HolderType::Reserve,
                    _ => HolderType::User,
                },
                pct: to_pct(*pct),
            })
            .collect();
        self.ledger
            .create_venture(&self.ctx(), venture, &genesis)
            .await
            .unwrap();
    }

    /// Approved contribution whose weight equals `weight`.
    pub async fn contribute(&self, venture_id: &str, id: &str, holder: &str, weight: f64, days: i64) {
        self.repo
            .insert_contribution(&Contribution {
                id: id.to_string(),
                contributor_id: holder.to_string(),
                venture_id: venture_id.to_string(),
                effort: weight,
                impact: 1.0,
                quality: 1.0,
                status: ContributionStatus::Approved,
                accepted_at: Some(t0() + Duration::days(days)),
            })
            .await
            .unwrap();
    }

    pub async fn balance(&self, venture_id: &str, holder: &str, balance: i64) {
        self.repo
            .upsert_token_balance(&TokenBalance {
                venture_id: venture_id.to_string(),
                holder_id: holder.to_string(),
                balance,
                as_of: t0(),
            })
            .await
            .unwrap();
    }

    pub async fn pct(&self, venture_id: &str, holder: &str) -> Pct {
        self.repo
            .read_state(venture_id)
            .await
            .unwrap()
            .state
            .pct_of(holder)
    }

    pub async fn total(&self, venture_id: &str) -> Pct {
        self.repo.read_state(venture_id).await.unwrap().state.total()
    }
}
