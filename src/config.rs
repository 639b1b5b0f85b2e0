//! Engine configuration
//!
//! TOML file (path from `CAPTABLE_CONFIG_PATH`) with per-section defaults,
//! then a few environment overrides for deployment knobs.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::ledger::{to_pct, Pct};
use crate::scoring::rules::Rule;

/// Hard ceiling on a single holder's rebalancing delta, in percentage points.
pub const MAX_ADJUSTMENT_DELTA: f64 = 2.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub rebalancing: RebalancingConfig,

    #[serde(default)]
    pub conversion: ConversionConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Config file from `CAPTABLE_CONFIG_PATH` (or `captable.toml`), then env overrides.
    pub fn from_env() -> Self {
        let path =
            env::var("CAPTABLE_CONFIG_PATH").unwrap_or_else(|_| "captable.toml".to_string());

        let mut cfg = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        cfg.apply_env_overrides();
        cfg
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("CAPTABLE_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.db_path = path;
            }
        }

        self.batch.workers = env::var("CAPTABLE_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(self.batch.workers);
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch.workers >= 1, "batch.workers must be at least 1");
        anyhow::ensure!(
            self.batch.venture_timeout_ms > 0,
            "batch.venture_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.rebalancing.max_delta.is_finite()
                && self.rebalancing.max_delta > 0.0
                && self.rebalancing.max_delta <= MAX_ADJUSTMENT_DELTA,
            "rebalancing.max_delta must be in (0, {}]",
            MAX_ADJUSTMENT_DELTA
        );
        anyhow::ensure!(
            self.rebalancing.epsilon.is_finite() && self.rebalancing.epsilon >= 0.0,
            "rebalancing.epsilon must be non-negative"
        );
        anyhow::ensure!(
            self.ledger.sum_tolerance_pct.is_finite() && self.ledger.sum_tolerance_pct >= 0.0,
            "ledger.sum_tolerance_pct must be non-negative"
        );
        anyhow::ensure!(
            self.conversion.pct_per_equity_unit.is_finite()
                && to_pct(self.conversion.pct_per_equity_unit) > 0,
            "conversion.pct_per_equity_unit must be at least {}",
            1.0 / crate::ledger::PCT_SCALE as f64
        );
        if let Some(rule) = &self.scoring.contribution_rule {
            rule.require_metrics(&crate::scoring::CONTRIBUTION_METRICS, "scoring")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "captable.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Retries after the first optimistic-version conflict.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff; doubles per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Allowed |Σ pct − 100| in percentage points.
    #[serde(default = "default_sum_tolerance_pct")]
    pub sum_tolerance_pct: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    25
}
fn default_sum_tolerance_pct() -> f64 {
    0.01
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            sum_tolerance_pct: default_sum_tolerance_pct(),
        }
    }
}

impl LedgerConfig {
    pub fn sum_tolerance(&self) -> Pct {
        to_pct(self.sum_tolerance_pct)
    }

    /// Sleep before retry `attempt` (1-based): base × 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancingConfig {
    /// Per-holder clamp in percentage points.
    #[serde(default = "default_max_delta")]
    pub max_delta: f64,

    /// Deltas smaller than this are dropped (anti-churn).
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_max_delta() -> f64 {
    2.0
}
fn default_epsilon() -> f64 {
    0.1
}

impl Default for RebalancingConfig {
    fn default() -> Self {
        Self {
            max_delta: default_max_delta(),
            epsilon: default_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Percentage points granted per equity unit (balance × bps / 10000).
    #[serde(default = "default_pct_per_equity_unit")]
    pub pct_per_equity_unit: f64,
}

fn default_pct_per_equity_unit() -> f64 {
    0.01
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pct_per_equity_unit: default_pct_per_equity_unit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_venture_timeout_ms")]
    pub venture_timeout_ms: u64,

    /// Run the fold/reconcile oracle on each venture after it completes.
    #[serde(default = "default_true")]
    pub reconcile_after_run: bool,
}

fn default_workers() -> usize {
    4
}
fn default_venture_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            venture_timeout_ms: default_venture_timeout_ms(),
            reconcile_after_run: true,
        }
    }
}

impl BatchConfig {
    pub fn venture_timeout(&self) -> Duration {
        Duration::from_millis(self.venture_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Contributions failing this rule are not scored.
    #[serde(default)]
    pub contribution_rule: Option<Rule>,
}
