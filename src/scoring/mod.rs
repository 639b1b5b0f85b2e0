//! Contribution scoring.
//!
//! score(holder) = Σ effort × impact × quality over APPROVED contributions
//! accepted inside `[period_start, period_end)`. Read-only; safe to run for
//! many ventures at once.

pub mod rules;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::EngineError;
use crate::models::{Contribution, ContributionStatus, HolderId};
use crate::repository::LedgerRepository;
use rules::{Metric, MetricSet, Rule};

/// Metrics a contribution filter may read.
pub const CONTRIBUTION_METRICS: [Metric; 4] =
    [Metric::Effort, Metric::Impact, Metric::Quality, Metric::Score];

#[derive(Clone)]
pub struct ContributionScorer {
    repo: Arc<dyn LedgerRepository>,
    filter: Option<Rule>,
}

impl ContributionScorer {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo, filter: None }
    }

    /// Only contributions passing `rule` count toward the score.
    pub fn with_filter(mut self, rule: Rule) -> Result<Self, EngineError> {
        rule.require_metrics(&CONTRIBUTION_METRICS, "scoring")?;
        self.filter = Some(rule);
        Ok(self)
    }

    pub async fn compute_scores(
        &self,
        venture_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<BTreeMap<HolderId, f64>, EngineError> {
        if period_end <= period_start {
            return Err(EngineError::validation_for(
                venture_id,
                format!("period end {} is not after start {}", period_end, period_start),
            ));
        }

        let contributions = self
            .repo
            .approved_contributions(venture_id, period_start, period_end)
            .await?;

        let scores = score_contributions(
            venture_id,
            period_start,
            period_end,
            &contributions,
            self.filter.as_ref(),
        )?;

        debug!(
            venture_id = %venture_id,
            contributions = contributions.len(),
            holders = scores.len(),
            "computed contribution scores"
        );
        Ok(scores)
    }
}

/// Pure scoring over an already-fetched contribution list.
///
/// Rows for other ventures, non-APPROVED rows and rows accepted outside the
/// window are ignored even if the caller passes them in.
pub fn score_contributions(
    venture_id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    contributions: &[Contribution],
    filter: Option<&Rule>,
) -> Result<BTreeMap<HolderId, f64>, EngineError> {
    let mut scores: BTreeMap<HolderId, f64> = BTreeMap::new();

    for c in contributions {
        if c.venture_id != venture_id || c.status != ContributionStatus::Approved {
            continue;
        }
        let Some(accepted_at) = c.accepted_at else {
            continue;
        };
        if accepted_at < period_start || accepted_at >= period_end {
            continue;
        }

        validate_factors(venture_id, c)?;

        if let Some(rule) = filter {
            let metrics = MetricSet::new()
                .with(Metric::Effort, c.effort)
                .with(Metric::Impact, c.impact)
                .with(Metric::Quality, c.quality)
                .with(Metric::Score, c.weight());
            if !rule.evaluate(&metrics)? {
                continue;
            }
        }

        *scores.entry(c.contributor_id.clone()).or_insert(0.0) += c.weight();
    }

    Ok(scores)
}

fn validate_factors(venture_id: &str, c: &Contribution) -> Result<(), EngineError> {
    for (name, value) in [("effort", c.effort), ("impact", c.impact), ("quality", c.quality)] {
        if !value.is_finite() {
            return Err(EngineError::validation_for(
                venture_id,
                format!("contribution {} has non-finite {}", c.id, name),
            ));
        }
        if value < 0.0 {
            return Err(EngineError::validation_for(
                venture_id,
                format!("contribution {} has negative {} ({})", c.id, name, value),
            ));
        }
    }
    Ok(())
}
