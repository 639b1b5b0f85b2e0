//! Eligibility rules.
//!
//! Rule payloads arrive as JSON (operator input) or TOML (config) and are
//! decoded once into [`Rule`]. Anything that does not decode, or names a
//! metric the caller cannot supply, is rejected before evaluation starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Nesting limit for decoded rules.
pub const MAX_RULE_DEPTH: usize = 16;

/// Tolerance for `eq` comparisons on f64 metrics.
const EQ_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("malformed rule: {0}")]
    Malformed(String),

    #[error("threshold for {metric} is not a finite number")]
    NonFiniteThreshold { metric: Metric },

    #[error("metric {metric} is not available to {context} rules")]
    UnsupportedMetric { metric: Metric, context: &'static str },

    #[error("metric {metric} has no value")]
    MissingMetric { metric: Metric },

    #[error("rule nesting exceeds {max} levels")]
    TooDeep { max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Effort,
    Impact,
    Quality,
    /// effort × impact × quality of the contribution under test
    Score,
    TokenBalance,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Effort => "effort",
            Metric::Impact => "impact",
            Metric::Quality => "quality",
            Metric::Score => "score",
            Metric::TokenBalance => "token_balance",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl CompareOp {
    fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => (lhs - rhs).abs() <= EQ_TOLERANCE,
        }
    }
}

/// Closed rule language.
///
/// ```json
/// {"type": "all", "all": [
///     {"type": "threshold", "metric": "quality", "op": "gte", "value": 0.5},
///     {"type": "not", "not": {"type": "threshold", "metric": "effort", "op": "eq", "value": 0}}
/// ]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Rule {
    Threshold {
        metric: Metric,
        op: CompareOp,
        value: f64,
    },
    /// Empty list is true.
    All { all: Vec<Rule> },
    /// Empty list is false.
    Any { any: Vec<Rule> },
    Not { not: Box<Rule> },
    Always,
}

/// Metric values available to one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet {
    values: BTreeMap<Metric, f64>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.values.insert(metric, value);
        self
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied()
    }
}

impl Rule {
    /// Decode an operator-supplied JSON payload.
    pub fn from_json(payload: &str) -> Result<Self, RuleError> {
        let rule: Rule =
            serde_json::from_str(payload).map_err(|e| RuleError::Malformed(e.to_string()))?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, RuleError> {
        let rule: Rule =
            serde_json::from_value(value).map_err(|e| RuleError::Malformed(e.to_string()))?;
        rule.validate()?;
        Ok(rule)
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<(), RuleError> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<(), RuleError> {
        if depth > MAX_RULE_DEPTH {
            return Err(RuleError::TooDeep {
                max: MAX_RULE_DEPTH,
            });
        }
        match self {
            Rule::Threshold { metric, value, .. } => {
                if !value.is_finite() {
                    return Err(RuleError::NonFiniteThreshold { metric: *metric });
                }
                Ok(())
            }
            Rule::All { all: rules } | Rule::Any { any: rules } => {
                rules.iter().try_for_each(|r| r.validate_at(depth + 1))
            }
            Rule::Not { not } => not.validate_at(depth + 1),
            Rule::Always => Ok(()),
        }
    }

    /// Every metric the rule reads, deduplicated.
    pub fn metrics(&self) -> Vec<Metric> {
        let mut out = Vec::new();
        self.collect_metrics(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_metrics(&self, out: &mut Vec<Metric>) {
        match self {
            Rule::Threshold { metric, .. } => out.push(*metric),
            Rule::All { all: rules } | Rule::Any { any: rules } => {
                rules.iter().for_each(|r| r.collect_metrics(out))
            }
            Rule::Not { not } => not.collect_metrics(out),
            Rule::Always => {}
        }
    }

    /// Reject rules that read metrics the evaluating context never supplies.
    pub fn require_metrics(&self, allowed: &[Metric], context: &'static str) -> Result<(), RuleError> {
        self.validate()?;
        match self.metrics().into_iter().find(|m| !allowed.contains(m)) {
            Some(metric) => Err(RuleError::UnsupportedMetric { metric, context }),
            None => Ok(()),
        }
    }

    pub fn evaluate(&self, metrics: &MetricSet) -> Result<bool, RuleError> {
        match self {
            Rule::Threshold { metric, op, value } => {
                let actual = metrics
                    .get(*metric)
                    .ok_or(RuleError::MissingMetric { metric: *metric })?;
                Ok(op.holds(actual, *value))
            }
            Rule::All { all } => {
                for rule in all {
                    if !rule.evaluate(metrics)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Rule::Any { any } => {
                for rule in any {
                    if rule.evaluate(metrics)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Rule::Not { not } => Ok(!not.evaluate(metrics)?),
            Rule::Always => Ok(true),
        }
    }
}
