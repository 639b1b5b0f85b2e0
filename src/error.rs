//! Error taxonomy.
//!
//! Per-holder failures (`BoundViolation`, `InsufficientReserve`) are normally
//! recovered inside a batch and surface as skip reasons; they appear here for
//! single-holder calls such as manual adjustments. Every variant carries the
//! venture/holder/period it concerns.

use uuid::Uuid;

use crate::ledger::{format_pct, Pct};
use crate::scoring::rules::RuleError;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("version conflict on venture {venture_id}: expected v{expected}, found v{actual}")]
    VersionConflict {
        venture_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{what} already exists: {id}")]
    AlreadyExists { what: &'static str, id: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Why a single holder's change was refused.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BoundReason {
    BelowZero { after: Pct },
    AboveHundred { after: Pct },
    OwnerFloor { after: Pct, floor: Pct },
    HolderCap { after: Pct, cap: Pct },
    /// The reserve only moves as the balancing side of a batch.
    ReserveTarget,
    ReserveExhausted { available: Pct, required: Pct },
}

impl std::fmt::Display for BoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BelowZero { after } => write!(f, "would go below zero ({})", format_pct(*after)),
            Self::AboveHundred { after } => {
                write!(f, "would exceed 100% ({})", format_pct(*after))
            }
            Self::OwnerFloor { after, floor } => write!(
                f,
                "owner floor {} breached ({})",
                format_pct(*floor),
                format_pct(*after)
            ),
            Self::HolderCap { after, cap } => write!(
                f,
                "holder cap {} breached ({})",
                format_pct(*cap),
                format_pct(*after)
            ),
            Self::ReserveTarget => write!(f, "reserve cannot be adjusted directly"),
            Self::ReserveExhausted {
                available,
                required,
            } => write!(
                f,
                "reserve exhausted (available {}, required {})",
                format_pct(*available),
                format_pct(*required)
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed{}: {reason}", venture_suffix(.venture_id))]
    Validation {
        venture_id: Option<String>,
        reason: String,
    },

    #[error(
        "invariant violation on venture {venture_id}: sum is {}, expected 100.0000",
        pct(.actual)
    )]
    InvariantViolation { venture_id: String, actual: Pct },

    #[error("bound violation on venture {venture_id}, holder {holder_id}: {reason}")]
    BoundViolation {
        venture_id: String,
        holder_id: String,
        reason: BoundReason,
    },

    #[error("concurrency conflict on venture {venture_id} after {attempts} attempts")]
    ConcurrencyConflict { venture_id: String, attempts: u32 },

    #[error(
        "insufficient reserve on venture {venture_id} for holder {holder_id}: required {}, available {}",
        pct(.required),
        pct(.available)
    )]
    InsufficientReserve {
        venture_id: String,
        holder_id: String,
        required: Pct,
        available: Pct,
    },

    #[error("venture {venture_id} exceeded its processing budget (period {period_id:?})")]
    Timeout {
        venture_id: String,
        period_id: Option<Uuid>,
    },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("venture {venture_id} already has period {running_period} RUNNING")]
    PeriodBusy {
        venture_id: String,
        running_period: Uuid,
    },

    #[error("venture {venture_id} is flagged for manual review")]
    VentureFlagged { venture_id: String },

    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("background task failed: {0}")]
    Task(String),
}

fn pct(value: &Pct) -> String {
    format_pct(*value)
}

fn venture_suffix(venture_id: &Option<String>) -> String {
    match venture_id {
        Some(id) => format!(" for venture {}", id),
        None => String::new(),
    }
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            venture_id: None,
            reason: reason.into(),
        }
    }

    pub fn validation_for(venture_id: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            venture_id: Some(venture_id.to_string()),
            reason: reason.into(),
        }
    }

    /// Stable short name used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::BoundViolation { .. } => "bound_violation",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::InsufficientReserve { .. } => "insufficient_reserve",
            Self::Timeout { .. } => "timeout",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::PeriodBusy { .. } => "period_busy",
            Self::VentureFlagged { .. } => "venture_flagged",
            Self::Rule(_) => "rule",
            Self::Repository(_) => "repository",
            Self::Task(_) => "task",
        }
    }

    /// Fatal for the venture: needs an operator before the venture mutates again.
    pub fn requires_manual_review(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = EngineError::InsufficientReserve {
            venture_id: "v1".into(),
            holder_id: "alice".into(),
            required: 30_000,
            available: 20_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("v1"));
        assert!(msg.contains("alice"));
        assert!(msg.contains("3.0000"));
        assert!(msg.contains("2.0000"));
        assert_eq!(err.kind(), "insufficient_reserve");
    }

    #[test]
    fn test_validation_message() {
        assert_eq!(
            EngineError::validation_for("v9", "effort is negative").to_string(),
            "validation failed for venture v9: effort is negative"
        );
        assert_eq!(
            EngineError::validation("bad window").to_string(),
            "validation failed: bad window"
        );
    }

    #[test]
    fn test_only_invariant_violation_requires_review() {
        assert!(EngineError::InvariantViolation {
            venture_id: "v".into(),
            actual: 0
        }
        .requires_manual_review());
        assert!(!EngineError::ConcurrencyConflict {
            venture_id: "v".into(),
            attempts: 4
        }
        .requires_manual_review());
    }
}
