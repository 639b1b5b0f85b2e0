use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ledger::{Pct, HUNDRED_PCT};
use crate::scoring::rules::Rule;

pub type VentureId = String;
pub type HolderId = String;

/// Namespace for deterministic rebalancing period ids.
const PERIOD_NAMESPACE: Uuid = Uuid::from_u128(0x6c1d_4f0e_9a27_4b7a_8f35_2e0c_91d4_a7b3);

// =============================================================================
// VENTURE
// =============================================================================

/// Ledger bounds for one venture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venture {
    pub id: VentureId,
    pub owner_id: HolderId,
    /// Floor for the owner's stake.
    pub owner_min_pct: Pct,
    /// Ceiling for any single holder other than the owner and the reserve.
    pub alice_cap_pct: Pct,
    /// Reserve allocation at inception.
    pub reserve_pct: Pct,
    /// Set on invariant violation or failed reconciliation; blocks mutation.
    pub flagged_for_review: bool,
    pub flag_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CAP TABLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HolderType {
    Owner,
    User,
    AllocationPool,
    Reserve,
}

impl HolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolderType::Owner => "OWNER",
            HolderType::User => "USER",
            HolderType::AllocationPool => "ALLOCATION_POOL",
            HolderType::Reserve => "RESERVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OWNER" => Some(HolderType::Owner),
            "USER" => Some(HolderType::User),
            "ALLOCATION_POOL" => Some(HolderType::AllocationPool),
            "RESERVE" => Some(HolderType::Reserve),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapTableEntry {
    pub venture_id: VentureId,
    pub holder_id: HolderId,
    pub holder_type: HolderType,
    pub pct: Pct,
    /// What last set this row: `GENESIS` or a transaction kind.
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

/// Cap table keyed by holder. Ordered so every iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapTableState {
    pub venture_id: VentureId,
    pub entries: BTreeMap<HolderId, CapTableEntry>,
}

impl CapTableState {
    pub fn from_entries(venture_id: &str, entries: impl IntoIterator<Item = CapTableEntry>) -> Self {
        Self {
            venture_id: venture_id.to_string(),
            entries: entries
                .into_iter()
                .map(|e| (e.holder_id.clone(), e))
                .collect(),
        }
    }

    pub fn total(&self) -> Pct {
        self.entries.values().map(|e| e.pct).sum()
    }

    pub fn pct_of(&self, holder_id: &str) -> Pct {
        self.entries.get(holder_id).map(|e| e.pct).unwrap_or(0)
    }

    pub fn reserve(&self) -> Option<&CapTableEntry> {
        self.entries
            .values()
            .find(|e| e.holder_type == HolderType::Reserve)
    }

    /// Σ pct within `tolerance` of 100.00.
    pub fn is_balanced(&self, tolerance: Pct) -> bool {
        (self.total() - HUNDRED_PCT).abs() <= tolerance
    }

    pub fn into_entries(self) -> Vec<CapTableEntry> {
        self.entries.into_values().collect()
    }
}

/// Live state plus the optimistic-concurrency version it was read at.
#[derive(Debug, Clone)]
pub struct CapTableSnapshot {
    pub state: CapTableState,
    pub version: u64,
    pub last_seq: u64,
}

// =============================================================================
// CONTRIBUTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStatus::Pending => "PENDING",
            ContributionStatus::Approved => "APPROVED",
            ContributionStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ContributionStatus::Pending),
            "APPROVED" => Some(ContributionStatus::Approved),
            "REJECTED" => Some(ContributionStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub contributor_id: HolderId,
    pub venture_id: VentureId,
    pub effort: f64,
    pub impact: f64,
    pub quality: f64,
    pub status: ContributionStatus,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Contribution {
    pub fn weight(&self) -> f64 {
        self.effort * self.impact * self.quality
    }
}

// =============================================================================
// REBALANCING PERIODS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Scheduled => "SCHEDULED",
            PeriodStatus::Running => "RUNNING",
            PeriodStatus::Completed => "COMPLETED",
            PeriodStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(PeriodStatus::Scheduled),
            "RUNNING" => Some(PeriodStatus::Running),
            "COMPLETED" => Some(PeriodStatus::Completed),
            "FAILED" => Some(PeriodStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PeriodStatus::Completed | PeriodStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancingPeriod {
    pub id: Uuid,
    pub venture_id: VentureId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: PeriodStatus,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RebalancingPeriod {
    /// Same `(venture, start, end)` always maps to the same id.
    pub fn id_for(venture_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Uuid {
        let key = format!(
            "{}|{}|{}",
            venture_id,
            start.timestamp_micros(),
            end.timestamp_micros()
        );
        Uuid::new_v5(&PERIOD_NAMESPACE, key.as_bytes())
    }

    pub fn scheduled(venture_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: Self::id_for(venture_id, start, end),
            venture_id: venture_id.to_string(),
            period_start: start,
            period_end: end,
            status: PeriodStatus::Scheduled,
            failure_reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentOutcome {
    Applied,
    SkippedBound,
    SkippedTimeout,
}

impl AdjustmentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentOutcome::Applied => "APPLIED",
            AdjustmentOutcome::SkippedBound => "SKIPPED_BOUND",
            AdjustmentOutcome::SkippedTimeout => "SKIPPED_TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPLIED" => Some(AdjustmentOutcome::Applied),
            "SKIPPED_BOUND" => Some(AdjustmentOutcome::SkippedBound),
            "SKIPPED_TIMEOUT" => Some(AdjustmentOutcome::SkippedTimeout),
            _ => None,
        }
    }
}

/// Recorded result of one holder's rebalancing delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub period_id: Uuid,
    pub holder_id: HolderId,
    pub delta: Pct,
    pub applied_at: DateTime<Utc>,
    pub outcome: AdjustmentOutcome,
}

// =============================================================================
// CONVERSION WINDOWS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStatus {
    Scheduled,
    Open,
    Closed,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Scheduled => "SCHEDULED",
            WindowStatus::Open => "OPEN",
            WindowStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(WindowStatus::Scheduled),
            "OPEN" => Some(WindowStatus::Open),
            "CLOSED" => Some(WindowStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionWindow {
    pub id: Uuid,
    pub venture_id: VentureId,
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub equity_rate_bps: u32,
    pub status: WindowStatus,
    /// Holder eligibility; `None` admits every holder with a balance.
    pub eligibility: Option<Rule>,
}

impl ConversionWindow {
    pub fn new(
        venture_id: &str,
        opens_at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
        equity_rate_bps: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            venture_id: venture_id.to_string(),
            opens_at,
            closes_at,
            equity_rate_bps,
            status: WindowStatus::Scheduled,
            eligibility: None,
        }
    }

    pub fn with_eligibility(mut self, rule: Rule) -> Self {
        self.eligibility = Some(rule);
        self
    }

    /// Half-open intervals `[opens_at, closes_at)` intersect.
    pub fn overlaps(&self, other: &ConversionWindow) -> bool {
        self.venture_id == other.venture_id
            && self.opens_at < other.closes_at
            && other.opens_at < self.closes_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversionOutcome {
    Applied,
    SkippedInsufficientReserve,
    SkippedBound,
    SkippedIneligible,
}

impl ConversionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionOutcome::Applied => "APPLIED",
            ConversionOutcome::SkippedInsufficientReserve => "SKIPPED_INSUFFICIENT_RESERVE",
            ConversionOutcome::SkippedBound => "SKIPPED_BOUND",
            ConversionOutcome::SkippedIneligible => "SKIPPED_INELIGIBLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPLIED" => Some(ConversionOutcome::Applied),
            "SKIPPED_INSUFFICIENT_RESERVE" => Some(ConversionOutcome::SkippedInsufficientReserve),
            "SKIPPED_BOUND" => Some(ConversionOutcome::SkippedBound),
            "SKIPPED_INELIGIBLE" => Some(ConversionOutcome::SkippedIneligible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub window_id: Uuid,
    pub venture_id: VentureId,
    pub holder_id: HolderId,
    pub token_balance: i64,
    pub equity_delta: Pct,
    pub outcome: ConversionOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Utility-token balance as reported by the token system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub venture_id: VentureId,
    pub holder_id: HolderId,
    pub balance: i64,
    pub as_of: DateTime<Utc>,
}

// =============================================================================
// TRANSACTION LOG
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Rebalance,
    Conversion,
    Manual,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Rebalance => "REBALANCE",
            TransactionKind::Conversion => "CONVERSION",
            TransactionKind::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REBALANCE" => Some(TransactionKind::Rebalance),
            "CONVERSION" => Some(TransactionKind::Conversion),
            "MANUAL" => Some(TransactionKind::Manual),
            _ => None,
        }
    }
}

/// One holder change. Append-only; never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub venture_id: VentureId,
    /// Per-venture ordering, starting at 1.
    pub seq: u64,
    pub holder_id: HolderId,
    pub holder_type: HolderType,
    pub kind: TransactionKind,
    pub before_pct: Pct,
    pub after_pct: Pct,
    pub timestamp: DateTime<Utc>,
    /// Period id, window id, or manual reference.
    pub cause_ref: String,
}

impl LedgerTransaction {
    pub fn delta(&self) -> Pct {
        self.after_pct - self.before_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_id_is_deterministic() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let a = RebalancingPeriod::id_for("v1", start, end);
        let b = RebalancingPeriod::id_for("v1", start, end);
        let c = RebalancingPeriod::id_for("v2", start, end);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_window_overlap_is_half_open() {
        let t = |h| Utc.with_ymd_and_hms(2026, 1, 1, h, 0, 0).unwrap();
        let a = ConversionWindow::new("v1", t(0), t(2), 100);
        let b = ConversionWindow::new("v1", t(2), t(4), 100);
        let c = ConversionWindow::new("v1", t(1), t(3), 100);
        let d = ConversionWindow::new("v2", t(1), t(3), 100);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn test_status_strings_roundtrip() {
        for s in [PeriodStatus::Scheduled, PeriodStatus::Running, PeriodStatus::Completed, PeriodStatus::Failed] {
            assert_eq!(PeriodStatus::parse(s.as_str()), Some(s));
        }
        for h in [HolderType::Owner, HolderType::User, HolderType::AllocationPool, HolderType::Reserve] {
            assert_eq!(HolderType::parse(h.as_str()), Some(h));
        }
        assert_eq!(
            ConversionOutcome::parse("SKIPPED_INSUFFICIENT_RESERVE"),
            Some(ConversionOutcome::SkippedInsufficientReserve)
        );
    }
}
