//! Pure batch planning.
//!
//! Given the venture bounds and a cap-table snapshot, decides per holder
//! whether a delta is applied or skipped, and how much the reserve moves to
//! keep the sum fixed. No I/O; the ledger commits whatever this returns.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::pct::{format_pct, Pct, HUNDRED_PCT};
use crate::error::{BoundReason, EngineError};
use crate::models::{CapTableEntry, CapTableState, HolderId, HolderType, Venture};

/// One requested change.
#[derive(Debug, Clone, PartialEq)]
pub struct HolderDelta {
    pub holder_id: HolderId,
    pub delta: Pct,
}

impl HolderDelta {
    pub fn new(holder_id: impl Into<HolderId>, delta: Pct) -> Self {
        Self {
            holder_id: holder_id.into(),
            delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub holder_id: HolderId,
    pub holder_type: HolderType,
    pub before: Pct,
    pub after: Pct,
}

impl PlannedChange {
    pub fn delta(&self) -> Pct {
        self.after - self.before
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedChange {
    pub holder_id: HolderId,
    pub delta: Pct,
    pub reason: BoundReason,
}

impl SkippedChange {
    /// Reserve ran out before this holder was funded.
    pub fn is_reserve_shortfall(&self) -> bool {
        matches!(self.reason, BoundReason::ReserveExhausted { .. })
    }

    pub fn to_error(&self, venture_id: &str) -> EngineError {
        match &self.reason {
            BoundReason::ReserveExhausted {
                available,
                required,
            } => EngineError::InsufficientReserve {
                venture_id: venture_id.to_string(),
                holder_id: self.holder_id.clone(),
                required: *required,
                available: *available,
            },
            reason => EngineError::BoundViolation {
                venture_id: venture_id.to_string(),
                holder_id: self.holder_id.clone(),
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Holder changes in planning order.
    pub changes: Vec<PlannedChange>,
    /// Balancing move on the reserve, if the applied net is nonzero.
    pub reserve_change: Option<PlannedChange>,
    pub skipped: Vec<SkippedChange>,
    /// State after every planned change.
    pub resulting: CapTableState,
}

impl BatchPlan {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && self.reserve_change.is_none()
    }
}

/// Plan a batch against `state`.
///
/// Reductions are planned before increases, each group in input order, so
/// percentage freed in this batch can fund growth in the same batch. A new
/// holder id gets a USER row.
pub fn plan_batch(
    venture: &Venture,
    state: &CapTableState,
    items: &[HolderDelta],
    tolerance: Pct,
    now: DateTime<Utc>,
) -> Result<BatchPlan, EngineError> {
    let mut seen = BTreeSet::new();
    for item in items {
        if !seen.insert(item.holder_id.as_str()) {
            return Err(EngineError::validation_for(
                &venture.id,
                format!("holder {} appears twice in one batch", item.holder_id),
            ));
        }
    }

    let reserve = state.reserve().cloned().ok_or_else(|| {
        EngineError::validation_for(&venture.id, "cap table has no RESERVE holder")
    })?;

    let mut working = state.clone();
    let mut reserve_pct = reserve.pct;
    let mut changes = Vec::new();
    let mut skipped = Vec::new();

    let ordered = items
        .iter()
        .filter(|i| i.delta < 0)
        .chain(items.iter().filter(|i| i.delta > 0));

    for item in ordered {
        let existing = working.entries.get(&item.holder_id);
        let holder_type = existing.map(|e| e.holder_type).unwrap_or(HolderType::User);
        let before = existing.map(|e| e.pct).unwrap_or(0);
        let after = before + item.delta;

        if let Some(reason) =
            check_bounds(venture, &item.holder_id, holder_type, after, item.delta, reserve_pct)
        {
            skipped.push(SkippedChange {
                holder_id: item.holder_id.clone(),
                delta: item.delta,
                reason,
            });
            continue;
        }

        reserve_pct -= item.delta;
        upsert(&mut working, &item.holder_id, holder_type, after, now);
        changes.push(PlannedChange {
            holder_id: item.holder_id.clone(),
            holder_type,
            before,
            after,
        });
    }

    let reserve_change = if reserve_pct != reserve.pct {
        upsert(&mut working, &reserve.holder_id, HolderType::Reserve, reserve_pct, now);
        Some(PlannedChange {
            holder_id: reserve.holder_id.clone(),
            holder_type: HolderType::Reserve,
            before: reserve.pct,
            after: reserve_pct,
        })
    } else {
        None
    };

    if !working.is_balanced(tolerance) {
        return Err(EngineError::InvariantViolation {
            venture_id: venture.id.clone(),
            actual: working.total(),
        });
    }

    Ok(BatchPlan {
        changes,
        reserve_change,
        skipped,
        resulting: working,
    })
}

fn check_bounds(
    venture: &Venture,
    holder_id: &str,
    holder_type: HolderType,
    after: Pct,
    delta: Pct,
    reserve_pct: Pct,
) -> Option<BoundReason> {
    if holder_type == HolderType::Reserve {
        return Some(BoundReason::ReserveTarget);
    }
    if after < 0 {
        return Some(BoundReason::BelowZero { after });
    }
    if after > HUNDRED_PCT {
        return Some(BoundReason::AboveHundred { after });
    }

    let is_owner = holder_type == HolderType::Owner || holder_id == venture.owner_id;
    if is_owner && delta < 0 && after < venture.owner_min_pct {
        return Some(BoundReason::OwnerFloor {
            after,
            floor: venture.owner_min_pct,
        });
    }
    // Only growth is capped; a holder already above the cap may still shrink.
    if !is_owner && delta > 0 && after > venture.alice_cap_pct {
        return Some(BoundReason::HolderCap {
            after,
            cap: venture.alice_cap_pct,
        });
    }
    if reserve_pct - delta < 0 {
        return Some(BoundReason::ReserveExhausted {
            available: reserve_pct,
            required: delta,
        });
    }
    None
}

fn upsert(
    state: &mut CapTableState,
    holder_id: &str,
    holder_type: HolderType,
    pct: Pct,
    now: DateTime<Utc>,
) {
    let venture_id = state.venture_id.clone();
    let entry = state
        .entries
        .entry(holder_id.to_string())
        .or_insert_with(|| CapTableEntry {
            venture_id,
            holder_id: holder_id.to_string(),
            holder_type,
            pct: 0,
            source: String::new(),
            updated_at: now,
        });
    entry.pct = pct;
    entry.updated_at = now;
}

/// One-line summary for logs.
pub fn describe(plan: &BatchPlan) -> String {
    let net: Pct = plan.changes.iter().map(|c| c.delta()).sum();
    format!(
        "{} applied, {} skipped, net {}",
        plan.changes.len(),
        plan.skipped.len(),
        format_pct(net)
    )
}
