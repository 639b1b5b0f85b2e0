//! Domain events for the notification collaborator.
//!
//! The core never formats human-facing messages; it emits these and moves on.
//! Emission never fails the operation that produced the event.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::OpContext;
use crate::models::{HolderId, TransactionKind, VentureId};

/// Percentage deltas are reported in f64 percentage points.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    EquityAdjusted {
        venture_id: VentureId,
        holder_id: HolderId,
        delta: f64,
        kind: TransactionKind,
        cause_ref: String,
    },
    ConversionApplied {
        venture_id: VentureId,
        window_id: Uuid,
        holder_id: HolderId,
        equity_delta: f64,
    },
    RebalancingFailed {
        venture_id: VentureId,
        period_id: Uuid,
        reason: String,
    },
    AdjustmentSkipped {
        venture_id: VentureId,
        holder_id: HolderId,
        delta: f64,
        cause_ref: String,
        reason: String,
    },
    ConversionSkipped {
        venture_id: VentureId,
        window_id: Uuid,
        holder_id: HolderId,
        equity_delta: f64,
        reason: String,
    },
    RebalancingCompleted {
        venture_id: VentureId,
        period_id: Uuid,
        applied: usize,
        skipped: usize,
    },
    VentureFlagged {
        venture_id: VentureId,
        reason: String,
    },
    ReconciliationMismatch {
        venture_id: VentureId,
        discrepancies: usize,
        chain_breaks: usize,
    },
    WindowOpened {
        venture_id: VentureId,
        window_id: Uuid,
        applied: usize,
        skipped: usize,
    },
    WindowClosed {
        venture_id: VentureId,
        window_id: Uuid,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::EquityAdjusted { .. } => "equity_adjusted",
            DomainEvent::ConversionApplied { .. } => "conversion_applied",
            DomainEvent::RebalancingFailed { .. } => "rebalancing_failed",
            DomainEvent::AdjustmentSkipped { .. } => "adjustment_skipped",
            DomainEvent::ConversionSkipped { .. } => "conversion_skipped",
            DomainEvent::RebalancingCompleted { .. } => "rebalancing_completed",
            DomainEvent::VentureFlagged { .. } => "venture_flagged",
            DomainEvent::ReconciliationMismatch { .. } => "reconciliation_mismatch",
            DomainEvent::WindowOpened { .. } => "window_opened",
            DomainEvent::WindowClosed { .. } => "window_closed",
        }
    }

    pub fn venture_id(&self) -> &str {
        match self {
            DomainEvent::EquityAdjusted { venture_id, .. }
            | DomainEvent::ConversionApplied { venture_id, .. }
            | DomainEvent::RebalancingFailed { venture_id, .. }
            | DomainEvent::AdjustmentSkipped { venture_id, .. }
            | DomainEvent::ConversionSkipped { venture_id, .. }
            | DomainEvent::RebalancingCompleted { venture_id, .. }
            | DomainEvent::VentureFlagged { venture_id, .. }
            | DomainEvent::ReconciliationMismatch { venture_id, .. }
            | DomainEvent::WindowOpened { venture_id, .. }
            | DomainEvent::WindowClosed { venture_id, .. } => venture_id,
        }
    }

    /// Needs a human: alerts rather than informational notices.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            DomainEvent::RebalancingFailed { .. }
                | DomainEvent::VentureFlagged { .. }
                | DomainEvent::ReconciliationMismatch { .. }
        )
    }
}

/// Event plus the context of the call that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub correlation_id: Uuid,
    pub actor: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn new(ctx: &OpContext, event: DomainEvent) -> Self {
        Self {
            correlation_id: ctx.correlation_id,
            actor: ctx.actor.clone(),
            at: ctx.now,
            event,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, ctx: &OpContext, event: DomainEvent);
}

// =============================================================================
// BROADCAST SINK
// =============================================================================

/// Fan-out to any number of subscribers; every event is also logged.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, ctx: &OpContext, event: DomainEvent) {
        if event.is_alert() {
            warn!(
                event = event.name(),
                venture_id = %event.venture_id(),
                correlation_id = %ctx.correlation_id,
                payload = ?event,
                "domain alert"
            );
        } else {
            info!(
                event = event.name(),
                venture_id = %event.venture_id(),
                correlation_id = %ctx.correlation_id,
                "domain event"
            );
        }
        // No subscribers is fine; the log line above is the record.
        let _ = self.tx.send(EventEnvelope::new(ctx, event));
    }
}

// =============================================================================
// RECORDING SINK
// =============================================================================

/// Keeps every envelope in memory. Used by tests and the CLI summary.
#[derive(Default)]
pub struct RecordingEventSink {
    envelopes: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.envelopes
            .lock()
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.envelopes.lock().clone()
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.envelopes.lock())
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.envelopes
            .lock()
            .iter()
            .filter(|e| e.event.name() == name)
            .count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, ctx: &OpContext, event: DomainEvent) {
        self.envelopes.lock().push(EventEnvelope::new(ctx, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> OpContext {
        OpContext::system(Utc::now())
    }

    #[tokio::test]
    async fn test_broadcast_delivers_envelope() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        let ctx = ctx();
        sink.emit(
            &ctx,
            DomainEvent::WindowClosed {
                venture_id: "v1".into(),
                window_id: Uuid::nil(),
            },
        );
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.correlation_id, ctx.correlation_id);
        assert_eq!(envelope.event.name(), "window_closed");
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_panic() {
        let sink = BroadcastEventSink::default();
        sink.emit(
            &ctx(),
            DomainEvent::VentureFlagged {
                venture_id: "v1".into(),
                reason: "test".into(),
            },
        );
    }

    #[test]
    fn test_recording_sink_take_drains() {
        let sink = RecordingEventSink::new();
        let ctx = ctx();
        for _ in 0..3 {
            sink.emit(
                &ctx,
                DomainEvent::WindowClosed {
                    venture_id: "v1".into(),
                    window_id: Uuid::nil(),
                },
            );
        }
        assert_eq!(sink.count("window_closed"), 3);
        assert_eq!(sink.take().len(), 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(DomainEvent::EquityAdjusted {
            venture_id: "v1".into(),
            holder_id: "alice".into(),
            delta: -1.0,
            kind: TransactionKind::Rebalance,
            cause_ref: "p".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "equity_adjusted");
        assert_eq!(json["kind"], "REBALANCE");
    }
}
