//! Explicit operation context.
//!
//! Carried into every ledger, engine and window call instead of ambient
//! tenant/user state. `now` is the only clock the core ever reads.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OpContext {
    pub correlation_id: Uuid,
    /// Who asked: `scheduler`, `cli`, an operator id.
    pub actor: String,
    pub now: DateTime<Utc>,
}

impl OpContext {
    pub fn new(actor: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            actor: actor.into(),
            now,
        }
    }

    pub fn system(now: DateTime<Utc>) -> Self {
        Self::new("system", now)
    }

    /// Same correlation id, later instant.
    pub fn at(&self, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: self.correlation_id,
            actor: self.actor.clone(),
            now,
        }
    }
}
