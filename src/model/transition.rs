use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An immutable row appended on every state change (spec §3). The sole
/// source of truth for an entity's `current_state`, and for audit/recovery.
/// Append-only: once written, never modified or removed (spec §8 I7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub entity_id: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

impl TransitionRecord {
    pub fn new(
        entity_id: Uuid,
        from_state: Option<String>,
        to_state: impl Into<String>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            entity_id,
            from_state,
            to_state: to_state.into(),
            at: Utc::now(),
            metadata,
        }
    }
}
