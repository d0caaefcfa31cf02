use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use shelfkeep_core::WorkspaceId;

/// Stable event type identifiers (wire contract with subscribers).
pub mod event_types {
    pub const PHOTO_THUMBNAIL_READY: &str = "photo.thumbnail_ready";
    pub const PHOTO_THUMBNAIL_FAILED: &str = "photo.thumbnail_failed";
}

/// A workspace-scoped real-time event.
///
/// Carries the affected entity and a free-form data map; consumers must not
/// rely on it being delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    pub event_id: Uuid,
    pub workspace_id: WorkspaceId,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub data: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

impl WorkspaceEvent {
    pub fn new(
        workspace_id: WorkspaceId,
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            workspace_id,
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id,
            data: Map::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Attach one data field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_fields_accumulate() {
        let event = WorkspaceEvent::new(
            WorkspaceId::new(),
            event_types::PHOTO_THUMBNAIL_READY,
            "photo",
            Uuid::now_v7(),
        )
        .with("small", "a/b_small.webp")
        .with("large", Value::Null);

        assert_eq!(event.data.len(), 2);
        assert_eq!(event.data["small"], "a/b_small.webp");
        assert!(event.data["large"].is_null());
    }
}
