//! Bus subscriber that records every workspace event in the worker log.
//!
//! The worker has no UI sessions of its own; without a subscriber the
//! thumbnail events it publishes would go nowhere.

use tracing::info;

use shelfkeep_events::{Subscription, WorkspaceEvent};

/// Log events from `sub` until every publisher is gone. Blocks the calling
/// thread; run it under `spawn_blocking`. Returns how many events were seen.
pub fn log_events(sub: Subscription<WorkspaceEvent>) -> usize {
    let mut seen = 0;
    while let Ok(event) = sub.recv() {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            workspace_id = %event.workspace_id,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            "workspace event"
        );
        seen += 1;
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfkeep_core::WorkspaceId;
    use shelfkeep_events::{EventBus, InMemoryEventBus, event_types};
    use uuid::Uuid;

    #[test]
    fn logs_until_the_bus_goes_away() {
        let bus = InMemoryEventBus::<WorkspaceEvent>::new();
        let sub = bus.subscribe();
        let workspace_id = WorkspaceId::new();
        for event_type in [
            event_types::PHOTO_THUMBNAIL_READY,
            event_types::PHOTO_THUMBNAIL_FAILED,
        ] {
            bus.publish(WorkspaceEvent::new(workspace_id, event_type, "photo", Uuid::now_v7()))
                .unwrap();
        }
        drop(bus);

        assert_eq!(log_events(sub), 2);
    }
}
