//! Workspace-scoped real-time events.
//!
//! Events published here are hints for interested subscribers (UI sessions,
//! webhooks). Delivery is best-effort: the database stays the source of truth.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{WorkspaceEvent, event_types};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
