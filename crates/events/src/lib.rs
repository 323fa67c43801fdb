//! Change-notification mechanics (publish/subscribe), independent of what is published.

pub mod bus;
pub mod in_memory_bus;
pub mod scope;

pub use bus::{EventBus, SubscriberLiveness, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use scope::WorkspaceScoped;
