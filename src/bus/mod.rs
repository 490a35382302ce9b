//! In-process publish/subscribe fabric.

mod event_bus;
mod ordered;

pub use event_bus::{
    DeliveredEvent, Delivery, EventBus, SubscribeOptions, Subscription, TopicFilter,
};
pub use ordered::OrderedBuffer;
