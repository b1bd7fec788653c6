//! Typed in-process publish/subscribe.
//!
//! - [`EventBus`]: fan-out hub backed by `tokio::sync::broadcast`, generic
//!   over the event type.
//! - [`Subscription`]: handle for a callback subscriber; dropping the last
//!   reference to the bus or calling [`Subscription::unsubscribe`] ends it.

pub mod bus;

pub use bus::{EventBus, Subscription};
