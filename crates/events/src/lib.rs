//! Change notification: the broadcast wake-up path between producers and
//! idle workers.
//!
//! - [`NotifyBus`] publishes [`JobNotification`]s and hands out subscriptions.
//! - [`Doorbell`] is what workers actually wait on; a listener thread turns
//!   notifications into rings, and the poll timer ends the wait regardless.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;
pub mod wake;

pub use bus::{Feed, NotifyBus, NotifyError, NullBus, Subscription, feed};
pub use in_memory_bus::InMemoryNotifyBus;
pub use notification::JobNotification;
pub use wake::{Doorbell, Ticket, Wake};
