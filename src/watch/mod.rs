//! Delivery of change events to subscribers.
//!
//! Every driver owns one [`WatchHub`]. Drivers either publish events as they
//! happen (memory, embedded, filesystem) or feed per-key native streams into
//! a [`Subscription`] (etcd, Consul, Redis). The hub handles ordering,
//! cancellation, the delivery timeout and duplicate suppression the same way
//! for all of them.

mod dedup;
mod hub;
mod sink;

pub(crate) use dedup::*;
pub use hub::*;
pub use sink::*;

#[cfg(test)]
mod hub_test;
