//! Byte-level contract: driver trait, scoped brokers and watchers,
//! transactions and list iterators.

mod broker;
mod driver;
mod iterator;
mod txn;
mod types;

pub use broker::*;
pub use driver::*;
pub use iterator::*;
pub use txn::*;
pub use types::*;

#[cfg(test)]
mod iterator_test;
