//! One key-value API over heterogeneous stores.
//!
//! A [`KvDriver`] adapts one backend (etcd, an embedded sled file, Consul,
//! Redis, JSON files or process memory) to the byte-level contract. Brokers
//! and watchers are prefix-scoped views of a driver; the typed layer adds a
//! [`Codec`] and the crypto layer decrypts `$crypto$` fields on reads.
//! [`KvPlugin`] wires everything from configuration.

mod codec;
mod config;
mod constants;
mod crypto;
mod drivers;
mod errors;
mod kv;
mod plugin;
mod typed;
mod watch;

pub mod metrics;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

pub use codec::*;
pub use config::*;
pub use constants::*;
pub use crypto::*;
pub use drivers::*;
pub use errors::*;
pub use kv::*;
pub use plugin::*;
pub use typed::*;
pub use watch::*;
