//! Fixtures shared by the unit tests
mod keys;
mod messages;

pub use keys::*;
pub use messages::*;
