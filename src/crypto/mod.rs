//! RSA field encryption of stored values.
//!
//! Encrypted fields hold `$crypto$` followed by the URL-safe base64 of the
//! PKCS#1 v1.5 cipher text. JSON values additionally carry a top-level
//! `"encrypted": "true"` so plain payloads can skip parsing.

mod field;
mod policy;
mod wrapper;

pub use field::*;
pub use policy::*;
pub use wrapper::*;
