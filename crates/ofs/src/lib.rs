#![forbid(unsafe_code)]

//! OublieFS public API facade.
//!
//! Re-exports core functionality from `ofs-core`. This is the crate that
//! downstream consumers depend on.

pub use ofs_core::*;
