//! Small helpers shared by the `ferret` crates.

#[cfg(feature = "error")]
pub mod error;
