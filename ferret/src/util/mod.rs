//! Utilities.

pub mod io;
