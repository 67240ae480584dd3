//! Device contract: graph IR, compilation flags and the `Device` trait.

pub mod hashing;
pub mod shape_helpers;
pub mod spec;
