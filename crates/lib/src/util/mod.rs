//! Shared utilities.
//!
//! Atomic file writes, content hashing, and test helpers.

pub mod atomic;
pub mod hash;

#[cfg(test)]
pub mod testutil;
