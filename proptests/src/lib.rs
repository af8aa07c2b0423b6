//! Property-based tests for the bucket node.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all property tests
//! cargo test -p proptests
//!
//! # Run with more test cases (slower but more thorough)
//! PROPTEST_CASES=10000 cargo test -p proptests
//!
//! # Run specific test module
//! cargo test -p proptests ledger
//! ```
//!
//! ## Test Categories
//!
//! - **Ledger tests**: height-range queries (ordering, bounds, prefix isolation)
//! - **Verifier tests**: tag admission (idempotence, mismatch detection)
//! - **Identity tests**: peer identity signatures (verification, tampering)
//! - **Split tests**: block partitioning (count, size, content preservation)

// Re-export common for use in test modules
pub use common;

/// Shared test strategies and helpers.
pub mod strategies;

#[cfg(test)]
mod identity;
#[cfg(test)]
mod ledger;
#[cfg(test)]
mod split;
#[cfg(test)]
mod verifier;
