//! Integration test entry point
//!
//! Run with: cargo test --test integration
//!
//! The suites drive full proxy sessions against scripted in-memory
//! backends; no external database is needed.

mod common;

mod causal;
mod pool;
mod prepared;
mod properties;
mod replay;
mod routing;
