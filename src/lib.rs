//! Aleph Sandbox - Core Library
//! Paper-trading ledger with a hash-chained decision tracer and an autonomous agent

pub mod agent;
pub mod core;
pub mod events;
pub mod glassbox;
pub mod ledger;
pub mod market;
pub mod storage;

// Re-exports
pub use core::{Config, Error, Result};
