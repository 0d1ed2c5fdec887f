//! Core module - Common types, traits, config and error handling

pub mod error;
pub mod types;
pub mod traits;
pub mod config;

pub use error::{Advisory, Error, Result, Severity};
pub use types::*;
pub use traits::*;
pub use config::Config;
