//! Hive Core Library
//!
//! Shared functionality for Hive components:
//! - `@@MESSAGE@@` line protocol codec, event bus and worker channel
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers shared by the store and its callers
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
