//! Hive backlog store.
//!
//! - `SQLite` persistence for features and per-step progress
//! - The claim protocol that hands features to concurrent workers
//! - A named-tool call surface and a stdio server exposing it

pub mod error;
pub mod server;
pub mod storage;
pub mod tools;

pub use error::{Result, StoreError};
pub use storage::Database;
pub use tools::{ToolDispatcher, ToolError, ToolResponse};
