//! `SQLite` storage for the Hive backlog.
//!
//! Provides persistence for features and their per-step progress, and the
//! claim protocol that hands features to workers.

mod db;
mod models;
mod queries;
mod steps;

pub use db::{Database, DatabaseError};
pub use models::*;
