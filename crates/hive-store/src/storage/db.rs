//! Database connection and initialization.

pub use hive_core::db::DatabaseError;

hive_core::define_database!(Database, "Backlog migrations complete");
