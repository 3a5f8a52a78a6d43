//! Hive Daemon Library
//!
//! Supervisor side of Hive:
//! - Worker process lifecycle with process-tree teardown
//! - Registry of supervised workers
//! - Fleet launch and event logging
//!
//! Cooperative stop is a protocol `command`; [`subprocess::ProcessSupervisor::terminate`]
//! is the forceful path.

pub mod fleet;
pub mod registry;
pub mod subprocess;
