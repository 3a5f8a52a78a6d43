//! Hive Agent Library
//!
//! Worker side of Hive:
//! - Backlog access, in process or through a tool server
//! - Step executors
//! - Inbound control (stop, pause, resume, operator messages)
//! - The claim/execute/complete loop

pub mod backlog;
pub mod control;
pub mod executor;
pub mod runner;

pub use backlog::{Backlog, BacklogError, LocalBacklog, StdioBacklog};
pub use control::Control;
pub use executor::{CommandExecutor, DryRunExecutor, ExecutorError, StepExecutor};
pub use runner::{AgentRunner, RunOutcome, RunSummary, RunnerError};
