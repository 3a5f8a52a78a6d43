//! Worker process supervision.

pub mod supervisor;
pub mod tree;

pub use supervisor::{
    KILL_CONVERGE_TIMEOUT, ProcessSupervisor, SpawnConfig, SupervisorError, WorkerHandle,
    WorkerState, WorkerStatus,
};
