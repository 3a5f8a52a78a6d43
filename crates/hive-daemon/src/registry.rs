//! Table of supervised workers, keyed by owner id.
//!
//! The registry is created once by the binary and shared by reference; it
//! holds no process state of its own beyond the supervisors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::subprocess::{ProcessSupervisor, WorkerStatus};

#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<String, Arc<ProcessSupervisor>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a supervisor under its owner id, replacing any previous one.
    pub async fn insert(&self, supervisor: Arc<ProcessSupervisor>) -> Option<Arc<ProcessSupervisor>> {
        let owner = supervisor.owner().to_string();
        self.workers.write().await.insert(owner, supervisor)
    }

    pub async fn get(&self, owner: &str) -> Option<Arc<ProcessSupervisor>> {
        self.workers.read().await.get(owner).cloned()
    }

    pub async fn remove(&self, owner: &str) -> Option<Arc<ProcessSupervisor>> {
        self.workers.write().await.remove(owner)
    }

    /// Registered owner ids, sorted.
    pub async fn owners(&self) -> Vec<String> {
        let mut owners: Vec<_> = self.workers.read().await.keys().cloned().collect();
        owners.sort();
        owners
    }

    /// Status of every registered worker, sorted by owner.
    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<_> = self
            .workers
            .read()
            .await
            .values()
            .map(|sup| sup.status())
            .collect();
        statuses.sort_by(|a, b| a.owner.cmp(&b.owner));
        statuses
    }

    /// Terminate every worker concurrently. Returns how many failed to stop.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        let supervisors: Vec<_> = self.workers.read().await.values().cloned().collect();
        info!(count = supervisors.len(), "Terminating all workers");

        let mut set = JoinSet::new();
        for sup in supervisors {
            set.spawn(async move {
                let result = sup.terminate(grace).await;
                (sup.owner().to_string(), result)
            });
        }

        let mut failed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((owner, Err(e))) => {
                    warn!(owner = %owner, error = %e, "Worker did not stop cleanly");
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Terminate task failed");
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Wait until every registered worker's process has exited.
    pub async fn wait_all(&self) {
        let supervisors: Vec<_> = self.workers.read().await.values().cloned().collect();
        for sup in supervisors {
            sup.wait().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry").finish_non_exhaustive()
    }
}
