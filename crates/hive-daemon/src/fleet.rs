//! Launching a fleet of backlog workers.
//!
//! Each worker gets owner id `agent-<n>`, its own working directory under the
//! fleet root, and an event bus that logs everything it reports.

use std::path::PathBuf;
use std::sync::Arc;

use hive_core::protocol::{ContentPayload, EventBus, MessageType, StepUpdatePayload};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::registry::WorkerRegistry;
use crate::subprocess::{ProcessSupervisor, SpawnConfig, SupervisorError, WorkerHandle};

/// How to launch the fleet.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub workers: u32,
    pub program: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
    pub workdir_root: PathBuf,
    pub db_path: PathBuf,
}

impl FleetConfig {
    pub fn owner(n: u32) -> String {
        format!("agent-{n}")
    }

    fn spawn_config(&self, owner: &str) -> SpawnConfig {
        SpawnConfig {
            program: self.program.clone(),
            args: self.args.clone(),
            working_dir: self.workdir_root.join(owner),
            env: vec![
                (
                    "HIVE_DB_PATH".to_string(),
                    self.db_path.display().to_string(),
                ),
                ("HIVE_AGENT_ID".to_string(), owner.to_string()),
            ],
        }
    }
}

/// Bus that logs one worker's events and output lines.
pub fn logging_bus(owner: &str) -> EventBus {
    let bus = EventBus::new();

    let o = owner.to_string();
    bus.on(MessageType::STEP_UPDATE, move |env| {
        let update: StepUpdatePayload = env.payload_as()?;
        info!(
            owner = %o,
            feature_id = update.feature_id,
            step_index = update.step_index,
            status = %update.status,
            "Step update"
        );
        Ok(())
    });

    let o = owner.to_string();
    bus.on(MessageType::AGENT_CHAT_MESSAGE, move |env| {
        let msg: ContentPayload = env.payload_as()?;
        info!(owner = %o, content = %msg.content, "Worker message");
        Ok(())
    });

    let o = owner.to_string();
    bus.on(MessageType::AGENT_NARRATIVE, move |env| {
        let msg: ContentPayload = env.payload_as()?;
        debug!(owner = %o, content = %msg.content, "Worker narrative");
        Ok(())
    });

    let o = owner.to_string();
    bus.on(MessageType::PONG, move |_| {
        debug!(owner = %o, "pong");
        Ok(())
    });

    let o = owner.to_string();
    bus.on_raw(move |line| {
        info!(owner = %o, "{line}");
        Ok(())
    });

    bus
}

/// Spawn every worker and register it. Workers already started stay running
/// if a later one fails; the caller decides whether to tear them down.
pub async fn launch(
    config: &FleetConfig,
    registry: &WorkerRegistry,
) -> Result<Vec<WorkerHandle>, SupervisorError> {
    let mut handles = Vec::new();

    for n in 1..=config.workers {
        let owner = FleetConfig::owner(n);
        let spawn = config.spawn_config(&owner);
        std::fs::create_dir_all(&spawn.working_dir).map_err(|e| {
            SupervisorError::SpawnFailed {
                reason: format!(
                    "cannot create working directory {}: {e}",
                    spawn.working_dir.display()
                ),
            }
        })?;

        let supervisor = Arc::new(ProcessSupervisor::new(owner.clone()));
        registry.insert(Arc::clone(&supervisor)).await;

        let handle = supervisor.start(spawn, logging_bus(&owner))?;
        if let Err(e) = supervisor.send(MessageType::PING, json!({})).await {
            warn!(owner = %owner, error = %e, "Initial ping failed");
        }
        handles.push(handle);
    }

    info!(workers = handles.len(), "Fleet launched");
    Ok(handles)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn worker_gets_owner_dir_and_env() {
        let config = FleetConfig {
            workers: 2,
            program: "hive-agent".into(),
            args: vec!["--yolo".into()],
            workdir_root: "/tmp/fleet".into(),
            db_path: "/tmp/fleet/features.db".into(),
        };
        let spawn = config.spawn_config(&FleetConfig::owner(2));

        assert_eq!(spawn.working_dir, PathBuf::from("/tmp/fleet/agent-2"));
        assert_eq!(spawn.args, vec!["--yolo"]);
        assert!(spawn.env.contains(&("HIVE_AGENT_ID".into(), "agent-2".into())));
        assert!(
            spawn
                .env
                .contains(&("HIVE_DB_PATH".into(), "/tmp/fleet/features.db".into()))
        );
    }

    #[test]
    fn logging_bus_handles_worker_events() {
        let bus = logging_bus("agent-1");
        for msg_type in [
            MessageType::STEP_UPDATE,
            MessageType::AGENT_CHAT_MESSAGE,
            MessageType::AGENT_NARRATIVE,
            MessageType::PONG,
        ] {
            assert_eq!(bus.handler_count(msg_type), 1);
        }
        assert_eq!(bus.dispatch_raw("plain output"), 1);
    }
}
