//! The worker loop: claim a feature, execute its steps, complete it.
//!
//! Progress is reported to the supervisor as `step_update`,
//! `agent_narrative` and `agent_chat_message` frames. A feature whose work
//! is interrupted (stop request or failed step) is released, so another
//! worker can claim it.

use std::collections::HashSet;
use std::sync::Arc;

use hive_core::protocol::{ChannelSender, MessageType, StepStatus, StepUpdatePayload};
use hive_store::storage::Feature;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::backlog::{Backlog, BacklogError};
use crate::control::Control;
use crate::executor::{ExecutorError, StepExecutor};

/// Why [`AgentRunner::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to claim.
    Exhausted,
    /// A stop was requested.
    Stopped,
    /// The iteration limit was reached.
    IterationLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub completed: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Backlog(#[from] BacklogError),

    #[error("Step {step_index} of feature {feature_id} failed: {source}")]
    Step {
        feature_id: i64,
        step_index: i64,
        #[source]
        source: ExecutorError,
    },
}

/// How work on one feature ended early.
enum Interrupted {
    Stopped,
    Failed(RunnerError),
}

impl From<BacklogError> for Interrupted {
    fn from(e: BacklogError) -> Self {
        Self::Failed(e.into())
    }
}

pub struct AgentRunner {
    owner: String,
    backlog: Arc<dyn Backlog>,
    executor: Arc<dyn StepExecutor>,
    sender: ChannelSender,
    control: Arc<Control>,
}

impl AgentRunner {
    pub fn new(
        owner: impl Into<String>,
        backlog: Arc<dyn Backlog>,
        executor: Arc<dyn StepExecutor>,
        sender: ChannelSender,
        control: Arc<Control>,
    ) -> Self {
        Self {
            owner: owner.into(),
            backlog,
            executor,
            sender,
            control,
        }
    }

    /// Process features until the queue is empty, a stop is requested, or
    /// `max_iterations` features have been claimed.
    ///
    /// A failed step releases its feature and ends the run with an error.
    pub async fn run(&self, max_iterations: Option<u32>) -> Result<RunSummary, RunnerError> {
        let mut claimed = 0_u32;
        let mut completed = 0_u32;

        loop {
            if max_iterations.is_some_and(|max| claimed >= max) {
                info!(owner = %self.owner, claimed, "Iteration limit reached");
                return Ok(RunSummary {
                    outcome: RunOutcome::IterationLimit,
                    completed,
                });
            }

            self.control.wait_while_paused().await;
            if self.control.is_stopped() {
                return Ok(RunSummary {
                    outcome: RunOutcome::Stopped,
                    completed,
                });
            }
            self.relay_operator_messages().await;

            let feature = match self.backlog.claim_next(&self.owner).await {
                Ok(feature) => feature,
                Err(e) if e.is_not_available() => {
                    info!(owner = %self.owner, completed, "Backlog exhausted");
                    self.chat("No features left to work on").await;
                    return Ok(RunSummary {
                        outcome: RunOutcome::Exhausted,
                        completed,
                    });
                }
                Err(e) => return Err(e.into()),
            };
            claimed += 1;

            info!(owner = %self.owner, feature_id = feature.id, name = %feature.name, "Claimed feature");
            self.chat(&format!("Working on feature #{}: {}", feature.id, feature.name))
                .await;

            match self.work(&feature).await {
                Ok(()) => {
                    self.backlog.complete(feature.id).await?;
                    completed += 1;
                    info!(owner = %self.owner, feature_id = feature.id, "Feature completed");
                    self.chat(&format!("Completed feature #{}: {}", feature.id, feature.name))
                        .await;
                }
                Err(Interrupted::Stopped) => {
                    self.release(&feature, "stop requested").await?;
                    return Ok(RunSummary {
                        outcome: RunOutcome::Stopped,
                        completed,
                    });
                }
                Err(Interrupted::Failed(e)) => {
                    self.release(&feature, &e.to_string()).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn work(&self, feature: &Feature) -> Result<(), Interrupted> {
        // A resumed feature keeps the steps it already finished.
        let done: HashSet<i64> = self
            .backlog
            .progress(feature.id)
            .await?
            .steps
            .iter()
            .filter(|s| s.completed_at.is_some())
            .map(|s| s.step_index)
            .collect();
        let total = feature.steps.len();

        for (index, step) in (0_i64..).zip(&feature.steps) {
            self.control.wait_while_paused().await;
            if self.control.is_stopped() {
                return Err(Interrupted::Stopped);
            }
            if done.contains(&index) {
                debug!(feature_id = feature.id, step_index = index, "Step already done");
                continue;
            }

            self.step_update(feature.id, index, StepStatus::Started, "")
                .await;
            self.backlog.step_started(feature.id, index).await?;
            self.narrate(&format!("Step {}/{total}: {step}", index + 1))
                .await;

            let notes = tokio::select! {
                result = self.executor.execute(feature, index, step) => {
                    result.map_err(|source| Interrupted::Failed(RunnerError::Step {
                        feature_id: feature.id,
                        step_index: index,
                        source,
                    }))?
                }
                () = self.control.stopped() => return Err(Interrupted::Stopped),
            };
            if let Some(notes) = &notes {
                self.narrate(notes).await;
            }

            self.backlog
                .step_completed(feature.id, index, notes.as_deref())
                .await?;
            self.step_update(
                feature.id,
                index,
                StepStatus::Completed,
                notes.as_deref().unwrap_or_default(),
            )
            .await;
        }
        Ok(())
    }

    async fn release(&self, feature: &Feature, reason: &str) -> Result<(), BacklogError> {
        warn!(owner = %self.owner, feature_id = feature.id, reason, "Releasing feature");
        self.backlog.release(feature.id, &self.owner).await?;
        self.chat(&format!(
            "Released feature #{} ({}): {reason}",
            feature.id, feature.name
        ))
        .await;
        Ok(())
    }

    async fn relay_operator_messages(&self) {
        for message in self.control.drain_messages() {
            self.narrate(&format!("Operator note: {message}")).await;
        }
    }

    async fn step_update(&self, feature_id: i64, step_index: i64, status: StepStatus, notes: &str) {
        let payload = StepUpdatePayload {
            feature_id,
            step_index,
            status,
            notes: notes.to_string(),
        };
        match serde_json::to_value(payload) {
            Ok(payload) => self.emit(MessageType::STEP_UPDATE, payload).await,
            Err(e) => warn!(error = %e, "Failed to encode step update"),
        }
    }

    async fn chat(&self, content: &str) {
        self.emit(MessageType::AGENT_CHAT_MESSAGE, json!({ "content": content }))
            .await;
    }

    async fn narrate(&self, content: &str) {
        self.emit(MessageType::AGENT_NARRATIVE, json!({ "content": content }))
            .await;
    }

    /// Reporting is best effort: a gone supervisor must not stop the work.
    async fn emit(&self, msg_type: &str, payload: Value) {
        if let Err(e) = self.sender.send(msg_type, payload).await {
            debug!(msg_type, error = %e, "Dropped outbound frame");
        }
    }
}
