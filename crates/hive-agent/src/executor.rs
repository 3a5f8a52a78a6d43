//! Step execution.
//!
//! The runner hands each step of a claimed feature to a [`StepExecutor`].
//! [`CommandExecutor`] runs an external command per step; [`DryRunExecutor`]
//! does nothing and lets the runner narrate.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use hive_store::storage::Feature;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt kept in an error.
const STDERR_EXCERPT: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to run step command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Step command failed with exit code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute one step. Returns notes to record with the step, if any.
    async fn execute(
        &self,
        feature: &Feature,
        index: i64,
        step: &str,
    ) -> Result<Option<String>, ExecutorError>;
}

/// Runs a shell command per step in the worker's working directory.
///
/// The command sees `HIVE_FEATURE_ID`, `HIVE_FEATURE_NAME`,
/// `HIVE_STEP_INDEX`, `HIVE_STEP_TEXT` and, when set, `HIVE_MODEL`. Its
/// trimmed stdout becomes the step notes. The child is killed if the
/// execution future is dropped.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    working_dir: PathBuf,
    model: Option<String>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            model: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    async fn execute(
        &self,
        feature: &Feature,
        index: i64,
        step: &str,
    ) -> Result<Option<String>, ExecutorError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .env("HIVE_FEATURE_ID", feature.id.to_string())
            .env("HIVE_FEATURE_NAME", &feature.name)
            .env("HIVE_STEP_INDEX", index.to_string())
            .env("HIVE_STEP_TEXT", step)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(model) = &self.model {
            cmd.env("HIVE_MODEL", model);
        }

        debug!(feature_id = feature.id, step_index = index, "Running step command");
        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let start = stderr
                .char_indices()
                .rev()
                .nth(STDERR_EXCERPT - 1)
                .map_or(0, |(i, _)| i);
            return Err(ExecutorError::Failed {
                code: output.status.code(),
                stderr: stderr[start..].to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!stdout.is_empty()).then_some(stdout))
    }
}

/// Executes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn execute(
        &self,
        _feature: &Feature,
        _index: i64,
        _step: &str,
    ) -> Result<Option<String>, ExecutorError> {
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use hive_store::storage::FeatureKind;

    fn feature() -> Feature {
        Feature {
            id: 42,
            priority: 1,
            kind: FeatureKind::Feature,
            category: "c".into(),
            name: "login form".into(),
            description: "d".into(),
            steps: vec!["write it".into()],
            completed: false,
            claimed: true,
            label: None,
            owner: Some("agent-1".into()),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn command_sees_step_environment_and_returns_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = CommandExecutor::new(
            r#"echo "$HIVE_FEATURE_ID/$HIVE_STEP_INDEX/$HIVE_STEP_TEXT/$HIVE_MODEL"; pwd > where"#,
            dir.path(),
        )
        .with_model("m1");

        let notes = exec.execute(&feature(), 3, "write it").await.unwrap();
        assert_eq!(notes.as_deref(), Some("42/3/write it/m1"));
        assert!(dir.path().join("where").exists());
    }

    #[tokio::test]
    async fn silent_command_has_no_notes() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = CommandExecutor::new("true", dir.path());
        assert_eq!(exec.execute(&feature(), 0, "s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_with_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = CommandExecutor::new("echo nope >&2; exit 4", dir.path());
        let err = exec.execute(&feature(), 0, "s").await.unwrap_err();
        match err {
            ExecutorError::Failed { code, stderr } => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_stderr_keeps_only_the_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = CommandExecutor::new(
            "printf head >&2; i=0; while [ $i -lt 2500 ]; do printf 'é' >&2; i=$((i+1)); done; exit 1",
            dir.path(),
        );
        match exec.execute(&feature(), 0, "s").await.unwrap_err() {
            ExecutorError::Failed { stderr, .. } => {
                assert_eq!(stderr.chars().count(), STDERR_EXCERPT);
                assert!(stderr.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_does_nothing() {
        assert_eq!(
            DryRunExecutor.execute(&feature(), 0, "s").await.unwrap(),
            None
        );
    }
}
