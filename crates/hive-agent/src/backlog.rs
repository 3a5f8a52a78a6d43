//! Worker-side access to the backlog tools.
//!
//! [`LocalBacklog`] calls the tools in process against the shared database
//! file. [`StdioBacklog`] talks to a `hive-daemon tools` server over JSON
//! lines. Both only implement [`Backlog::call`]; the typed methods decode the
//! tool results.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hive_store::storage::{Feature, FeatureProgress, Stats, StepRecord};
use hive_store::{Database, StoreError, ToolDispatcher, ToolError, ToolResponse};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors from backlog calls.
#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    /// The tool ran and reported a structured error.
    #[error("{kind}: {message}")]
    Tool { kind: String, message: String },

    #[error("Failed to open backlog: {0}")]
    Open(#[from] StoreError),

    #[error("Tool server I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected tool response: {0}")]
    Protocol(String),
}

impl BacklogError {
    /// The queue has nothing left to claim.
    pub fn is_not_available(&self) -> bool {
        matches!(self, Self::Tool { kind, .. } if kind == "not_available")
    }
}

impl From<ToolError> for BacklogError {
    fn from(e: ToolError) -> Self {
        Self::Tool {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// The claim-protocol operations a worker needs.
#[async_trait]
pub trait Backlog: Send + Sync {
    /// Run one named tool and return its result.
    async fn call(&self, tool: &str, args: Value) -> Result<Value, BacklogError>;

    async fn claim_next(&self, owner: &str) -> Result<Feature, BacklogError> {
        decode(self.call("claim_next", json!({ "owner": owner })).await?)
    }

    async fn release(&self, feature_id: i64, owner: &str) -> Result<Feature, BacklogError> {
        decode(
            self.call("release", json!({ "feature_id": feature_id, "owner": owner }))
                .await?,
        )
    }

    async fn complete(&self, feature_id: i64) -> Result<Feature, BacklogError> {
        decode(self.call("complete", json!({ "feature_id": feature_id })).await?)
    }

    async fn step_started(
        &self,
        feature_id: i64,
        step_index: i64,
    ) -> Result<StepRecord, BacklogError> {
        decode(
            self.call(
                "step_start",
                json!({ "feature_id": feature_id, "step_index": step_index }),
            )
            .await?,
        )
    }

    async fn step_completed(
        &self,
        feature_id: i64,
        step_index: i64,
        notes: Option<&str>,
    ) -> Result<StepRecord, BacklogError> {
        decode(
            self.call(
                "step_complete",
                json!({ "feature_id": feature_id, "step_index": step_index, "notes": notes }),
            )
            .await?,
        )
    }

    async fn progress(&self, feature_id: i64) -> Result<FeatureProgress, BacklogError> {
        decode(self.call("progress", json!({ "feature_id": feature_id })).await?)
    }

    async fn stats(&self) -> Result<Stats, BacklogError> {
        decode(self.call("stats", Value::Null).await?)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, BacklogError> {
    serde_json::from_value(value).map_err(|e| BacklogError::Protocol(e.to_string()))
}

/// In-process backlog over a [`ToolDispatcher`].
#[derive(Clone)]
pub struct LocalBacklog {
    tools: ToolDispatcher,
}

impl LocalBacklog {
    pub const fn new(tools: ToolDispatcher) -> Self {
        Self { tools }
    }

    /// Open the shared store file.
    pub async fn open(db_path: &Path, yolo: bool) -> Result<Self, BacklogError> {
        let db = Database::open(db_path).await.map_err(StoreError::from)?;
        info!(path = %db_path.display(), yolo, "Backlog opened");
        Ok(Self::new(ToolDispatcher::new(db, yolo)))
    }
}

#[async_trait]
impl Backlog for LocalBacklog {
    async fn call(&self, tool: &str, args: Value) -> Result<Value, BacklogError> {
        Ok(self.tools.call(tool, args).await.into_result()?)
    }
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

struct Connection {
    writer: BoxedWriter,
    lines: Lines<BufReader<BoxedReader>>,
}

#[derive(Deserialize)]
struct ServerResponse {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    response: ToolResponse,
}

/// Backlog reached through a line-delimited JSON tool server.
///
/// Calls are serialized: one request is in flight at a time.
pub struct StdioBacklog {
    conn: Mutex<Connection>,
    next_id: AtomicU64,
    /// Keeps the spawned server alive; dropping it kills the server.
    _child: Option<Child>,
}

impl StdioBacklog {
    /// Use an already connected pair of streams.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_parts(Box::new(reader), Box::new(writer), None)
    }

    fn from_parts(reader: BoxedReader, writer: BoxedWriter, child: Option<Child>) -> Self {
        Self {
            conn: Mutex::new(Connection {
                writer,
                lines: BufReader::new(reader).lines(),
            }),
            next_id: AtomicU64::new(1),
            _child: child,
        }
    }

    /// Start `command` through `sh -c` and talk to it over its stdio.
    ///
    /// The server gets `HIVE_DB_PATH`, and `HIVE_YOLO_MODE=true` in yolo
    /// mode (otherwise the variable is removed). Its stderr is passed
    /// through.
    pub fn spawn(command: &str, db_path: &Path, yolo: bool) -> Result<Self, BacklogError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("HIVE_DB_PATH", db_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if yolo {
            cmd.env("HIVE_YOLO_MODE", "true");
        } else {
            cmd.env_remove("HIVE_YOLO_MODE");
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BacklogError::Protocol("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BacklogError::Protocol("Failed to capture stdout".into()))?;

        info!(command, pid = ?child.id(), "Tool server started");
        Ok(Self::from_parts(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
        ))
    }
}

#[async_trait]
impl Backlog for StdioBacklog {
    async fn call(&self, tool: &str, args: Value) -> Result<Value, BacklogError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "id": id, "tool": tool, "args": args }).to_string();

        let mut conn = self.conn.lock().await;
        conn.writer.write_all(request.as_bytes()).await?;
        conn.writer.write_all(b"\n").await?;
        conn.writer.flush().await?;

        let line = conn
            .lines
            .next_line()
            .await?
            .ok_or_else(|| BacklogError::Protocol("tool server closed its output".into()))?;
        drop(conn);

        let reply: ServerResponse = serde_json::from_str(&line)
            .map_err(|e| BacklogError::Protocol(format!("{e}: {line}")))?;
        if reply.id != json!(id) {
            return Err(BacklogError::Protocol(format!(
                "response id {} does not match request {id}",
                reply.id
            )));
        }
        debug!(tool, id, ok = reply.response.ok, "Tool server replied");
        Ok(reply.response.into_result()?)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn seeded_tools() -> ToolDispatcher {
        let db = Database::open_in_memory().await.unwrap();
        let tools = ToolDispatcher::new(db, false);
        let resp = tools
            .call(
                "create",
                json!({"items": [
                    {"category": "c", "name": "first", "description": "d", "steps": ["a", "b"]},
                ]}),
            )
            .await;
        assert!(resp.ok);
        tools
    }

    async fn exercise(backlog: &dyn Backlog) {
        let feature = backlog.claim_next("agent-1").await.unwrap();
        assert_eq!(feature.name, "first");
        assert_eq!(feature.owner.as_deref(), Some("agent-1"));

        let err = backlog.claim_next("agent-2").await.unwrap_err();
        assert!(err.is_not_available(), "{err}");

        backlog.step_started(feature.id, 0).await.unwrap();
        let step = backlog
            .step_completed(feature.id, 0, Some("done"))
            .await
            .unwrap();
        assert_eq!(step.notes.as_deref(), Some("done"));
        assert_eq!(backlog.progress(feature.id).await.unwrap().completed_steps, 1);

        let err = backlog.release(feature.id, "agent-2").await.unwrap_err();
        assert!(matches!(&err, BacklogError::Tool { kind, .. } if kind == "forbidden"));

        backlog.complete(feature.id).await.unwrap();
        assert_eq!(backlog.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn local_backlog_runs_the_claim_protocol() {
        let backlog = LocalBacklog::new(seeded_tools().await);
        exercise(&backlog).await;
    }

    #[tokio::test]
    async fn stdio_backlog_runs_the_claim_protocol() {
        let tools = seeded_tools().await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let server = tokio::spawn(async move {
            hive_store::server::serve(&tools, server_read, server_write).await
        });

        let (client_read, client_write) = tokio::io::split(client);
        let backlog = StdioBacklog::connect(client_read, client_write);
        exercise(&backlog).await;

        drop(backlog);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_server_is_a_protocol_error() {
        let backlog = StdioBacklog::connect(tokio::io::empty(), tokio::io::sink());
        let err = backlog.stats().await.unwrap_err();
        assert!(matches!(err, BacklogError::Protocol(_)));
    }
}
