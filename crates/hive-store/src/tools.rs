//! Named-tool call surface over the backlog.
//!
//! Workers reach the claim protocol through these tools, either in process
//! or through the stdio tool server. A call never fails at this boundary:
//! every outcome is a [`ToolResponse`] carrying a result or a structured
//! error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::storage::{Database, FeatureUpdate, NewFeature};

/// Default size of a regression sample.
const DEFAULT_REGRESSION_LIMIT: i64 = 3;

/// Every tool name understood by [`ToolDispatcher::call`].
pub const TOOL_NAMES: &[&str] = &[
    "stats",
    "claim_next",
    "get_next",
    "mark_claimed",
    "release",
    "complete",
    "skip",
    "create",
    "create_one",
    "list_existing",
    "list_labels",
    "update",
    "delete",
    "step_start",
    "step_complete",
    "progress",
    "regression",
];

/// Structured error in a tool response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: String,
    pub message: String,
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(err: &StoreError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ToolError {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    /// Split into the result value or the structured error.
    pub fn into_result(self) -> std::result::Result<Value, ToolError> {
        match (self.ok, self.result, self.error) {
            (true, result, _) => Ok(result.unwrap_or(Value::Null)),
            (false, _, Some(err)) => Err(err),
            (false, _, None) => Err(ToolError {
                kind: "invalid".into(),
                message: "error response without details".into(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct OwnerArgs {
    owner: String,
}

#[derive(Deserialize)]
struct OptionalOwnerArgs {
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Deserialize)]
struct FeatureArgs {
    feature_id: i64,
}

#[derive(Deserialize)]
struct FeatureOwnerArgs {
    feature_id: i64,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Deserialize)]
struct CreateArgs {
    items: Vec<NewFeature>,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
struct UpdateArgs {
    feature_id: i64,
    #[serde(flatten)]
    update: FeatureUpdate,
}

#[derive(Deserialize)]
struct StepArgs {
    feature_id: i64,
    step_index: i64,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
struct RegressionArgs {
    #[serde(default = "default_regression_limit")]
    limit: i64,
}

const fn default_regression_limit() -> i64 {
    DEFAULT_REGRESSION_LIMIT
}

/// Dispatches tool calls to a [`Database`].
#[derive(Clone)]
pub struct ToolDispatcher {
    db: Database,
    /// Regression sampling is refused in yolo mode.
    yolo: bool,
}

impl ToolDispatcher {
    pub fn new(db: Database, yolo: bool) -> Self {
        Self { db, yolo }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn yolo(&self) -> bool {
        self.yolo
    }

    /// Run one tool. Unknown tools and bad arguments are `invalid` errors.
    pub async fn call(&self, tool: &str, args: Value) -> ToolResponse {
        debug!(tool, "Tool call");
        match self.dispatch(tool, args).await {
            Ok(result) => ToolResponse::success(result),
            Err(e) => {
                debug!(tool, kind = e.kind(), error = %e, "Tool call failed");
                ToolResponse::failure(&e)
            }
        }
    }

    async fn dispatch(&self, tool: &str, args: Value) -> Result<Value> {
        let db = &self.db;
        match tool {
            "stats" => to_value(db.stats().await?),
            "claim_next" => {
                let args: OwnerArgs = parse(args)?;
                if args.owner.is_empty() {
                    return Err(StoreError::Invalid("owner must not be empty".into()));
                }
                to_value(db.claim_next(&args.owner).await?)
            }
            "get_next" => {
                let args: OptionalOwnerArgs = parse(args)?;
                match db.next_available(args.owner.as_deref()).await? {
                    Some(feature) => to_value(feature),
                    None => Err(StoreError::NotAvailable),
                }
            }
            "mark_claimed" => {
                let args: FeatureOwnerArgs = parse(args)?;
                to_value(db.mark_claimed(args.feature_id, args.owner.as_deref()).await?)
            }
            "release" => {
                let args: FeatureOwnerArgs = parse(args)?;
                to_value(db.release(args.feature_id, args.owner.as_deref()).await?)
            }
            "complete" => {
                let args: FeatureArgs = parse(args)?;
                to_value(db.complete(args.feature_id).await?)
            }
            "skip" => {
                let args: FeatureArgs = parse(args)?;
                to_value(db.skip(args.feature_id).await?)
            }
            "create" => {
                let args: CreateArgs = parse(args)?;
                let created = db.create_batch(&args.items, args.label.as_deref()).await?;
                Ok(json!({ "created": created, "label": args.label }))
            }
            "create_one" => {
                let item: NewFeature = parse(args)?;
                to_value(db.create_one(&item).await?)
            }
            "list_existing" => {
                let features = db.list_existing().await?;
                Ok(json!({ "count": features.len(), "features": features }))
            }
            "list_labels" => Ok(json!({ "labels": db.labels().await? })),
            "update" => {
                let args: UpdateArgs = parse(args)?;
                to_value(db.update(args.feature_id, &args.update).await?)
            }
            "delete" => {
                let args: FeatureArgs = parse(args)?;
                to_value(db.delete(args.feature_id).await?)
            }
            "step_start" => {
                let args: StepArgs = parse(args)?;
                to_value(db.mark_step_started(args.feature_id, args.step_index).await?)
            }
            "step_complete" => {
                let args: StepArgs = parse(args)?;
                to_value(
                    db.mark_step_completed(args.feature_id, args.step_index, args.notes.as_deref())
                        .await?,
                )
            }
            "progress" => {
                let args: FeatureArgs = parse(args)?;
                to_value(db.progress(args.feature_id).await?)
            }
            "regression" => {
                if self.yolo {
                    return Err(StoreError::Forbidden(
                        "regression sampling is disabled in yolo mode".into(),
                    ));
                }
                let args: RegressionArgs = parse(args)?;
                let features = db.sample_completed(args.limit).await?;
                Ok(json!({ "count": features.len(), "features": features }))
            }
            other => Err(StoreError::Invalid(format!("unknown tool '{other}'"))),
        }
    }
}

/// Deserialize tool arguments; a missing argument object means no arguments.
fn parse<T: DeserializeOwned>(args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| StoreError::Invalid(format!("bad arguments: {e}")))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Invalid(format!("unserializable: {e}")))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn dispatcher(yolo: bool) -> ToolDispatcher {
        let db = Database::open_in_memory().await.unwrap();
        let tools = ToolDispatcher::new(db, yolo);
        let resp = tools
            .call(
                "create",
                json!({
                    "label": "wave-1",
                    "items": [
                        {"category": "core", "name": "a", "description": "d", "steps": ["s1", "s2"]},
                        {"type": "bug", "category": "core", "name": "b", "description": "d", "steps": ["s1"]},
                    ]
                }),
            )
            .await;
        assert!(resp.ok, "{resp:?}");
        assert_eq!(resp.result.unwrap()["created"], 2);
        tools
    }

    fn kind(resp: &ToolResponse) -> &str {
        &resp.error.as_ref().unwrap().kind
    }

    #[tokio::test]
    async fn claim_next_returns_boosted_defect_first() {
        let tools = dispatcher(false).await;
        let resp = tools.call("claim_next", json!({"owner": "agent-1"})).await;
        let feature = resp.into_result().unwrap();
        assert_eq!(feature["name"], "b");
        assert_eq!(feature["kind"], "defect");
        assert_eq!(feature["owner"], "agent-1");
    }

    #[tokio::test]
    async fn errors_are_structured() {
        let tools = dispatcher(false).await;

        let resp = tools.call("complete", json!({"feature_id": 99})).await;
        assert!(!resp.ok);
        assert_eq!(kind(&resp), "not_found");

        let resp = tools.call("claim_next", json!({})).await;
        assert_eq!(kind(&resp), "invalid");

        let resp = tools.call("frobnicate", Value::Null).await;
        assert_eq!(kind(&resp), "invalid");

        tools.call("claim_next", json!({"owner": "a"})).await;
        tools.call("claim_next", json!({"owner": "b"})).await;
        let resp = tools.call("claim_next", json!({"owner": "c"})).await;
        assert_eq!(kind(&resp), "not_available");

        let resp = tools.call("release", json!({"feature_id": 1, "owner": "a"})).await;
        assert_eq!(kind(&resp), "forbidden");
    }

    #[tokio::test]
    async fn null_args_mean_no_args() {
        let tools = dispatcher(false).await;
        let stats = tools.call("stats", Value::Null).await.into_result().unwrap();
        assert_eq!(stats["total"], 2);

        let next = tools.call("get_next", Value::Null).await.into_result().unwrap();
        assert_eq!(next["claimed"], false);
    }

    #[tokio::test]
    async fn step_tools_and_progress() {
        let tools = dispatcher(false).await;
        tools
            .call("step_start", json!({"feature_id": 1, "step_index": 0}))
            .await
            .into_result()
            .unwrap();
        let step = tools
            .call(
                "step_complete",
                json!({"feature_id": 1, "step_index": 0, "notes": "done"}),
            )
            .await
            .into_result()
            .unwrap();
        assert_eq!(step["notes"], "done");

        let progress = tools
            .call("progress", json!({"feature_id": 1}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(progress["completed_steps"], 1);
        assert_eq!(progress["pending_steps"], 1);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let tools = dispatcher(false).await;
        let updated = tools
            .call("update", json!({"feature_id": 1, "description": "new"}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(updated["description"], "new");

        let resp = tools
            .call("update", json!({"feature_id": 1, "steps": ["one"]}))
            .await;
        assert_eq!(kind(&resp), "conflict");

        let deleted = tools
            .call("delete", json!({"feature_id": 1}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(deleted["name"], "a");
        assert_eq!(deleted["was_completed"], false);
    }

    #[tokio::test]
    async fn listings() {
        let tools = dispatcher(false).await;
        let existing = tools
            .call("list_existing", Value::Null)
            .await
            .into_result()
            .unwrap();
        assert_eq!(existing["count"], 2);

        let labels = tools
            .call("list_labels", Value::Null)
            .await
            .into_result()
            .unwrap();
        assert_eq!(labels["labels"][0]["label"], "wave-1");
        assert_eq!(labels["labels"][0]["pending"], 2);
    }

    #[tokio::test]
    async fn regression_is_refused_in_yolo_mode() {
        let tools = dispatcher(true).await;
        let resp = tools.call("regression", Value::Null).await;
        assert_eq!(kind(&resp), "forbidden");

        let tools = dispatcher(false).await;
        tools.call("complete", json!({"feature_id": 1})).await;
        let sample = tools
            .call("regression", Value::Null)
            .await
            .into_result()
            .unwrap();
        assert_eq!(sample["count"], 1);

        let resp = tools.call("regression", json!({"limit": 50})).await;
        assert_eq!(kind(&resp), "invalid");
    }

    #[test]
    fn every_tool_is_listed_once() {
        let mut names = TOOL_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), TOOL_NAMES.len());
    }
}
