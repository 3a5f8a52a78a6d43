//! Line-delimited JSON tool server.
//!
//! Reads one request per line, `{"id": <any>, "tool": "<name>", "args": {..}}`,
//! and answers each with one line, `{"id": <same>, "ok": .., ...}`. Requests
//! are answered in order. The server returns at end of input.

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::tools::{ToolDispatcher, ToolResponse};

/// One tool request.
#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Serve tool requests until `reader` reaches end of input.
pub async fn serve<R, W>(tools: &ToolDispatcher, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0_u64;

    info!(yolo = tools.yolo(), "Tool server ready");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (id, response) = match serde_json::from_str::<ToolRequest>(line) {
            Ok(req) => {
                let response = tools.call(&req.tool, req.args).await;
                (req.id, response)
            }
            Err(e) => {
                warn!(error = %e, "Unparseable tool request");
                (
                    Value::Null,
                    ToolResponse::error("invalid", format!("bad request: {e}")),
                )
            }
        };

        let out = response_line(id, &response)?;
        writer.write_all(out.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        handled += 1;
    }

    debug!(handled, "Tool server input closed");
    Ok(())
}

fn response_line(id: Value, response: &ToolResponse) -> std::io::Result<String> {
    let mut obj = Map::new();
    obj.insert("id".into(), id);
    if let Value::Object(fields) = serde_json::to_value(response)? {
        obj.extend(fields);
    }
    Ok(Value::Object(obj).to_string())
}
