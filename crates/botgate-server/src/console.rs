//! JSON-lines transport over a byte stream (stdin/stdout for the binary).
//!
//! Each input line is either a [`QueryRequest`] or `{"stats": "<key prefix>"}`. Every line gets
//! exactly one output line, in input order.

use anyhow::{Context, Result};
use botgate_metrics::ServerCounters;
use botgate_router::{ManagerHandle, QueryError, QueryRequest, QueryResult};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConsoleCommand {
    Stats { stats: String },
    Query(QueryRequest),
}

/// Bot API style response body for a query result.
pub fn reply_body(result: &QueryResult) -> serde_json::Value {
    match result {
        Ok(value) => json!({ "ok": true, "result": value }),
        Err(err) => {
            let mut body = json!({
                "ok": false,
                "error_code": err.status(),
                "description": err.to_string(),
            });
            if let Some(retry_after) = err.retry_after() {
                body["parameters"] = json!({ "retry_after": retry_after });
            }
            body
        }
    }
}

/// Serves commands from `input` until it is exhausted.
pub async fn serve<R, W>(
    handle: &ManagerHandle,
    counters: &ServerCounters,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("read console input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ConsoleCommand>(line) {
            Ok(ConsoleCommand::Stats { stats }) => serde_json::to_value(handle.stats(stats).await)?,
            Ok(ConsoleCommand::Query(request)) => {
                counters.add_pending_queries(1);
                let result = handle.route(request).recv().await;
                counters.sub_pending_queries(1);
                reply_body(&result)
            }
            // The parser's message may quote the input, which carries a token.
            Err(err) => reply_body(&Err(QueryError::BadRequest(format!(
                "can't parse request at column {}",
                err.column()
            )))),
        };

        let mut text = serde_json::to_string(&response)?;
        text.push('\n');
        output
            .write_all(text.as_bytes())
            .await
            .context("write console output")?;
        output.flush().await.context("flush console output")?;
    }
    Ok(())
}
