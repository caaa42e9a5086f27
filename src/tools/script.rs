//! Script tool engine.
//!
//! Runs the tool source in a python subprocess. Arguments and the selected
//! environment variables arrive as one JSON document on stdin; the harness
//! prelude decodes them into `args` and `env` before the user source runs.
//! The last JSON document on stdout is the return value. The child is
//! killed on timeout and on cancellation.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::{io::AsyncWriteExt, process::Command, sync::Semaphore};
use tracing::debug;

use crate::{
    error::{GatewayError, GatewayResult},
    protocols::mcp::CallToolResult,
    tools::{excerpt, ScriptTool, ToolError},
    vmcp::context::{Interrupted, InvocationContext},
};

/// Prepended to every script; binds the input contract.
const PRELUDE: &str = r#"import sys, json
_input = json.load(sys.stdin)
args = _input.get("args") or {}
env = _input.get("env") or {}
"#;

pub struct ScriptEngine {
    python_bin: String,
    script_timeout: Duration,
    /// Global bound on concurrently running script tools.
    semaphore: Arc<Semaphore>,
}

impl ScriptEngine {
    pub fn new(python_bin: impl Into<String>, script_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            python_bin: python_bin.into(),
            script_timeout,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn execute(
        &self,
        tool: &ScriptTool,
        args: &Value,
        ctx: &InvocationContext,
    ) -> GatewayResult<CallToolResult> {
        let permit = match ctx.run(Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GatewayError::Internal("script engine shut down".to_string()))
            }
            Err(Interrupted::DeadlineExceeded) => return Err(ToolError::Timeout.into()),
            Err(Interrupted::Cancelled) => return Err(GatewayError::Cancelled),
        };

        // Only the declared environment variables cross into the sandbox.
        let mut env: HashMap<&str, &str> = HashMap::new();
        for name in &tool.env_reads {
            if let Some(value) = ctx.env_value(name) {
                env.insert(name.as_str(), value);
            }
        }
        let payload = serde_json::to_vec(&json!({ "args": args, "env": env }))
            .map_err(|e| GatewayError::Internal(format!("encode script input: {}", e)))?;

        let source = format!("{}{}", PRELUDE, tool.source);
        let mut child = Command::new(&self.python_bin)
            .arg("-I") // isolated mode: no user site, no cwd on sys.path
            .arg("-c")
            .arg(&source)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Crash {
                detail: format!("spawn {}: {}", self.python_bin, e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| ToolError::Crash {
                detail: format!("write script input: {}", e),
            })?;
            // Close stdin so json.load returns.
            drop(stdin);
        }

        let bound = self.script_timeout.min(ctx.remaining());
        let output = tokio::select! {
            biased;
            _ = ctx.cancellation_token().cancelled() => {
                // Dropping the wait future drops the child; kill_on_drop
                // reaps it.
                debug!("script tool '{}' cancelled", tool.name);
                return Err(GatewayError::Cancelled);
            }
            _ = tokio::time::sleep(bound) => {
                debug!("script tool '{}' exceeded {}s", tool.name, bound.as_secs());
                return Err(ToolError::Timeout.into());
            }
            output = child.wait_with_output() => output.map_err(|e| ToolError::Crash {
                detail: format!("wait for script: {}", e),
            })?,
        };
        drop(permit);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Crash {
                detail: format!(
                    "exit status {}: {}",
                    output.status.code().unwrap_or(-1),
                    excerpt(stderr.trim())
                ),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = parse_script_output(&stdout)?;
        Ok(to_result(value))
    }
}

/// Return value contract: the whole stdout as JSON if it parses, otherwise
/// the last line that parses as JSON, otherwise the raw text.
fn parse_script_output(stdout: &str) -> Result<Value, ToolError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ToolError::BadOutput {
            detail: "script produced no output".to_string(),
        });
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    for line in trimmed.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            return Ok(value);
        }
    }
    Ok(Value::String(trimmed.to_string()))
}

fn to_result(value: Value) -> CallToolResult {
    match value {
        Value::String(text) => CallToolResult::text(text),
        other => CallToolResult {
            content: vec![crate::protocols::mcp::ContentBlock::text(other.to_string())],
            structured_content: Some(other),
            is_error: None,
        },
    }
}
