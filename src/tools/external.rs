//! External tool sources: subprocess-hosted tools speaking a newline-delimited
//! JSON protocol.
//!
//! Each request/response is a single JSON object terminated by `\n`:
//!
//! ```text
//! → {"id":"1","method":"invoke","params":{"tool":"x","args":{...}}}\n
//! ← {"id":"1","result":{...}}\n
//! ← {"id":"1","error":{"code":1,"message":"..."}}\n
//! ```
//!
//! A closed transport surfaces as [`ExternalError::TransportClosed`]; the
//! router's contract is one reconnect-and-retry before the error is returned
//! to the model.  That retry lives in [`ExternalToolHandler`].

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::security::RiskLevel;

use super::traits::{ToolCallContext, ToolHandler};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalError {
    /// The subprocess pipe closed; a reconnect may succeed.
    #[error("external transport closed: {0}")]
    TransportClosed(String),

    #[error("external protocol error: {0}")]
    Protocol(String),

    #[error("failed to spawn external source: {0}")]
    Spawn(String),
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: String,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

impl WireResponse {
    pub fn into_result(self) -> Result<Value, ExternalError> {
        if let Some(err) = self.error {
            Err(ExternalError::Protocol(format!(
                "[{}] {}",
                err.code, err.message
            )))
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// A tool advertised by an external source's `discover` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Opaque JSON Schema for the parameters.
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub supports_parallel: bool,
}

// ─── ExternalToolSource ───────────────────────────────────────────────────────

/// A transport hosting externally-defined tools.
#[async_trait]
pub trait ExternalToolSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<DiscoveredTool>, ExternalError>;
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ExternalError>;
    async fn reconnect(&self) -> Result<(), ExternalError>;
}

// ─── ExternalToolHandler ──────────────────────────────────────────────────────

/// Adapter from the router's [`ToolHandler`] contract onto an external source.
///
/// Retries exactly once after a reconnect when the transport reports closed,
/// then surfaces the error.
pub struct ExternalToolHandler {
    source: Arc<dyn ExternalToolSource>,
    /// Name on the wire, before registry sanitization/prefixing.
    remote_name: String,
}

impl ExternalToolHandler {
    pub fn new(source: Arc<dyn ExternalToolSource>, remote_name: impl Into<String>) -> Self {
        Self {
            source,
            remote_name: remote_name.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for ExternalToolHandler {
    async fn execute(&self, args: Value, _ctx: &ToolCallContext) -> Result<Value, String> {
        match self.source.invoke(&self.remote_name, args.clone()).await {
            Ok(value) => Ok(value),
            Err(ExternalError::TransportClosed(first)) => {
                log::warn!(
                    "external tool '{}' transport closed ({first}), reconnecting",
                    self.remote_name
                );
                self.source
                    .reconnect()
                    .await
                    .map_err(|e| e.to_string())?;
                self.source
                    .invoke(&self.remote_name, args)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(other) => Err(other.to_string()),
        }
    }
}

// ─── StdioToolSource ──────────────────────────────────────────────────────────

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// External source backed by a child process on stdin/stdout.
pub struct StdioToolSource {
    command: String,
    args: Vec<String>,
    io: Mutex<Option<ChildIo>>,
}

impl StdioToolSource {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            io: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<ChildIo, ExternalError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExternalError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExternalError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExternalError::Spawn("child stdout unavailable".to_string()))?;
        Ok(ChildIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ExternalError> {
        let mut guard = self.io.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let io = guard
            .as_mut()
            .ok_or_else(|| ExternalError::Spawn("source not connected".to_string()))?;

        let request = WireRequest {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| ExternalError::Protocol(e.to_string()))?;
        line.push('\n');

        if let Err(e) = io.stdin.write_all(line.as_bytes()).await {
            *guard = None;
            return Err(ExternalError::TransportClosed(e.to_string()));
        }
        if let Err(e) = io.stdin.flush().await {
            *guard = None;
            return Err(ExternalError::TransportClosed(e.to_string()));
        }

        let mut response_line = String::new();
        match io.stdout.read_line(&mut response_line).await {
            Ok(0) => {
                *guard = None;
                return Err(ExternalError::TransportClosed(
                    "source closed stdout".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                *guard = None;
                return Err(ExternalError::TransportClosed(e.to_string()));
            }
        }

        let response: WireResponse = serde_json::from_str(&response_line).map_err(|e| {
            ExternalError::Protocol(format!("bad response: {e} (raw: {response_line:?})"))
        })?;
        response.into_result()
    }
}

#[async_trait]
impl ExternalToolSource for StdioToolSource {
    async fn discover(&self) -> Result<Vec<DiscoveredTool>, ExternalError> {
        let value = self.request("discover", Value::Null).await?;
        serde_json::from_value(value).map_err(|e| ExternalError::Protocol(e.to_string()))
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ExternalError> {
        self.request("invoke", json!({"tool": tool, "args": args}))
            .await
    }

    async fn reconnect(&self) -> Result<(), ExternalError> {
        let mut guard = self.io.lock().await;
        if let Some(mut io) = guard.take() {
            let _ = io.child.start_kill();
        }
        *guard = Some(self.spawn()?);
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
