//! MCP stdio transport: newline-delimited JSON-RPC 2.0 over a child process.

use super::error::ToolCallError;
use super::transport::ToolTransport;
use crate::application::launch::LaunchPlan;
use crate::domain::types::ToolInfo;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// Stdio transport to one MCP tool server. One instance, one subprocess.
#[derive(Clone)]
pub struct McpTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    server: String,
    plan: LaunchPlan,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, ToolCallError>>>>,
    id_counter: AtomicU64,
}

impl McpTransport {
    pub fn new(server: impl Into<String>, plan: LaunchPlan) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                server: server.into(),
                plan,
                child: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
            }),
        }
    }
}

#[async_trait]
impl ToolTransport for McpTransport {
    async fn start(&self) -> Result<(), ToolCallError> {
        let inner = &self.inner;
        let mut command = Command::new(&inner.plan.program);
        command
            .args(&inner.plan.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &inner.plan.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ToolCallError::Spawn {
            server: inner.server.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| inner.transport_error("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| inner.transport_error("failed to capture server stdout"))?;

        {
            let mut writer = inner.writer.lock().await;
            *writer = Some(BufWriter::new(stdin));
        }
        {
            let mut slot = inner.child.lock().await;
            *slot = Some(child);
        }

        let reader = Arc::clone(inner);
        tokio::spawn(async move {
            reader.reader_loop(stdout).await;
        });

        match inner.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                inner.reset().await;
                Err(err)
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolCallError> {
        let result = self.inner.send_request("tools/list", json!({})).await?;
        Ok(parse_catalog(&result))
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolCallError> {
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        let result = self.inner.send_request("tools/call", params).await?;
        normalize_call_result(&self.inner.server, tool, result)
    }

    async fn shutdown(&self) {
        self.inner.reset().await;
    }
}

impl TransportInner {
    async fn handshake(self: &Arc<Self>) -> Result<(), ToolCallError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.send_request("initialize", params).await?;
        self.send_notification("notifications/initialized", json!({}))
            .await
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            let Some(raw) = item else { break };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => self.process_inbound(value).await,
                Err(source) => {
                    // Launcher scripts sometimes leak banner output onto
                    // stdout before the server takes over.
                    debug!(
                        server = %self.server,
                        line = trimmed,
                        %source,
                        "skipping non-JSON line from tool server"
                    );
                }
            }
        }

        self.reset().await;
    }

    async fn process_inbound(&self, value: Value) {
        if let Some(id) = value.get("id") {
            if value.get("method").is_some() {
                self.handle_server_request(id.clone(), &value).await;
            } else if let Some(key) = response_key(id) {
                self.handle_response(key, value).await;
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            // The catalog is cached once per session; a mid-session change
            // notification is logged, not acted on.
            debug!(server = %self.server, method, "ignoring notification from tool server");
        }
    }

    async fn handle_response(&self, key: u64, value: Value) {
        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };
        let Some(sender) = responder else {
            debug!(server = %self.server, response_id = key, "response for unknown request");
            return;
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let _ = sender.send(Err(ToolCallError::Rpc {
                server: self.server.clone(),
                code,
                message,
            }));
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let _ = sender.send(Ok(result));
        }
    }

    async fn handle_server_request(&self, id: Value, value: &Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let outcome = if method == "ping" {
            self.send_raw(json!({ "jsonrpc": "2.0", "id": id, "result": {} }))
                .await
        } else {
            warn!(server = %self.server, method, "tool server sent unsupported request");
            self.send_raw(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("client does not implement method '{method}'"),
                }
            }))
            .await
        };
        if let Err(err) = outcome {
            warn!(server = %self.server, %err, "failed to answer server request");
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ToolCallError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.send_raw(payload).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ToolCallError::Terminated {
                server: self.server.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ToolCallError> {
        self.send_raw(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        }))
        .await
    }

    async fn send_raw(&self, message: Value) -> Result<(), ToolCallError> {
        let encoded =
            serde_json::to_string(&message).map_err(|source| ToolCallError::InvalidJson {
                server: self.server.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("writer not initialised"))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))
    }

    /// Kill and reap the subprocess, drop the channel, and fail every
    /// in-flight request. Safe to call repeatedly and from any path.
    async fn reset(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let child = {
            let mut slot = self.child.lock().await;
            slot.take()
        };
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                debug!(
                    server = %self.server,
                    %err,
                    "failed to kill tool server (may have already exited)"
                );
            }
            let _ = child.wait().await;
        }

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolCallError::Terminated {
                server: self.server.clone(),
            }));
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ToolCallError {
        ToolCallError::Transport {
            server: self.server.clone(),
            message: message.into(),
        }
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        // Backstop for abandoned sessions: `kill_on_drop` covers the child
        // handle itself, but only if it is still in the slot.
        if let Ok(mut slot) = self.child.try_lock() {
            if let Some(child) = slot.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

fn response_key(id: &Value) -> Option<u64> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn parse_catalog(result: &Value) -> Vec<ToolInfo> {
    let Some(entries) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            Some(ToolInfo {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .map(|text| text.to_string()),
                input_schema: tool.get("inputSchema").cloned(),
            })
        })
        .collect()
}

/// Flatten a `tools/call` result to a single value.
///
/// Structured content wins; otherwise text parts are joined and, when the
/// text looks like JSON, parsed opportunistically — a parse failure still
/// yields the raw text, never an error.
fn normalize_call_result(server: &str, tool: &str, result: Value) -> Result<Value, ToolCallError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Err(ToolCallError::Failed {
            server: server.to_string(),
            tool: tool.to_string(),
            message: if text.is_empty() {
                "tool reported an error without detail".to_string()
            } else {
                text
            },
        });
    }

    if let Some(structured) = result.get("structuredContent") {
        if !structured.is_null() {
            return Ok(structured.clone());
        }
    }
    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
