use super::error::ToolCallError;
use crate::domain::types::ToolInfo;
use async_trait::async_trait;
use serde_json::Value;

/// Byte-stream channel to one tool-server subprocess.
///
/// The session layer owns policy, timeouts, and lifecycle ordering; the
/// transport only moves requests and responses. Kept as a trait so tests can
/// substitute a recording stub for the real subprocess.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Spawn the subprocess and complete the protocol handshake.
    async fn start(&self) -> Result<(), ToolCallError>;

    /// Fetch the server's full tool catalog.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolCallError>;

    /// Invoke one tool and return its normalised result.
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolCallError>;

    /// Terminate the subprocess and release the channel. Idempotent.
    async fn shutdown(&self);
}
