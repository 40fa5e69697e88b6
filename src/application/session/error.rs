use crate::application::launch::LaunchError;
use std::time::Duration;
use thiserror::Error;

/// Failures of a single tool call or of the transport underneath it.
///
/// These are normal tool-call failures: where possible they are fed back to
/// the model engine as structured results so it can explain them, rather
/// than ending the chat.
#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("tool '{tool}' is not in the allowed tool set for '{server}'")]
    NotAllowed { server: String, tool: String },
    #[error("session with '{server}' is not ready for tool calls")]
    NotReady { server: String },
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("tool server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("tool '{tool}' on '{server}' reported an error: {message}")]
    Failed {
        server: String,
        tool: String,
        message: String,
    },
    #[error("tool server '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("call to '{tool}' on '{server}' timed out after {timeout:?}")]
    Timeout {
        server: String,
        tool: String,
        timeout: Duration,
    },
}

/// Failures of the session lifecycle itself. These are not swallowed: they
/// terminate the current chat attempt with a clear message.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("tool server '{server}' did not complete its handshake within {timeout:?}")]
    StartTimeout { server: String, timeout: Duration },
    #[error("tool server '{server}' failed to start: {source}")]
    Start {
        server: String,
        #[source]
        source: ToolCallError,
    },
}
