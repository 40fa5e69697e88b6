//! Tool-server session: one subprocess, one lifecycle, one filtered catalog.

pub mod error;
pub mod process;
pub mod transport;

pub use error::{SessionError, ToolCallError};
pub use process::McpTransport;
pub use transport::ToolTransport;

use crate::application::launch::{self, LaunchPlan};
use crate::config::AppConfig;
use crate::domain::types::ToolInfo;
use crate::domain::variant::VariantDescriptor;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Lifecycle of a session. Tool calls are only valid in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Starting,
    Ready,
    Closing,
    Closed,
    Failed,
}

/// Owns one tool-server subprocess for the duration of a chat.
///
/// The catalog is fetched once at startup, filtered to the variant's
/// resolved tool set, and never re-fetched mid-session. Out-of-policy tool
/// names are rejected locally before they reach the transport.
pub struct ToolServerSession {
    server: String,
    transport: Arc<dyn ToolTransport>,
    allowed: Vec<String>,
    catalog: Mutex<Vec<ToolInfo>>,
    call_timeout: Duration,
    state: Mutex<SessionState>,
}

impl ToolServerSession {
    pub fn new(
        server: impl Into<String>,
        transport: Arc<dyn ToolTransport>,
        allowed: Vec<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            transport,
            allowed,
            catalog: Mutex::new(Vec::new()),
            call_timeout,
            state: Mutex::new(SessionState::Unstarted),
        }
    }

    /// Build a session for a variant over the real MCP stdio transport.
    ///
    /// Fails with `LaunchError::TargetMissing` before any subprocess is
    /// spawned when the launcher script does not exist.
    pub fn for_variant(
        variant: &VariantDescriptor,
        config: &AppConfig,
    ) -> Result<Arc<Self>, SessionError> {
        let plan: LaunchPlan = launch::resolve(variant, config)?;
        let timeout = plan.timeout;
        let transport = Arc::new(McpTransport::new(variant.name.clone(), plan));
        Ok(Arc::new(Self::new(
            variant.name.clone(),
            transport,
            variant.resolved_tools(),
            timeout,
        )))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("session state lock");
        let from = *state;
        debug!(server = %self.server, ?from, to = ?next, "session state transition");
        *state = next;
    }

    /// Spawn the subprocess, complete the handshake, and cache the filtered
    /// catalog. Bounded by the session timeout; on timeout the subprocess is
    /// killed, never left running.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.set_state(SessionState::Starting);

        let startup = async {
            self.transport.start().await?;
            self.transport.list_tools().await
        };
        let served = match timeout(self.call_timeout, startup).await {
            Err(_) => {
                warn!(server = %self.server, "handshake timed out; killing tool server");
                self.transport.shutdown().await;
                self.set_state(SessionState::Failed);
                return Err(SessionError::StartTimeout {
                    server: self.server.clone(),
                    timeout: self.call_timeout,
                });
            }
            Ok(Err(source)) => {
                self.transport.shutdown().await;
                self.set_state(SessionState::Failed);
                return Err(SessionError::Start {
                    server: self.server.clone(),
                    source,
                });
            }
            Ok(Ok(served)) => served,
        };

        // Expose the catalog in resolved-set order so the surface is
        // deterministic regardless of how the server ordered its reply.
        let filtered: Vec<ToolInfo> = self
            .allowed
            .iter()
            .filter_map(|name| served.iter().find(|tool| &tool.name == name).cloned())
            .collect();
        info!(
            server = %self.server,
            served = served.len(),
            exposed = filtered.len(),
            "tool catalog cached"
        );
        *self.catalog.lock().expect("catalog lock") = filtered;

        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// The cached, policy-filtered catalog. Valid only in `Ready`.
    pub fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolCallError> {
        self.ensure_ready()?;
        Ok(self.catalog.lock().expect("catalog lock").clone())
    }

    /// Invoke one tool. Names outside the resolved set or the cached catalog
    /// are rejected here, without touching the transport.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolCallError> {
        self.ensure_ready()?;
        if !self.allowed.iter().any(|name| name == tool) || !self.catalog_has(tool) {
            return Err(ToolCallError::NotAllowed {
                server: self.server.clone(),
                tool: tool.to_string(),
            });
        }

        debug!(server = %self.server, tool, "dispatching tool call");
        match timeout(self.call_timeout, self.transport.call_tool(tool, arguments)).await {
            Err(_) => Err(ToolCallError::Timeout {
                server: self.server.clone(),
                tool: tool.to_string(),
                timeout: self.call_timeout,
            }),
            Ok(result) => result,
        }
    }

    /// Terminate the subprocess and release the channel. Idempotent; runs on
    /// every exit path of `scoped`.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().expect("session state lock");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.transport.shutdown().await;
        self.set_state(SessionState::Closed);
        info!(server = %self.server, "session closed");
    }

    fn ensure_ready(&self) -> Result<(), ToolCallError> {
        if self.state() != SessionState::Ready {
            return Err(ToolCallError::NotReady {
                server: self.server.clone(),
            });
        }
        Ok(())
    }

    fn catalog_has(&self, tool: &str) -> bool {
        self.catalog
            .lock()
            .expect("catalog lock")
            .iter()
            .any(|info| info.name == tool)
    }
}

/// Run `body` against a started session, closing it on every exit path.
///
/// A start failure tears the transport down inside `start` itself. If the
/// whole future is dropped mid-body, the transport's drop backstop still
/// kills the subprocess.
pub async fn scoped<T, E, F, Fut>(session: Arc<ToolServerSession>, body: F) -> Result<T, E>
where
    E: From<SessionError>,
    F: FnOnce(Arc<ToolServerSession>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    session.start().await.map_err(E::from)?;
    let result = body(Arc::clone(&session)).await;
    session.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport stub that records every interaction.
    #[derive(Default)]
    struct StubTransport {
        catalog: Vec<ToolInfo>,
        calls: Mutex<Vec<String>>,
        shutdowns: AtomicUsize,
        hang_on_start: bool,
        fail_calls: bool,
    }

    impl StubTransport {
        fn with_catalog(names: &[&str]) -> Self {
            Self {
                catalog: names.iter().map(|n| ToolInfo::named(*n)).collect(),
                ..Self::default()
            }
        }

        fn recorded_calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ToolTransport for StubTransport {
        async fn start(&self) -> Result<(), ToolCallError> {
            if self.hang_on_start {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolCallError> {
            Ok(self.catalog.clone())
        }

        async fn call_tool(&self, tool: &str, _arguments: Value) -> Result<Value, ToolCallError> {
            self.calls.lock().expect("calls lock").push(tool.to_string());
            if self.fail_calls {
                return Err(ToolCallError::Failed {
                    server: "stub".to_string(),
                    tool: tool.to_string(),
                    message: "stub failure".to_string(),
                });
            }
            Ok(Value::String("ok".to_string()))
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session_over(
        transport: Arc<StubTransport>,
        allowed: &[&str],
    ) -> Arc<ToolServerSession> {
        Arc::new(ToolServerSession::new(
            "stub",
            transport,
            allowed.iter().map(|n| n.to_string()).collect(),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn catalog_is_filtered_and_ordered_by_the_resolved_set() {
        let transport = Arc::new(StubTransport::with_catalog(&[
            "query_anomalies",
            "get_table_schema",
            "drop_everything",
        ]));
        let session = session_over(
            Arc::clone(&transport),
            &["get_table_schema", "query_anomalies"],
        );
        session.start().await.expect("start");
        assert_eq!(session.state(), SessionState::Ready);

        let names: Vec<String> = session
            .list_tools()
            .expect("catalog")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["get_table_schema", "query_anomalies"]);
    }

    #[tokio::test]
    async fn out_of_policy_calls_never_reach_the_transport() {
        let transport = Arc::new(StubTransport::with_catalog(&[
            "get_table_schema",
            "drop_everything",
        ]));
        let session = session_over(Arc::clone(&transport), &["get_table_schema"]);
        session.start().await.expect("start");

        let err = session
            .call_tool("drop_everything", Value::Null)
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, ToolCallError::NotAllowed { .. }));
        assert!(transport.recorded_calls().is_empty());

        session
            .call_tool("get_table_schema", Value::Null)
            .await
            .expect("allowed call");
        assert_eq!(transport.recorded_calls(), vec!["get_table_schema"]);
    }

    #[tokio::test]
    async fn calls_before_start_are_rejected() {
        let transport = Arc::new(StubTransport::with_catalog(&["get_table_schema"]));
        let session = session_over(transport, &["get_table_schema"]);
        let err = session
            .call_tool("get_table_schema", Value::Null)
            .await
            .expect_err("not ready");
        assert!(matches!(err, ToolCallError::NotReady { .. }));
    }

    #[tokio::test]
    async fn teardown_runs_exactly_once_even_when_the_body_fails() {
        let transport = Arc::new(StubTransport {
            fail_calls: true,
            ..StubTransport::with_catalog(&["query_audit"])
        });
        let session = session_over(Arc::clone(&transport), &["query_audit"]);

        let result: Result<(), SessionError> =
            scoped(Arc::clone(&session), |session| async move {
                session
                    .call_tool("query_audit", Value::Null)
                    .await
                    .expect_err("stub call fails");
                Err(SessionError::StartTimeout {
                    server: "stub".to_string(),
                    timeout: Duration::from_secs(1),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Closed);

        // A second close is a no-op.
        session.close().await;
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handshake_fails_with_start_timeout_and_kills_the_child() {
        let transport = Arc::new(StubTransport {
            hang_on_start: true,
            ..StubTransport::with_catalog(&["query_audit"])
        });
        let session = session_over(Arc::clone(&transport), &["query_audit"]);

        let err = session.start().await.expect_err("must time out");
        assert!(matches!(err, SessionError::StartTimeout { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
    }
}
