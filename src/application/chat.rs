//! Conversation state and the turn dispatch loop.
//!
//! Turns are strictly sequential: state is only well-defined after a fold,
//! so the loop never issues a second turn before the first completes.

use crate::application::agent::Agent;
use crate::infrastructure::engine::{Engine, EngineError, TurnInput};
use crate::domain::types::{TurnItem, Usage};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error};

/// Ordered turn history for one chat lifetime.
///
/// `None` marks a fresh conversation; after the first fold the state always
/// holds the engine's complete item sequence for replay on the next turn.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    items: Option<Vec<TurnItem>>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Option<&[TurnItem]> {
        self.items.as_deref()
    }

    /// Build the next request payload: raw text on the first turn, otherwise
    /// the prior sequence with one new user item appended.
    pub fn next_payload(&self, user_text: &str) -> TurnInput {
        match &self.items {
            None => TurnInput::Text(user_text.to_string()),
            Some(items) => {
                let mut payload = items.clone();
                payload.push(TurnItem::user(user_text));
                TurnInput::Items(payload)
            }
        }
    }

    /// Replace the state with the engine's authoritative sequence. The
    /// engine already merged the submitted items with its own, so appending
    /// here would duplicate history.
    pub fn fold(&mut self, items: Vec<TurnItem>) {
        self.items = Some(items);
    }
}

/// Per-turn diagnostics, extracted best-effort.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub answer: String,
    /// Tool names in invocation order; duplicates are kept and counted.
    pub tools_invoked: Vec<String>,
    /// Absent when the provider reported no usage; never zero-filled.
    pub usage: Option<Usage>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("turn execution failed: {source}")]
    TurnExecution {
        #[source]
        source: EngineError,
    },
    #[error("stdin/stdout I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dispatch one turn end to end.
///
/// On engine failure the state is left unmodified, as if the turn had never
/// been attempted; the caller may retry with the same prior state.
pub async fn dispatch(
    engine: &dyn Engine,
    agent: &Agent,
    state: &mut ConversationState,
    user_text: &str,
) -> Result<TurnReport, ChatError> {
    let payload = state.next_payload(user_text);
    let started = Instant::now();

    let turn = engine
        .run_turn(agent, payload)
        .await
        .map_err(|source| ChatError::TurnExecution { source })?;
    let elapsed = started.elapsed();

    let tools_invoked = turn
        .items
        .iter()
        .filter_map(|item| match item {
            TurnItem::ToolCall { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();

    let report = TurnReport {
        answer: turn.final_output.clone(),
        tools_invoked,
        usage: turn.usage,
        elapsed,
    };
    debug!(
        tools = report.tools_invoked.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "turn dispatched"
    );
    state.fold(turn.items);
    Ok(report)
}

const EXIT_COMMANDS: [&str; 4] = ["/exit", ":q", ":quit", ":exit"];

/// Interactive chat loop over stdin/stdout.
///
/// Never silently hangs: every turn either prints an answer, prints a
/// failure explanation, or ends the chat with a clear message.
pub async fn repl(engine: &dyn Engine, agent: &Agent) -> Result<(), ChatError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut state = ConversationState::new();

    stdout
        .write_all(b"Chat ready. Type /exit to quit.\n\n")
        .await?;

    loop {
        stdout.write_all(b"You: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            stdout.write_all(b"\nBye.\n").await?;
            return Ok(());
        };
        let user = line.trim();
        if user.is_empty() {
            continue;
        }
        if EXIT_COMMANDS.contains(&user.to_lowercase().as_str()) {
            stdout.write_all(b"Bye.\n").await?;
            return Ok(());
        }

        match dispatch(engine, agent, &mut state, user).await {
            Ok(report) => {
                let mut output = String::from("Assistant:\n");
                if report.answer.trim().is_empty() {
                    output.push_str("<no output>\n");
                } else {
                    output.push_str(report.answer.trim());
                    output.push('\n');
                }
                output.push_str(&render_stats(&report));
                output.push('\n');
                stdout.write_all(output.as_bytes()).await?;
            }
            Err(ChatError::TurnExecution { source }) => {
                // State was not folded; the user can simply ask again.
                error!(%source, "turn failed");
                let message = format!("Turn failed: {source}. The conversation is unchanged.\n\n");
                stdout.write_all(message.as_bytes()).await?;
            }
            Err(other) => return Err(other),
        }
        stdout.flush().await?;
    }
}

/// `[tools]`, `[usage]`, and `[time]` lines for one turn.
fn render_stats(report: &TurnReport) -> String {
    let mut stats = String::new();
    if !report.tools_invoked.is_empty() {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for tool in &report.tools_invoked {
            *counts.entry(tool.as_str()).or_default() += 1;
        }
        let rendered: Vec<String> = counts
            .iter()
            .map(|(name, count)| format!("{name}: {count}"))
            .collect();
        stats.push_str(&format!("[tools] {{{}}}\n", rendered.join(", ")));
    }
    if let Some(usage) = &report.usage {
        stats.push_str(&format!(
            "[usage] in={}, out={}, total={}\n",
            usage.input_tokens, usage.output_tokens, usage.total_tokens
        ));
    }
    stats.push_str(&format!("[time] {:.2}s\n", report.elapsed.as_secs_f64()));
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agent::AgentDefinition;
    use crate::application::session::{ToolCallError, ToolServerSession, ToolTransport};
    use crate::config::AppConfig;
    use crate::domain::types::ToolInfo;
    use crate::domain::variant::builtin;
    use crate::infrastructure::engine::EngineTurn;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    struct IdleTransport;

    #[async_trait]
    impl ToolTransport for IdleTransport {
        async fn start(&self) -> Result<(), ToolCallError> {
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolCallError> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, _tool: &str, _arguments: Value) -> Result<Value, ToolCallError> {
            Ok(Value::Null)
        }

        async fn shutdown(&self) {}
    }

    fn test_agent() -> Agent {
        let variant = builtin("anomalies").expect("variant");
        let config = AppConfig::default();
        let session = Arc::new(ToolServerSession::new(
            variant.name.clone(),
            Arc::new(IdleTransport),
            variant.resolved_tools(),
            Duration::from_secs(1),
        ));
        AgentDefinition::for_variant(&variant, &config).bind(session)
    }

    /// Engine stub that echoes the user text and records every payload.
    #[derive(Default)]
    struct ScriptedEngine {
        payloads: Mutex<Vec<TurnInput>>,
        fail: bool,
        tool_items: bool,
        usage: Option<Usage>,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn run_turn(
            &self,
            _agent: &Agent,
            input: TurnInput,
        ) -> Result<EngineTurn, EngineError> {
            self.payloads.lock().expect("payloads").push(input.clone());
            if self.fail {
                return Err(EngineError::InvalidResponse {
                    provider: "stub".to_string(),
                    reason: "scripted failure".to_string(),
                });
            }

            let mut items = input.into_items();
            let user_text = items
                .iter()
                .rev()
                .find_map(|item| match item {
                    TurnItem::User { content } => Some(content.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            if self.tool_items {
                items.push(TurnItem::ToolCall {
                    call_id: "call-1".to_string(),
                    name: "query_anomalies".to_string(),
                    arguments: json!({ "sql": "SELECT 1" }),
                });
                items.push(TurnItem::ToolResult {
                    call_id: "call-1".to_string(),
                    output: json!({ "rows": 0 }),
                });
                items.push(TurnItem::ToolCall {
                    call_id: "call-2".to_string(),
                    name: "query_anomalies".to_string(),
                    arguments: json!({ "sql": "SELECT 2" }),
                });
                items.push(TurnItem::ToolResult {
                    call_id: "call-2".to_string(),
                    output: json!({ "rows": 1 }),
                });
            }
            let answer = format!("echo: {user_text}");
            items.push(TurnItem::assistant(answer.clone()));
            Ok(EngineTurn {
                items,
                final_output: answer,
                usage: self.usage,
            })
        }
    }

    #[tokio::test]
    async fn two_turn_payload_contains_both_user_messages_in_order() {
        let engine = ScriptedEngine::default();
        let agent = test_agent();
        let mut state = ConversationState::new();

        dispatch(&engine, &agent, &mut state, "A").await.expect("turn 1");
        dispatch(&engine, &agent, &mut state, "B").await.expect("turn 2");

        let payloads = engine.payloads.lock().expect("payloads").clone();
        assert_eq!(payloads[0], TurnInput::Text("A".to_string()));
        let TurnInput::Items(second) = &payloads[1] else {
            panic!("second payload must replay items");
        };
        let users: Vec<&str> = second
            .iter()
            .filter_map(|item| match item {
                TurnItem::User { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(users, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn fold_overwrites_rather_than_appending() {
        let engine = ScriptedEngine::default();
        let agent = test_agent();
        let mut state = ConversationState::new();

        dispatch(&engine, &agent, &mut state, "A").await.expect("turn 1");
        // user + assistant, nothing duplicated.
        assert_eq!(state.items().expect("state").len(), 2);

        dispatch(&engine, &agent, &mut state, "B").await.expect("turn 2");
        assert_eq!(state.items().expect("state").len(), 4);
    }

    #[tokio::test]
    async fn replaying_folded_state_matches_the_live_sequence() {
        let engine = ScriptedEngine::default();
        let agent = test_agent();

        let mut live = ConversationState::new();
        dispatch(&engine, &agent, &mut live, "A").await.expect("turn 1");
        dispatch(&engine, &agent, &mut live, "B").await.expect("turn 2");

        // Replay from empty through the same folds.
        let mut replay = ConversationState::new();
        replay.fold(live.items().expect("live items")[..2].to_vec());
        replay.fold(live.items().expect("live items").to_vec());

        assert_eq!(replay.items(), live.items());
    }

    #[tokio::test]
    async fn failed_turn_leaves_state_untouched() {
        let ok_engine = ScriptedEngine::default();
        let agent = test_agent();
        let mut state = ConversationState::new();
        dispatch(&ok_engine, &agent, &mut state, "A").await.expect("turn 1");
        let before = state.items().expect("state").to_vec();

        let failing = ScriptedEngine {
            fail: true,
            ..ScriptedEngine::default()
        };
        let err = dispatch(&failing, &agent, &mut state, "B")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ChatError::TurnExecution { .. }));
        assert_eq!(state.items().expect("state"), before.as_slice());

        // Retry with the same prior state succeeds.
        dispatch(&ok_engine, &agent, &mut state, "B").await.expect("retry");
    }

    #[tokio::test]
    async fn diagnostics_count_duplicate_tool_invocations() {
        let engine = ScriptedEngine {
            tool_items: true,
            usage: Some(Usage {
                input_tokens: 100,
                output_tokens: 20,
                total_tokens: 120,
            }),
            ..ScriptedEngine::default()
        };
        let agent = test_agent();
        let mut state = ConversationState::new();

        let report = dispatch(&engine, &agent, &mut state, "scan").await.expect("turn");
        assert_eq!(
            report.tools_invoked,
            vec!["query_anomalies".to_string(), "query_anomalies".to_string()]
        );
        let stats = render_stats(&report);
        assert!(stats.contains("[tools] {query_anomalies: 2}"));
        assert!(stats.contains("[usage] in=100, out=20, total=120"));
        assert!(stats.contains("[time] "));
    }

    #[tokio::test]
    async fn absent_usage_is_omitted_not_zeroed() {
        let engine = ScriptedEngine::default();
        let agent = test_agent();
        let mut state = ConversationState::new();
        let report = dispatch(&engine, &agent, &mut state, "hi").await.expect("turn");
        assert!(report.usage.is_none());
        assert!(!render_stats(&report).contains("[usage]"));
    }
}
