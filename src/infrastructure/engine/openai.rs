//! OpenAI-compatible chat-completions engine with a bounded tool loop.

use super::{Engine, EngineError, EngineTurn, TurnInput};
use crate::application::agent::Agent;
use crate::config::AppConfig;
use crate::domain::types::{ToolInfo, TurnItem, Usage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const API_PATH: &str = "/v1/chat/completions";

pub struct OpenAiEngine {
    http: reqwest::Client,
    endpoint: String,
    model_fallback: String,
    api_key_env: String,
    max_tool_steps: usize,
}

impl OpenAiEngine {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            model_fallback: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            max_tool_steps: config.max_tool_steps,
        }
    }

    fn build_url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        format!("{base}{API_PATH}")
    }

    fn api_key(&self) -> Result<String, EngineError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| EngineError::MissingApiKey {
                provider: self.endpoint.clone(),
                env: self.api_key_env.clone(),
            })
    }

    async fn complete(
        &self,
        model: &str,
        temperature: f32,
        messages: &[Value],
        tools: &[Value],
    ) -> Result<CompletionResponse, EngineError> {
        let mut payload = json!({
            "model": model,
            "temperature": temperature,
            "messages": messages,
            "stream": false,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.to_vec());
        }

        debug!(model, messages = messages.len(), "sending completion request");
        self.http
            .post(self.build_url())
            .header("Authorization", format!("Bearer {}", self.api_key()?))
            .json(&payload)
            .send()
            .await
            .map_err(|source| EngineError::Network {
                provider: self.endpoint.clone(),
                source,
            })?
            .error_for_status()
            .map_err(|source| EngineError::Network {
                provider: self.endpoint.clone(),
                source,
            })?
            .json()
            .await
            .map_err(|source| EngineError::Network {
                provider: self.endpoint.clone(),
                source,
            })
    }
}

#[async_trait]
impl Engine for OpenAiEngine {
    async fn run_turn(&self, agent: &Agent, input: TurnInput) -> Result<EngineTurn, EngineError> {
        let definition = agent.definition();
        let model = if definition.model.is_empty() {
            self.model_fallback.clone()
        } else {
            definition.model.clone()
        };
        let catalog = agent
            .session()
            .list_tools()
            .map_err(|source| EngineError::Session { source })?;
        let tools = tool_declarations(&catalog);

        let mut items = input.into_items();
        let mut messages = wire_messages(&definition.instructions, &items);
        let mut usage: Option<Usage> = None;

        let mut steps_used = 0;
        loop {
            let response = self
                .complete(&model, definition.temperature, &messages, &tools)
                .await?;
            if let Some(reported) = response.usage {
                usage.get_or_insert_with(Usage::default).add(reported.into());
            }
            let message = response
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message)
                .ok_or_else(|| EngineError::InvalidResponse {
                    provider: self.endpoint.clone(),
                    reason: "response carried no choices".to_string(),
                })?;

            if message.tool_calls.is_empty() {
                let final_output = message.content.unwrap_or_default();
                items.push(TurnItem::assistant(final_output.clone()));
                info!(agent = %definition.name, "turn complete");
                return Ok(EngineTurn {
                    items,
                    final_output,
                    usage,
                });
            }

            if steps_used >= self.max_tool_steps {
                warn!(
                    agent = %definition.name,
                    limit = self.max_tool_steps,
                    "model kept requesting tools past the step limit"
                );
                return Err(EngineError::TooManySteps {
                    limit: self.max_tool_steps,
                });
            }
            steps_used += 1;

            messages.push(assistant_tool_call_message(&message.tool_calls));
            for call in message.tool_calls {
                let arguments: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                items.push(TurnItem::ToolCall {
                    call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: arguments.clone(),
                });

                // A failed call is handed back to the model as a structured
                // result so it can explain the failure instead of crashing
                // the chat.
                let output = match agent
                    .session()
                    .call_tool(&call.function.name, arguments)
                    .await
                {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(tool = %call.function.name, %err, "tool call failed");
                        json!({ "error": err.to_string() })
                    }
                };

                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id.clone(),
                    "content": tool_output_text(&output),
                }));
                items.push(TurnItem::ToolResult {
                    call_id: call.id,
                    output,
                });
            }
        }
    }
}

/// Map the replayable item sequence onto the chat-completions wire format.
fn wire_messages(instructions: &str, items: &[TurnItem]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(items.len() + 1);
    if !instructions.trim().is_empty() {
        messages.push(json!({ "role": "system", "content": instructions }));
    }
    for item in items {
        match item {
            TurnItem::User { content } => {
                messages.push(json!({ "role": "user", "content": content }));
            }
            TurnItem::Assistant { content } => {
                messages.push(json!({ "role": "assistant", "content": content }));
            }
            TurnItem::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                messages.push(json!({
                    "role": "assistant",
                    "content": Value::Null,
                    "tool_calls": [{
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments.to_string() },
                    }],
                }));
            }
            TurnItem::ToolResult { call_id, output } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": tool_output_text(output),
                }));
            }
        }
    }
    messages
}

fn assistant_tool_call_message(calls: &[ToolCall]) -> Value {
    let declared: Vec<Value> = calls
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.function.name,
                    "arguments": call.function.arguments,
                },
            })
        })
        .collect();
    json!({ "role": "assistant", "content": Value::Null, "tool_calls": declared })
}

fn tool_declarations(catalog: &[ToolInfo]) -> Vec<Value> {
    catalog
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": tool
                        .input_schema
                        .clone()
                        .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                },
            })
        })
        .collect()
}

fn tool_output_text(output: &Value) -> String {
    match output {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        Usage {
            input_tokens: wire.prompt_tokens.unwrap_or(0),
            output_tokens: wire.completion_tokens.unwrap_or(0),
            total_tokens: wire.total_tokens.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mapping_keeps_item_order_and_pairs_tool_results() {
        let items = vec![
            TurnItem::user("top anomalies?"),
            TurnItem::ToolCall {
                call_id: "call-1".to_string(),
                name: "query_anomalies".to_string(),
                arguments: json!({ "sql": "SELECT 1 FROM {{MLA}} LIMIT 1" }),
            },
            TurnItem::ToolResult {
                call_id: "call-1".to_string(),
                output: json!({ "rows": 1 }),
            },
            TurnItem::assistant("One row."),
        ];
        let messages = wire_messages("Be terse.", &items);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["name"],
            "query_anomalies"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call-1");
        assert_eq!(messages[4]["content"], "One row.");
    }

    #[test]
    fn empty_instructions_produce_no_system_message() {
        let messages = wire_messages("  ", &[TurnItem::user("hi")]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn tool_declarations_default_missing_schemas_to_empty_objects() {
        let catalog = vec![
            ToolInfo {
                name: "query_audit".to_string(),
                description: Some("Run macro SQL".to_string()),
                input_schema: Some(json!({ "type": "object", "properties": { "sql": {} } })),
            },
            ToolInfo::named("get_table_schema"),
        ];
        let declared = tool_declarations(&catalog);
        assert_eq!(declared.len(), 2);
        assert_eq!(declared[0]["function"]["name"], "query_audit");
        assert_eq!(
            declared[1]["function"]["parameters"],
            json!({ "type": "object", "properties": {} })
        );
    }

    #[test]
    fn usage_fields_default_to_zero_only_when_reported() {
        let wire = WireUsage {
            prompt_tokens: Some(120),
            completion_tokens: None,
            total_tokens: Some(120),
        };
        let usage: Usage = wire.into();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.total_tokens, 120);
    }

    #[test]
    fn string_tool_output_is_not_requoted() {
        assert_eq!(tool_output_text(&Value::String("plain".into())), "plain");
        assert_eq!(tool_output_text(&json!({ "n": 1 })), "{\"n\":1}");
    }
}
