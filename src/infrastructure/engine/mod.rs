//! Model engine boundary.
//!
//! The engine accepts a conversation plus the agent's tool catalog and
//! returns the turn's text and the complete, authoritative item sequence.
//! The inner model↔tool loop lives behind this trait; the dispatch loop
//! invokes it exactly once per turn.

pub mod openai;

pub use openai::OpenAiEngine;

use crate::application::agent::Agent;
use crate::application::session::ToolCallError;
use crate::domain::types::{TurnItem, Usage};
use async_trait::async_trait;
use thiserror::Error;

/// What a turn submits to the engine: raw text for a fresh conversation,
/// or the prior item sequence with the new user item appended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    Text(String),
    Items(Vec<TurnItem>),
}

impl TurnInput {
    /// The input as an item sequence, however it was expressed.
    pub fn into_items(self) -> Vec<TurnItem> {
        match self {
            TurnInput::Text(text) => vec![TurnItem::user(text)],
            TurnInput::Items(items) => items,
        }
    }
}

/// One completed engine turn.
#[derive(Debug, Clone)]
pub struct EngineTurn {
    /// The full item sequence after this turn: the submitted items merged
    /// with everything the engine produced. Callers overwrite their state
    /// with this, they do not append it.
    pub items: Vec<TurnItem>,
    /// Final textual answer; may be empty.
    pub final_output: String,
    /// Aggregate token usage when the provider reports it.
    pub usage: Option<Usage>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model provider '{provider}' requires an API key in ${env}")]
    MissingApiKey { provider: String, env: String },
    #[error("network error calling model provider '{provider}': {source}")]
    Network {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("model provider '{provider}' returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
    #[error("agent exceeded the maximum number of tool interactions ({limit})")]
    TooManySteps { limit: usize },
    #[error("tool session unavailable: {source}")]
    Session {
        #[source]
        source: ToolCallError,
    },
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Run one complete turn: invoke the model, execute any tool calls it
    /// requests through the agent's session, and return once the model
    /// produces a final answer.
    async fn run_turn(&self, agent: &Agent, input: TurnInput) -> Result<EngineTurn, EngineError>;
}
