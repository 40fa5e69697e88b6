pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::agent::{Agent, AgentDefinition};
pub use application::chat::{ChatError, ConversationState, TurnReport, dispatch};
pub use application::launch::{LaunchError, LaunchPlan};
pub use application::session::{
    McpTransport, SessionError, SessionState, ToolCallError, ToolServerSession, ToolTransport,
    scoped,
};
pub use config::{AppConfig, ConfigError};
pub use domain::types::{ToolInfo, TurnItem, Usage};
pub use domain::variant::VariantDescriptor;
pub use infrastructure::engine::{Engine, EngineError, EngineTurn, OpenAiEngine, TurnInput};
