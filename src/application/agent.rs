//! Agent definition: a variant's identity bound to one live session.

use crate::application::session::ToolServerSession;
use crate::config::AppConfig;
use crate::domain::variant::VariantDescriptor;
use std::sync::Arc;

/// Low, fixed randomness: this system favours repeatable, template-driven
/// output over creative variation.
const AGENT_TEMPERATURE: f32 = 0.2;

/// Identity and model configuration of one agent, independent of any session.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub temperature: f32,
}

impl AgentDefinition {
    pub fn for_variant(variant: &VariantDescriptor, config: &AppConfig) -> Self {
        Self {
            name: variant.name.clone(),
            instructions: variant.instructions.clone(),
            model: config.model.clone(),
            temperature: AGENT_TEMPERATURE,
        }
    }

    /// Bind the definition to exactly one session, producing an invocable
    /// agent. Construction has no side effects; the session is started (and
    /// torn down) by its own scope, not here.
    pub fn bind(self, session: Arc<ToolServerSession>) -> Agent {
        Agent {
            definition: self,
            session,
        }
    }
}

/// An invocable agent: stateless and reusable across turn dispatches
/// against the same session.
#[derive(Clone)]
pub struct Agent {
    definition: AgentDefinition,
    session: Arc<ToolServerSession>,
}

impl Agent {
    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn session(&self) -> &ToolServerSession {
        &self.session
    }
}
