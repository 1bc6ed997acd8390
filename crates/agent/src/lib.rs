//! Agent core: the tool-calling loop and its toolkit
//!
//! The loop talks to a [`Provider`](sortie_provider::Provider), dispatches the
//! tool calls it receives and keeps going until the model calls
//! `sequenceComplete` or the iteration budget runs out.

use thiserror::Error;

pub mod context;
pub mod loop_agent;
pub mod subagent;
pub mod tokens;
pub mod tools;

pub use context::{ContextBuilder, PromptContext, StaticPrompt, SystemPrompt};
pub use loop_agent::{AgentConfig, AgentLoop, AgentRun, MAX_ITERATIONS_RESULT};
pub use subagent::SubagentManager;
pub use tokens::TokenTracker;
pub use tools::{DispatchOutcome, Tool, ToolContext, ToolError, ToolRegistry, ToolTrait};

/// Fatal agent run errors. Tool failures never surface here.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("◆ PROVIDER FAILURE: {0}")]
    Provider(#[from] sortie_provider::ProviderError),

    #[error("◆ CONFIG FAILURE: {0}")]
    Config(#[from] sortie_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
