//! Spawn tool for delegating work to a background sub-agent

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::tokens::TokenTracker;

use super::{summarize, Tool, ToolContext, ToolError};

/// Anything that can start a sub-agent run in the background
pub trait SubagentSpawner: Send + Sync {
    /// Start a run for `task`, recording its usage under `tokens`, and
    /// return the background task id.
    fn spawn(&self, task: String, label: Option<String>, tokens: TokenTracker) -> Uuid;
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpawnAgentParams {
    /// Complete, self-contained description of the work
    pub task: String,
    /// Short name for the task list
    #[serde(default)]
    pub label: Option<String>,
}

pub struct SpawnAgentTool;

#[async_trait]
impl Tool for SpawnAgentTool {
    type Params = SpawnAgentParams;

    const NAME: &'static str = "spawnAgent";

    fn description(&self) -> &str {
        "Start a sub-agent that works on a task in the background. \
         Track it with listBackgroundTasks; its result is stored on the task."
    }

    async fn call(&self, params: SpawnAgentParams, ctx: &ToolContext) -> Result<String, ToolError> {
        if params.task.trim().is_empty() {
            return Err(ToolError::InvalidParams("task must not be empty".to_string()));
        }
        let spawner = ctx.subagents.as_ref().ok_or_else(|| {
            ToolError::Execution("sub-agents cannot be spawned from here".to_string())
        })?;

        let label = params.label.clone();
        let id = spawner.spawn(params.task, params.label, ctx.tokens.clone());
        Ok(json!({
            "taskId": id,
            "label": label,
            "status": "RUNNING",
        })
        .to_string())
    }

    fn summarize_params(&self, params: &SpawnAgentParams) -> Option<String> {
        Some(summarize(params.label.as_deref().unwrap_or(&params.task)))
    }
}
