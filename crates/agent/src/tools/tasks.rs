//! Background task listing

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use sortie_tasks::TaskStatus;

use super::{Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListBackgroundTasksParams {
    /// Only list tasks in this state
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

pub struct ListBackgroundTasksTool;

#[async_trait]
impl Tool for ListBackgroundTasksTool {
    type Params = ListBackgroundTasksParams;

    const NAME: &'static str = "listBackgroundTasks";

    fn description(&self) -> &str {
        "List shell processes, browser sessions and sub-agents started in this run, oldest first."
    }

    async fn call(
        &self,
        params: ListBackgroundTasksParams,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let tasks = ctx.tasks().get_tasks(params.status);
        Ok(json!({
            "count": tasks.len(),
            "tasks": tasks,
        })
        .to_string())
    }

    fn summarize_params(&self, params: &ListBackgroundTasksParams) -> Option<String> {
        Some(match params.status {
            Some(status) => status.to_string(),
            None => "all".to_string(),
        })
    }
}
