//! Shell tools: start a command, then talk to it by task id

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use sortie_tasks::{ShellRequest, ShellSignal};

use super::{parse_task_id, summarize, Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ShellStartParams {
    /// Shell command line to run
    pub command: String,
    /// Milliseconds to wait for the command before handing back a task id.
    /// 0 returns a task id immediately.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Text fed to the command's stdin
    #[serde(default)]
    pub stdin: Option<String>,
    /// Echo later interactive input into the captured output
    #[serde(default)]
    pub show_stdin: bool,
    /// Stream output to the operator's log as it arrives
    #[serde(default)]
    pub show_stdout: bool,
}

/// Runs a command, inline if it finishes in time, in the background otherwise
pub struct ShellStartTool {
    default_timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ShellStartTool {
    pub fn new(default_timeout: Duration, working_dir: Option<PathBuf>) -> Self {
        Self {
            default_timeout,
            working_dir,
        }
    }
}

impl Default for ShellStartTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), None)
    }
}

#[async_trait]
impl Tool for ShellStartTool {
    type Params = ShellStartParams;

    const NAME: &'static str = "shellStart";

    fn description(&self) -> &str {
        "Run a shell command. Returns the output inline if the command exits before the timeout; \
         otherwise returns a taskId for shellOutput, shellInteract and shellSignal."
    }

    async fn call(&self, params: ShellStartParams, ctx: &ToolContext) -> Result<String, ToolError> {
        if params.command.trim().is_empty() {
            return Err(ToolError::InvalidParams("command must not be empty".to_string()));
        }

        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let mut request = ShellRequest::new(params.command, timeout);
        request.stdin = params.stdin;
        request.show_stdin = params.show_stdin;
        request.show_stdout = params.show_stdout;
        // a workspace that was never created is not worth failing the spawn over
        request.working_dir = self.working_dir.clone().filter(|dir| dir.is_dir());

        let outcome = ctx.processes.start(request).await;
        debug!("shellStart async: {}", outcome.is_async());
        Ok(serde_json::to_string(&outcome)?)
    }

    fn summarize_params(&self, params: &ShellStartParams) -> Option<String> {
        Some(summarize(&params.command))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ShellInteractParams {
    /// taskId returned by shellStart
    #[serde(alias = "taskId")]
    pub task_id: String,
    /// Text to write to the process's stdin
    pub input: String,
    /// Append a newline when the input does not end with one
    #[serde(default = "default_true")]
    pub newline: bool,
}

fn default_true() -> bool {
    true
}

/// Writes to a background process and returns what it printed in response
pub struct ShellInteractTool;

#[async_trait]
impl Tool for ShellInteractTool {
    type Params = ShellInteractParams;

    const NAME: &'static str = "shellInteract";

    fn description(&self) -> &str {
        "Send input to a background shell task's stdin and return the output it produced."
    }

    async fn call(&self, params: ShellInteractParams, ctx: &ToolContext) -> Result<String, ToolError> {
        let id = parse_task_id(&params.task_id)?;
        let mut input = params.input;
        if params.newline && !input.ends_with('\n') {
            input.push('\n');
        }

        let output = ctx.processes.send_input(id, &input).await?;
        Ok(serde_json::to_string(&output)?)
    }

    fn summarize_params(&self, params: &ShellInteractParams) -> Option<String> {
        Some(format!("{} <- {}", params.task_id, summarize(&params.input)))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ShellOutputParams {
    /// taskId returned by shellStart
    #[serde(alias = "taskId")]
    pub task_id: String,
}

/// Returns output produced since the previous read
pub struct ShellOutputTool;

#[async_trait]
impl Tool for ShellOutputTool {
    type Params = ShellOutputParams;

    const NAME: &'static str = "shellOutput";

    fn description(&self) -> &str {
        "Read new output from a background shell task. Each read returns only output \
         produced since the previous read, plus whether the process has exited."
    }

    async fn call(&self, params: ShellOutputParams, ctx: &ToolContext) -> Result<String, ToolError> {
        let id = parse_task_id(&params.task_id)?;
        let output = ctx.processes.read_output(id)?;
        Ok(serde_json::to_string(&output)?)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ShellSignalParams {
    /// taskId returned by shellStart
    #[serde(alias = "taskId")]
    pub task_id: String,
    /// Signal to deliver to the process group
    pub signal: ShellSignal,
}

pub struct ShellSignalTool;

#[async_trait]
impl Tool for ShellSignalTool {
    type Params = ShellSignalParams;

    const NAME: &'static str = "shellSignal";

    fn description(&self) -> &str {
        "Send a signal to a background shell task. SIGTERM, SIGKILL and SIGINT end the task."
    }

    async fn call(&self, params: ShellSignalParams, ctx: &ToolContext) -> Result<String, ToolError> {
        let id = parse_task_id(&params.task_id)?;
        ctx.processes.send_signal(id, params.signal)?;

        let status = ctx.tasks().get(id).map(|task| task.status);
        Ok(json!({
            "taskId": id,
            "signal": params.signal,
            "status": status,
        })
        .to_string())
    }

    fn summarize_params(&self, params: &ShellSignalParams) -> Option<String> {
        Some(format!("{} {}", params.signal, params.task_id))
    }
}
