//! Toolkit and dispatcher
//!
//! Tools are written against the typed [`Tool`] trait; the registry stores
//! them behind the object-safe [`ToolTrait`]. [`ToolRegistry::dispatch`]
//! turns every failure (unknown tool, bad JSON, bad parameters, error or
//! panic while running) into a JSON error payload for the model.

pub mod shell;
pub mod spawn;
pub mod tasks;
pub mod web;

pub use shell::{ShellInteractTool, ShellOutputTool, ShellSignalTool, ShellStartTool};
pub use spawn::{SpawnAgentTool, SubagentSpawner};
pub use tasks::ListBackgroundTasksTool;
pub use web::{ExtractMode, FetchTool};

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use sortie_config::Config;
use sortie_provider::{ContentBlock, RetryPolicy, ToolCall, ToolDefinition};
use sortie_tasks::{ProcessError, ProcessRunner, TaskRegistry};

use crate::tokens::TokenTracker;

/// Default cap on a single tool result
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 12 * 1024;
const SUMMARY_CHARS: usize = 60;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    Execution(String),
}

impl From<ProcessError> for ToolError {
    fn from(e: ProcessError) -> Self {
        ToolError::Execution(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Execution(e.to_string())
    }
}

/// Everything a tool may touch while running
#[derive(Clone)]
pub struct ToolContext {
    pub processes: Arc<ProcessRunner>,
    pub tokens: TokenTracker,
    pub subagents: Option<Arc<dyn SubagentSpawner>>,
}

impl ToolContext {
    pub fn new(processes: Arc<ProcessRunner>, tokens: TokenTracker) -> Self {
        Self {
            processes,
            tokens,
            subagents: None,
        }
    }

    pub fn with_subagents(mut self, subagents: Arc<dyn SubagentSpawner>) -> Self {
        self.subagents = Some(subagents);
        self
    }

    pub fn tasks(&self) -> &TaskRegistry {
        self.processes.registry()
    }

    /// Same resources, with token usage recorded under a child scope
    pub fn scoped(&self, label: &str) -> Self {
        Self {
            tokens: self.tokens.child(label),
            ..self.clone()
        }
    }
}

/// A tool with typed parameters
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Params: DeserializeOwned + JsonSchema + Send;

    const NAME: &'static str;

    fn description(&self) -> &str;

    async fn call(&self, params: Self::Params, ctx: &ToolContext) -> Result<String, ToolError>;

    /// One-line description of a call for the logs
    fn summarize_params(&self, _params: &Self::Params) -> Option<String> {
        None
    }

    fn summarize_result(&self, result: &str) -> String {
        summarize(result)
    }
}

/// Object-safe form of [`Tool`], implemented for every typed tool
#[async_trait]
pub trait ToolTrait: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    fn summarize_args(&self, args: &Value) -> String;
    fn summarize_result(&self, result: &str) -> String;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

#[async_trait]
impl<T: Tool> ToolTrait for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        Tool::description(self)
    }

    fn parameters(&self) -> Value {
        schema_for_params::<T::Params>()
    }

    fn summarize_args(&self, args: &Value) -> String {
        serde_json::from_value::<T::Params>(args.clone())
            .ok()
            .and_then(|params| self.summarize_params(&params))
            .unwrap_or_else(|| summarize(&args.to_string()))
    }

    fn summarize_result(&self, result: &str) -> String {
        Tool::summarize_result(self, result)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let params: T::Params =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidParams(e.to_string()))?;
        self.call(params, ctx).await
    }
}

/// Inline JSON schema for a parameter type, without `$schema`/`title` noise
pub fn schema_for_params<P: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .into_generator();
    let mut schema = serde_json::to_value(generator.into_root_schema_for::<P>())
        .unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = schema.as_object_mut() {
        object.remove("title");
        object.remove("definitions");
        object
            .entry("properties")
            .or_insert_with(|| json!({}));
    }
    schema
}

/// First 60 characters of `text` on one line
pub fn summarize(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SUMMARY_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(SUMMARY_CHARS).collect();
        format!("{}...", cut)
    }
}

/// Cap `output` at `max_bytes`, cutting on a char boundary
pub fn cap_output(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n◆ OUTPUT TRUNCATED: {} BYTES OMITTED",
        &output[..cut],
        output.len() - cut
    )
}

/// Model-facing task ids arrive as strings
pub fn parse_task_id(raw: &str) -> Result<Uuid, ToolError> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| ToolError::InvalidParams(format!("invalid task id '{}': {}", raw, e)))
}

/// Failure classes reported back to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    UnknownTool,
    InvalidJson,
    InvalidParams,
    Execution,
}

impl DispatchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchErrorKind::UnknownTool => "unknown_tool",
            DispatchErrorKind::InvalidJson => "invalid_json",
            DispatchErrorKind::InvalidParams => "invalid_params",
            DispatchErrorKind::Execution => "execution",
        }
    }
}

pub fn error_payload(kind: DispatchErrorKind, tool: &str, message: &str) -> String {
    json!({
        "error": {
            "kind": kind.as_str(),
            "tool": tool,
            "message": message,
        }
    })
    .to_string()
}

/// Result of one dispatched call
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

impl DispatchOutcome {
    fn ok(call: &ToolCall, content: String) -> Self {
        Self {
            tool_use_id: call.id.clone(),
            content,
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, kind: DispatchErrorKind, message: &str) -> Self {
        warn!("◆ TOOL {} FAILED ({}): {}", call.name, kind.as_str(), message);
        Self {
            tool_use_id: call.id.clone(),
            content: error_payload(kind, &call.name, message),
            is_error: true,
        }
    }

    pub fn into_block(self) -> ContentBlock {
        ContentBlock::tool_result(self.tool_use_id, self.content, self.is_error)
    }
}

type BoxedTool = Arc<dyn ToolTrait>;

/// Registered tools plus the dispatch policy
pub struct ToolRegistry {
    tools: HashMap<String, BoxedTool>,
    max_output_bytes: usize,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn register<T: ToolTrait + 'static>(&mut self, tool: T) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolTrait> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas advertised to the model, in name order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect()
    }

    /// Run one call. Never fails: every failure becomes an error payload.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> DispatchOutcome {
        let span = info_span!("tool", name = %call.name, id = %call.id);
        self.dispatch_inner(call, ctx).instrument(span).await
    }

    async fn dispatch_inner(&self, call: &ToolCall, ctx: &ToolContext) -> DispatchOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            let message = format!("no tool named '{}'", call.name);
            return DispatchOutcome::error(call, DispatchErrorKind::UnknownTool, &message);
        };

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                return DispatchOutcome::error(call, DispatchErrorKind::InvalidJson, &e.to_string())
            }
        };

        info!("◆ CALL: {}", tool.summarize_args(&args));
        let started = Instant::now();

        match AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind().await {
            Ok(Ok(output)) => {
                info!(
                    "◆ RESULT in {:?}: {}",
                    started.elapsed(),
                    tool.summarize_result(&output)
                );
                DispatchOutcome::ok(call, cap_output(output, self.max_output_bytes))
            }
            Ok(Err(ToolError::InvalidParams(message))) => {
                DispatchOutcome::error(call, DispatchErrorKind::InvalidParams, &message)
            }
            Ok(Err(ToolError::Execution(message))) => {
                DispatchOutcome::error(call, DispatchErrorKind::Execution, &message)
            }
            Err(panic) => {
                let message = format!("tool panicked: {}", panic_message(panic.as_ref()));
                DispatchOutcome::error(call, DispatchErrorKind::Execution, &message)
            }
        }
    }

    /// Run all calls of one turn concurrently. Outcomes come back in call
    /// order; each call records tokens under the child scope named after
    /// its tool.
    pub async fn dispatch_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<DispatchOutcome> {
        join_all(calls.iter().map(|call| {
            let scoped = ctx.scoped(&call.name);
            async move { self.dispatch(call, &scoped).await }
        }))
        .await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Providers send an empty string for argument-less calls
fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The standard toolkit. `spawnAgent` is only offered to agents that can
/// actually spawn; sub-agents get everything else.
pub fn default_tools(config: &Config, allow_spawn: bool) -> ToolRegistry {
    let mut registry = ToolRegistry::new().with_max_output_bytes(config.dispatch.max_output_bytes);

    registry.register(ShellStartTool::new(
        config.shell.timeout(),
        Some(config.workspace_path()),
    ));
    registry.register(ShellInteractTool);
    registry.register(ShellOutputTool);
    registry.register(ShellSignalTool);
    registry.register(ListBackgroundTasksTool);
    registry.register(FetchTool::new(RetryPolicy::from(&config.retry)));
    if allow_spawn {
        registry.register(SpawnAgentTool);
    }

    registry
}
