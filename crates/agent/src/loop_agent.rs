//! Agent loop - core processing engine
//!
//! One run is a bounded sequence of provider requests. Every response is
//! either nudged (empty or text-only), or its tool calls are dispatched and
//! their results fed back as a single user message. The reserved
//! `sequenceComplete` call ends the run; `respawn` replaces the history.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use sortie_config::Config;
use sortie_provider::{
    ChatParams, ContentBlock, Message, Provider, ToolCall, ToolChoice, ToolDefinition,
};
use sortie_tasks::{ProcessRunner, TaskRegistry, TaskStatus};

use crate::context::{ContextBuilder, PromptContext, StaticPrompt, SystemPrompt};
use crate::subagent::SubagentManager;
use crate::tokens::TokenTracker;
use crate::tools::{
    default_tools, schema_for_params, summarize, DispatchErrorKind, DispatchOutcome, ToolContext,
    ToolRegistry,
};

pub const SEQUENCE_COMPLETE: &str = "sequenceComplete";
pub const RESPAWN: &str = "respawn";

/// Result of a run that ran out of iterations
pub const MAX_ITERATIONS_RESULT: &str = "Maximum iterations reached";

const EMPTY_RESPONSE_REMINDER: &str = "Your last reply contained neither text nor a tool call. \
    Continue working on the task, or call sequenceComplete with the final result.";
const CONTINUE_REMINDER: &str =
    "Continue working on the task. Call sequenceComplete with the final result when it is done.";
const DEFAULT_PROMPT: &str = "You are an autonomous agent that completes tasks by calling tools. \
    Call sequenceComplete with the final result when the task is done.";

/// Model parameters and budget for one run
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Reclaim every background task when the run ends
    pub cleanup_on_finish: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            model: String::new(),
            max_tokens: 8192,
            temperature: 0.7,
            cleanup_on_finish: true,
        }
    }
}

impl From<&Config> for AgentConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            model: config.default_model(),
            max_tokens: config.agent.max_tokens,
            temperature: config.agent.temperature,
            cleanup_on_finish: true,
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub result: String,
    /// Number of provider requests made
    pub interactions: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SequenceCompleteParams {
    /// Final result of the task
    result: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RespawnParams {
    /// Everything needed to carry on: the task, progress so far, next steps
    context: String,
}

enum Directive {
    Complete(String),
    Respawn(String),
    Continue(Vec<ContentBlock>),
}

/// The agent loop processes one prompt to completion
pub struct AgentLoop<P: Provider> {
    provider: Arc<P>,
    tools: Arc<ToolRegistry>,
    context: ToolContext,
    config: AgentConfig,
    prompt: Arc<dyn SystemPrompt>,
}

impl<P: Provider + 'static> AgentLoop<P> {
    pub fn new(
        provider: Arc<P>,
        tools: ToolRegistry,
        context: ToolContext,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools: Arc::new(tools),
            context,
            config,
            prompt: Arc::new(StaticPrompt(DEFAULT_PROMPT.to_string())),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn SystemPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Top-level agent with the standard toolkit, a workspace prompt and
    /// sub-agent support, all sharing `registry`.
    pub fn from_config(provider: Arc<P>, config: &Config, registry: TaskRegistry) -> Self {
        let processes = Arc::new(
            ProcessRunner::new(registry)
                .with_kill_grace(config.shell.kill_grace())
                .with_stdin_settle(config.shell.stdin_settle()),
        );
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            processes.clone(),
            config.clone(),
        ));
        let context = ToolContext::new(processes, TokenTracker::root("agent"))
            .with_subagents(subagents);

        Self::new(
            provider,
            default_tools(config, true),
            context,
            AgentConfig::from(config),
        )
        .with_prompt(Arc::new(ContextBuilder::new(config.workspace_path())))
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn tokens(&self) -> &TokenTracker {
        &self.context.tokens
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Registered tool schemas plus the reserved control tools
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = self.tools.definitions();
        definitions.push(ToolDefinition::new(
            SEQUENCE_COMPLETE,
            "Finish the task and return its final result.",
            schema_for_params::<SequenceCompleteParams>(),
        ));
        definitions.push(ToolDefinition::new(
            RESPAWN,
            "Discard the conversation so far and continue from the given context alone.",
            schema_for_params::<RespawnParams>(),
        ));
        definitions
    }

    /// Run `prompt` to completion. Provider failures are fatal; tool
    /// failures are reported to the model and never end the run.
    pub async fn run(&self, prompt: &str) -> crate::Result<AgentRun> {
        info!("◆ AGENT RUN: {}", summarize(prompt));
        let outcome = self.drive(prompt).await;

        match &outcome {
            Ok(run) => info!(
                "◆ AGENT RUN FINISHED after {} interactions: {}",
                run.interactions,
                summarize(&run.result)
            ),
            Err(e) => error!("◆ AGENT RUN FAILED: {}", e),
        }

        if self.config.cleanup_on_finish {
            self.context.tasks().cleanup().await;
        }
        outcome
    }

    async fn drive(&self, prompt: &str) -> crate::Result<AgentRun> {
        let definitions = self.definitions();
        let tool_names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        let mut history = vec![Message::user(prompt)];
        let mut interactions = 0;

        for iteration in 1..=self.config.max_iterations {
            debug!("Agent iteration {}", iteration);

            let prompt_context = PromptContext {
                iteration,
                max_iterations: self.config.max_iterations,
                tool_names: tool_names.clone(),
                running_tasks: self.context.tasks().get_tasks(Some(TaskStatus::Running)),
            };
            let params = ChatParams {
                model: self.config.model.clone(),
                system_prompt: self.prompt.build(&prompt_context).await,
                messages: history.clone(),
                tools: definitions.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                tool_choice: ToolChoice::Auto,
            };

            interactions += 1;
            let response = self.provider.chat(params).await?;
            self.context.tokens.add(&response.usage);

            if response.is_empty() {
                warn!("◆ EMPTY RESPONSE ON ITERATION {}", iteration);
                history.push(Message::user(EMPTY_RESPONSE_REMINDER));
                continue;
            }

            history.push(Message::assistant_with_tools(
                response.content.as_deref(),
                &response.tool_calls,
            ));

            let (reserved, ordinary): (Vec<ToolCall>, Vec<ToolCall>) = response
                .tool_calls
                .into_iter()
                .partition(|call| is_reserved(&call.name));

            let mut results: Vec<ContentBlock> = self
                .tools
                .dispatch_all(&ordinary, &self.context)
                .await
                .into_iter()
                .map(DispatchOutcome::into_block)
                .collect();

            match resolve_reserved(&reserved) {
                Directive::Complete(result) => {
                    info!("◆ SEQUENCE COMPLETE");
                    return Ok(AgentRun {
                        result,
                        interactions,
                    });
                }
                Directive::Respawn(context) => {
                    info!("◆ RESPAWN: {} messages discarded", history.len());
                    history = vec![Message::user(context)];
                    continue;
                }
                Directive::Continue(errors) => results.extend(errors),
            }

            if results.is_empty() {
                history.push(Message::user(CONTINUE_REMINDER));
            } else {
                history.push(Message::tool_results(results));
            }
        }

        warn!("◆ MAX ITERATIONS REACHED: {}", self.config.max_iterations);
        Ok(AgentRun {
            result: MAX_ITERATIONS_RESULT.to_string(),
            interactions,
        })
    }
}

fn is_reserved(name: &str) -> bool {
    name == SEQUENCE_COMPLETE || name == RESPAWN
}

/// A valid `sequenceComplete` wins over everything else in the turn, then
/// the first valid `respawn`. Malformed reserved calls become error results.
fn resolve_reserved(calls: &[ToolCall]) -> Directive {
    let mut errors = Vec::new();
    let mut respawn = None;

    for call in calls {
        if call.name == SEQUENCE_COMPLETE {
            match parse_reserved::<SequenceCompleteParams>(call) {
                Ok(params) => return Directive::Complete(params.result),
                Err(block) => errors.push(block),
            }
        } else {
            match parse_reserved::<RespawnParams>(call) {
                Ok(params) if params.context.trim().is_empty() => errors.push(
                    DispatchOutcome::error(
                        call,
                        DispatchErrorKind::InvalidParams,
                        "context must not be empty",
                    )
                    .into_block(),
                ),
                Ok(params) => {
                    respawn.get_or_insert(params.context);
                }
                Err(block) => errors.push(block),
            }
        }
    }

    match respawn {
        Some(context) => Directive::Respawn(context),
        None => Directive::Continue(errors),
    }
}

fn parse_reserved<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ContentBlock> {
    let value: serde_json::Value = serde_json::from_str(&call.arguments).map_err(|e| {
        DispatchOutcome::error(call, DispatchErrorKind::InvalidJson, &e.to_string()).into_block()
    })?;
    serde_json::from_value(value).map_err(|e| {
        DispatchOutcome::error(call, DispatchErrorKind::InvalidParams, &e.to_string()).into_block()
    })
}
