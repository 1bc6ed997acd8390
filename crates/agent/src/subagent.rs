//! Subagent manager for background task execution
//!
//! A sub-agent is a nested [`AgentLoop`] running on its own tokio task. It
//! shares the parent's process runner (and so its task registry), records
//! token usage under the spawning call's scope, and is reclaimed by
//! cancelling its token.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sortie_config::Config;
use sortie_provider::Provider;
use sortie_tasks::{CancelReclaimer, ProcessRunner, TaskKind, TaskStatus};

use crate::context::ContextBuilder;
use crate::loop_agent::{AgentConfig, AgentLoop};
use crate::tokens::TokenTracker;
use crate::tools::{default_tools, summarize, SubagentSpawner, ToolContext};

/// Manages background subagents
pub struct SubagentManager<P: Provider> {
    provider: Arc<P>,
    processes: Arc<ProcessRunner>,
    config: Config,
}

impl<P: Provider + 'static> SubagentManager<P> {
    pub fn new(provider: Arc<P>, processes: Arc<ProcessRunner>, config: Config) -> Self {
        Self {
            provider,
            processes,
            config,
        }
    }

    /// Sub-agents currently running
    pub fn running_count(&self) -> usize {
        self.processes
            .registry()
            .get_tasks(Some(TaskStatus::Running))
            .iter()
            .filter(|task| task.kind == TaskKind::Agent)
            .count()
    }

    fn build_agent(&self, label: &str, tokens: TokenTracker) -> AgentLoop<P> {
        let context = ToolContext::new(self.processes.clone(), tokens);
        let config = AgentConfig {
            // the parent owns the registry and reclaims it
            cleanup_on_finish: false,
            ..AgentConfig::from(&self.config)
        };

        AgentLoop::new(
            self.provider.clone(),
            default_tools(&self.config, false),
            context,
            config,
        )
        .with_prompt(Arc::new(ContextBuilder::for_subagent(
            self.config.workspace_path(),
            label,
        )))
    }
}

impl<P: Provider + 'static> SubagentSpawner for SubagentManager<P> {
    fn spawn(&self, task: String, label: Option<String>, tokens: TokenTracker) -> Uuid {
        let label = label.unwrap_or_else(|| summarize(&task));
        let registry = self.processes.registry().clone();
        let id = registry.register(TaskKind::Agent, json!({ "task": task, "label": label }));

        let cancel = CancellationToken::new();
        registry.attach(id, Arc::new(CancelReclaimer::new(cancel.clone())));

        let agent = self.build_agent(&label, tokens.child(format!("agent:{}", label)));
        info!(task_id = %id, "◆ SUB-AGENT DEPLOYED: {}", label);

        tokio::spawn(async move {
            tokio::select! {
                outcome = agent.run(&task) => match outcome {
                    Ok(run) => {
                        info!(task_id = %id, "◆ SUB-AGENT COMPLETE after {} interactions", run.interactions);
                        registry.update_status(
                            id,
                            TaskStatus::Completed,
                            json!({ "result": run.result, "interactions": run.interactions }),
                        );
                    }
                    Err(e) => {
                        warn!(task_id = %id, "◆ SUB-AGENT FAILED: {}", e);
                        registry.update_status(id, TaskStatus::Error, json!({ "error": e.to_string() }));
                    }
                },
                _ = cancel.cancelled() => {
                    debug!(task_id = %id, "sub-agent cancelled");
                }
            }
        });

        id
    }
}
