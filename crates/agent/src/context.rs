//! System prompt assembly
//!
//! The loop asks its [`SystemPrompt`] for a fresh prompt before every request,
//! so the prompt can reflect the current iteration and live background tasks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use tracing::debug;

use sortie_tasks::BackgroundTask;

/// What the loop knows when it asks for a prompt
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub iteration: u32,
    pub max_iterations: u32,
    pub tool_names: Vec<String>,
    pub running_tasks: Vec<BackgroundTask>,
}

/// Produces the system prompt for each request
#[async_trait]
pub trait SystemPrompt: Send + Sync {
    async fn build(&self, ctx: &PromptContext) -> String;
}

/// Fixed prompt text
pub struct StaticPrompt(pub String);

#[async_trait]
impl SystemPrompt for StaticPrompt {
    async fn build(&self, _ctx: &PromptContext) -> String {
        self.0.clone()
    }
}

/// Workspace-aware prompt with optional bootstrap files
pub struct ContextBuilder {
    workspace: PathBuf,
    role: Option<String>,
}

impl ContextBuilder {
    /// Bootstrap files to load
    const BOOTSTRAP_FILES: &'static [&'static str] = &["AGENTS.md", "SORTIE.md"];

    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            role: None,
        }
    }

    /// Prompt for a sub-agent working on one delegated task
    pub fn for_subagent(workspace: impl AsRef<Path>, label: &str) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            role: Some(format!(
                "You are a sub-agent working on the delegated task \"{}\". \
                 Finish it on your own and report the outcome through sequenceComplete.",
                label
            )),
        }
    }

    fn identity(&self, ctx: &PromptContext) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");

        format!(
            r#"# sortie

You are sortie, an autonomous agent that completes tasks by calling tools.

## Current Time
{}

## Workspace
{}

## Tools
{}

## Rules
- Call sequenceComplete with the final result when the task is done. Plain text answers do not end the task.
- Call respawn with a compact summary of the progress so far when the conversation has grown too long to work with; the history is replaced by that summary.
- Shell commands that outlive their timeout keep running in the background. Poll them with shellOutput and stop them with shellSignal when they are no longer needed.

## Budget
Iteration {} of {}."#,
            now,
            self.workspace.display(),
            ctx.tool_names.join(", "),
            ctx.iteration,
            ctx.max_iterations
        )
    }

    async fn load_bootstrap_files(&self) -> String {
        let mut parts = Vec::new();

        for filename in Self::BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => parts.push(format!("## {}\n\n{}", filename, content.trim())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Failed to read {}: {}", filename, e),
            }
        }

        parts.join("\n\n")
    }

    fn running_tasks(ctx: &PromptContext) -> Option<String> {
        if ctx.running_tasks.is_empty() {
            return None;
        }
        let lines: Vec<String> = ctx
            .running_tasks
            .iter()
            .map(|task| {
                let detail = task
                    .metadata
                    .get("command")
                    .or_else(|| task.metadata.get("label"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                format!("- {} {} {}", task.kind, task.id, detail)
            })
            .collect();
        Some(format!("# Running Background Tasks\n\n{}", lines.join("\n")))
    }
}

#[async_trait]
impl SystemPrompt for ContextBuilder {
    async fn build(&self, ctx: &PromptContext) -> String {
        let mut parts = vec![self.identity(ctx)];

        if let Some(role) = &self.role {
            parts.push(role.clone());
        }

        let bootstrap = self.load_bootstrap_files().await;
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        if let Some(tasks) = Self::running_tasks(ctx) {
            parts.push(tasks);
        }

        parts.join("\n\n---\n\n")
    }
}
