//! System prompt tests

use chrono::Utc;
use serde_json::Map;
use tempfile::TempDir;
use uuid::Uuid;

use sortie_agent::{ContextBuilder, PromptContext, StaticPrompt, SystemPrompt};
use sortie_tasks::{BackgroundTask, TaskKind, TaskStatus};

fn prompt_context() -> PromptContext {
    PromptContext {
        iteration: 3,
        max_iterations: 20,
        tool_names: vec!["shellStart".to_string(), "sequenceComplete".to_string()],
        running_tasks: Vec::new(),
    }
}

fn running_shell(command: &str) -> BackgroundTask {
    let mut metadata = Map::new();
    metadata.insert("command".to_string(), command.into());
    BackgroundTask {
        id: Uuid::new_v4(),
        kind: TaskKind::Shell,
        status: TaskStatus::Running,
        start_time: Utc::now(),
        end_time: None,
        metadata,
    }
}

#[tokio::test]
async fn test_identity_and_budget() {
    let workspace = TempDir::new().unwrap();
    let prompt = ContextBuilder::new(workspace.path())
        .build(&prompt_context())
        .await;

    assert!(prompt.starts_with("# sortie"));
    assert!(prompt.contains(&workspace.path().display().to_string()));
    assert!(prompt.contains("shellStart, sequenceComplete"));
    assert!(prompt.contains("Iteration 3 of 20"));
    assert!(!prompt.contains("Running Background Tasks"));
}

#[tokio::test]
async fn test_bootstrap_files_are_included() {
    let workspace = TempDir::new().unwrap();
    std::fs::write(workspace.path().join("AGENTS.md"), "Always answer in haiku.\n").unwrap();
    std::fs::write(workspace.path().join("SORTIE.md"), "Prefer ripgrep over grep.").unwrap();

    let prompt = ContextBuilder::new(workspace.path())
        .build(&prompt_context())
        .await;

    assert!(prompt.contains("## AGENTS.md\n\nAlways answer in haiku."));
    assert!(prompt.contains("## SORTIE.md\n\nPrefer ripgrep over grep."));
    let agents = prompt.find("AGENTS.md").unwrap();
    let sortie = prompt.find("SORTIE.md").unwrap();
    assert!(agents < sortie);
}

#[tokio::test]
async fn test_missing_workspace_is_tolerated() {
    let prompt = ContextBuilder::new("/nonexistent/sortie/workspace")
        .build(&prompt_context())
        .await;

    assert!(prompt.contains("# sortie"));
    assert!(!prompt.contains("AGENTS.md"));
}

#[tokio::test]
async fn test_running_tasks_are_listed() {
    let workspace = TempDir::new().unwrap();
    let task = running_shell("npm run dev");
    let mut ctx = prompt_context();
    ctx.running_tasks = vec![task.clone()];

    let prompt = ContextBuilder::new(workspace.path()).build(&ctx).await;

    assert!(prompt.contains("# Running Background Tasks"));
    assert!(prompt.contains(&format!("- shell {} npm run dev", task.id)));
}

#[tokio::test]
async fn test_subagent_role() {
    let workspace = TempDir::new().unwrap();
    let prompt = ContextBuilder::for_subagent(workspace.path(), "audit deps")
        .build(&prompt_context())
        .await;

    assert!(prompt.contains("sub-agent working on the delegated task \"audit deps\""));
}

#[tokio::test]
async fn test_static_prompt() {
    let prompt = StaticPrompt("fixed".to_string());
    assert_eq!(prompt.build(&prompt_context()).await, "fixed");
    assert_eq!(prompt.build(&PromptContext::default()).await, "fixed");
}
