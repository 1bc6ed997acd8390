//! Sortie command implementations

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use sortie_agent::AgentLoop;
use sortie_config::{self, Config};
use sortie_provider::{OpenRouterProvider, RetryPolicy};
use sortie_tasks::TaskRegistry;

/// Exit code after an interrupted run
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Last line of defence for tasks that outlive an unwinding command
struct KillOnDrop(TaskRegistry);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        self.0.force_kill_all();
    }
}

/// Initialize config and workspace
pub async fn init_command() -> Result<()> {
    println!("◆ Initializing Sortie...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = sortie_config::init().await?;
    let workspace = config.workspace_path();
    create_template(&workspace, "AGENTS.md", AGENTS_MD).await?;

    println!("\n◆ Sortie initialized");
    println!("\nNext steps:");
    println!(
        "  1. Add your API key to {}",
        sortie_config::config_path().display()
    );
    println!("     Get one at: https://openrouter.ai/keys");
    println!("  2. Start a run: sortie run -m \"List the files in the workspace\"");

    Ok(())
}

async fn create_template(dir: &std::path::Path, filename: &str, content: &str) -> Result<()> {
    let path = dir.join(filename);
    if !path.exists() {
        tokio::fs::write(&path, content).await?;
        println!("  Created {}", filename);
    }
    Ok(())
}

/// Overrides applied on top of the loaded config for one invocation
#[derive(Debug, Default)]
pub struct RunOptions {
    pub message: Option<String>,
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
}

/// Run the agent on one prompt, or on each line typed at the prompt
pub async fn run_command(options: RunOptions) -> Result<()> {
    let mut config = Config::load().await?;
    if let Some(model) = options.model {
        config.agent.model = model;
    }
    if let Some(max_iterations) = options.max_iterations {
        config.agent.max_iterations = max_iterations;
    }

    let api_key = config.api_key().with_context(|| {
        format!(
            "No API key configured. Set one in {}",
            sortie_config::config_path().display()
        )
    })?;
    let provider = OpenRouterProvider::new(api_key, config.api_base(), Some(config.default_model()))
        .with_retry(RetryPolicy::from(&config.retry));

    let registry = TaskRegistry::new();
    let _guard = KillOnDrop(registry.clone());
    let agent = AgentLoop::from_config(Arc::new(provider), &config, registry.clone());

    match options.message {
        Some(prompt) => run_once(&agent, &registry, &prompt).await?,
        None => interactive(&agent, &registry).await?,
    }

    let report = agent.tokens().report();
    if !report.is_empty() {
        println!("\n◆ Token usage");
        print!("{}", report);
    }
    Ok(())
}

async fn run_once(
    agent: &AgentLoop<OpenRouterProvider>,
    registry: &TaskRegistry,
    prompt: &str,
) -> Result<()> {
    tokio::select! {
        outcome = agent.run(prompt) => {
            let run = outcome.context("Agent run failed")?;
            println!("\n◆ {}", run.result);
            println!("\n◆ {} interactions", run.interactions);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => interrupted(registry).await,
    }
}

async fn interactive(agent: &AgentLoop<OpenRouterProvider>, registry: &TaskRegistry) -> Result<()> {
    println!("◆ Interactive mode (type 'exit' to quit)");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("◆ ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => return interrupted(registry).await,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        // a failed run is reported and the session carries on
        if let Err(e) = run_once(agent, registry, input).await {
            eprintln!("\n✗ {:#}\n", e);
        }
    }

    Ok(())
}

async fn interrupted(registry: &TaskRegistry) -> Result<()> {
    warn!("◆ INTERRUPTED: RECLAIMING BACKGROUND TASKS");
    let report = registry.cleanup().await;
    eprintln!(
        "\n◆ Interrupted ({} tasks terminated, {} errored)",
        report.terminated, report.errored
    );
    std::process::exit(INTERRUPTED_EXIT_CODE);
}

/// Show system status
pub async fn status_command() -> Result<()> {
    let config_path = sortie_config::config_path();

    println!("◆ Sortie System Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!(
        "Config:     {} {}",
        config_path.display(),
        if config_path.exists() {
            "[OK]"
        } else {
            "[Missing]"
        }
    );

    let config = Config::load()
        .await
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let workspace = config.workspace_path();
    println!(
        "Workspace:  {} {}",
        workspace.display(),
        if workspace.exists() {
            "[OK]"
        } else {
            "[Missing]"
        }
    );
    println!("Model:      {}", config.default_model());
    println!(
        "API Key:    {}",
        if config.has_api_key() {
            "[Set]"
        } else {
            "[Missing]"
        }
    );
    if let Some(api_base) = config.api_base() {
        println!("API Base:   {}", api_base);
    }
    println!("Iterations: {} max", config.agent.max_iterations);
    println!("Shell:      {}ms timeout", config.shell.timeout_ms);
    println!("Retries:    {} attempts", config.retry.max_retries);

    println!("\n◆ Ready");

    Ok(())
}

const AGENTS_MD: &str = r#"# Agent Instructions

Notes in this file are added to the system prompt of every run.

## Conventions

- Work inside this workspace unless told otherwise
- Stop background processes you no longer need
- Report what was done, not what was attempted
"#;
