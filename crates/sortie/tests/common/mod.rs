//! Common test utilities for Sortie integration tests
#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::json;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

/// Isolated home directory holding `.sortie/` and a workspace
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub workspace_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let config_dir = temp_dir.path().join(".sortie");
        let workspace_dir = temp_dir.path().join("workspace");

        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            temp_dir,
            config_dir,
            workspace_dir,
        })
    }

    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }

    pub fn workspace_file(&self, name: &str) -> PathBuf {
        self.workspace_dir.join(name)
    }

    /// Command with HOME pointed at the test environment
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_sortie"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Config with an API key, aimed at `api_base`
    pub fn create_config_for(&self, api_base: &str) -> anyhow::Result<()> {
        let config = json!({
            "agent": {
                "workspace": self.workspace_dir,
                "model": "test/model",
                "max_iterations": 5
            },
            "retry": { "max_retries": 1 },
            "providers": {
                "openai": { "api_key": "test-api-key", "api_base": api_base }
            }
        });
        std::fs::write(
            self.config_file("config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }

    pub fn create_config(&self) -> anyhow::Result<()> {
        self.create_config_for("http://127.0.0.1:9")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
