//! Common test utilities for agent integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use sortie_agent::{TokenTracker, ToolContext};
use sortie_provider::{ChatParams, ChatResponse, Provider, ProviderError, ToolCall, Usage};
use sortie_tasks::{ProcessRunner, TaskRegistry, TaskStatus};

/// Provider that replays a fixed script and records every request
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    requests: Mutex<Vec<ChatParams>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ChatResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn replies(replies: Vec<ChatResponse>) -> Arc<Self> {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    pub fn requests(&self) -> Vec<ChatParams> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(&self, params: ChatParams) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(params);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ProviderError::InvalidResponse))
    }

    fn default_model(&self) -> String {
        "scripted-model".to_string()
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// Provider that never answers
pub struct StalledProvider;

#[async_trait]
impl Provider for StalledProvider {
    async fn chat(&self, _params: ChatParams) -> Result<ChatResponse, ProviderError> {
        std::future::pending().await
    }

    fn default_model(&self) -> String {
        "stalled-model".to_string()
    }

    fn is_configured(&self) -> bool {
        true
    }
}

pub fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall::new(id, name, args.to_string())
}

pub fn calls(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse::tool_calls(None, calls).with_usage(Usage::new(10, 5))
}

pub fn complete(result: &str) -> ChatResponse {
    calls(vec![call(
        "done",
        "sequenceComplete",
        serde_json::json!({ "result": result }),
    )])
}

pub fn test_context() -> ToolContext {
    let registry = TaskRegistry::new();
    let runner = ProcessRunner::new(registry)
        .with_kill_grace(Duration::from_millis(100))
        .with_stdin_settle(Duration::from_millis(200));
    ToolContext::new(Arc::new(runner), TokenTracker::root("test"))
}

/// Poll the registry until the task reaches `status`
pub async fn wait_for_status(registry: &TaskRegistry, id: uuid::Uuid, status: TaskStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if registry.get(id).map(|t| t.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {} never reached {}", id, status);
}
