use std::{collections::BTreeSet, time::Duration};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::Value,
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Everything a runner needs for one turn.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub run_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub session_key: String,
    pub message: String,
    pub images: Vec<Value>,
    /// Tools the run may call, after policy layering.
    pub allowed_tools: BTreeSet<String>,
    pub thinking_level: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

/// Result of a completed run.
#[derive(Debug, Clone, Default)]
pub struct AgentRunResult {
    pub text: String,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
}

/// Callback for streaming events out of the runner.
pub type OnEvent = Box<dyn Fn(RunnerEvent) + Send + Sync>;

/// Events emitted during the agent run.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// LLM is processing (show a "thinking" indicator).
    Thinking,
    /// LLM finished thinking (hide the indicator).
    ThinkingDone,
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
    },
    TextDelta(String),
}

/// Executes agent turns.
///
/// Implementations should watch `cancel` and return promptly once it fires;
/// the gateway also drops the run future on timeout.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        on_event: OnEvent,
    ) -> Result<AgentRunResult>;
}

/// Replies with the incoming message. Used when no real runner is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        on_event: OnEvent,
    ) -> Result<AgentRunResult> {
        debug!(run_id = %request.run_id, "echo runner");
        if cancel.is_cancelled() {
            anyhow::bail!("run cancelled");
        }
        on_event(RunnerEvent::TextDelta(request.message.clone()));
        Ok(AgentRunResult {
            text: request.message,
            model: request.model,
            thinking_level: request.thinking_level,
        })
    }
}
