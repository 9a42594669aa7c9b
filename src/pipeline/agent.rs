use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use super::db::TokenUsage;

/// One request to the underlying agent runtime.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub model: Option<String>,
}

/// Raw agent output plus usage accounting. The caller is responsible for
/// interpreting `text` (plain prose for refinement, JSON for discovery and
/// plan generation).
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub text: String,
    pub usage: TokenUsage,
}

/// Seam between the pipeline and the agent runtime. The production
/// implementation shells out to the claude CLI; tests swap in a scripted
/// double so stage logic can be exercised without a live agent.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput>;
}

/// Agent backed by the claude CLI in non-interactive mode.
pub struct ClaudeAgent {
    command: String,
}

impl ClaudeAgent {
    pub fn new() -> Self {
        let command = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
        Self { command }
    }
}

impl Default for ClaudeAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Result envelope emitted by `claude --output-format json`.
#[derive(Debug, Deserialize)]
struct CliEnvelope {
    result: String,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: Option<i64>,
    #[serde(default)]
    output_tokens: Option<i64>,
}

#[async_trait]
impl AgentCapability for ClaudeAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let started = Instant::now();
        let mut cmd = Command::new(&self.command);
        cmd.args([
            "--print",
            "--output-format",
            "json",
            "-p",
            &request.prompt,
            "--system",
            &request.system_prompt,
        ]);
        if let Some(model) = &request.model {
            cmd.args(["--model", model]);
        }
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run claude CLI")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("claude CLI exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let elapsed_ms = started.elapsed().as_millis() as i64;

        // The JSON envelope carries the response text plus token usage.
        // An unparseable envelope still yields the raw stdout so a format
        // drift in the CLI degrades accounting, not the pipeline.
        match serde_json::from_str::<CliEnvelope>(&stdout) {
            Ok(envelope) => {
                let (prompt_tokens, completion_tokens) = match &envelope.usage {
                    Some(u) => (u.input_tokens, u.output_tokens),
                    None => (None, None),
                };
                let total_tokens = match (prompt_tokens, completion_tokens) {
                    (Some(p), Some(c)) => Some(p + c),
                    _ => None,
                };
                Ok(AgentOutput {
                    text: envelope.result,
                    usage: TokenUsage {
                        prompt_tokens,
                        completion_tokens,
                        total_tokens,
                        execution_time_ms: Some(elapsed_ms),
                    },
                })
            }
            Err(e) => {
                warn!("unparseable CLI envelope, using raw output: {}", e);
                Ok(AgentOutput {
                    text: stdout,
                    usage: TokenUsage {
                        execution_time_ms: Some(elapsed_ms),
                        ..TokenUsage::default()
                    },
                })
            }
        }
    }
}
