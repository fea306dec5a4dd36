//! Thin interface over the external coding-agent runtime.
//!
//! The engine only ever needs three operations; everything else about the
//! agent (its UI, streaming, tool calls) lives out of process. Failures
//! here are fatal to the current provisioning attempt.

use crate::config::RuntimeConfig;
use crate::domains::cells::entity::{Cell, StartMode};
use crate::domains::terminal::chat::resolve_binary;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub id: String,
    pub provider: String,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    pub start_mode: StartMode,
    pub current_mode: StartMode,
}

#[derive(Debug, Clone)]
pub struct AgentSessionOptions {
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    pub start_mode: StartMode,
    /// Session id recorded on a previous attempt, reused when still valid.
    pub existing_session_id: Option<String>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn ensure_session(
        &self,
        cell: &Cell,
        options: &AgentSessionOptions,
    ) -> Result<AgentSession>;
    async fn send_message(&self, session_id: &str, content: &str) -> Result<()>;
    async fn close_session(&self, session_id: &str) -> Result<()>;
}

/// Default implementation backed by the opencode CLI. The binary comes from
/// `HIVE_OPENCODE_BIN`; an explicit server URL is forwarded so the CLI talks
/// to an already-running agent server instead of spawning its own.
pub struct OpencodeRuntime {
    config: RuntimeConfig,
}

impl OpencodeRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    fn base_command(&self) -> Result<Command> {
        let binary = resolve_binary(&self.config.opencode_bin)?;
        let mut cmd = Command::new(binary);
        if let Some(url) = &self.config.opencode_server_url {
            cmd.arg("--server").arg(url.to_string());
        }
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn run_bounded(&self, mut cmd: Command, what: &str) -> Result<String> {
        let output = tokio::time::timeout(self.config.opencode_start_timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "Agent runtime timed out after {:?} during {what}",
                    self.config.opencode_start_timeout
                )
            })?
            .with_context(|| format!("Failed to invoke agent runtime for {what}"))?;

        if !output.status.success() {
            return Err(anyhow!(
                "Agent runtime {what} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl AgentRuntime for OpencodeRuntime {
    async fn ensure_session(
        &self,
        cell: &Cell,
        options: &AgentSessionOptions,
    ) -> Result<AgentSession> {
        if let Some(existing) = &options.existing_session_id {
            debug!("Reusing agent session {existing} for cell {}", cell.id);
            return Ok(AgentSession {
                id: existing.clone(),
                provider: "opencode".to_string(),
                model_id: options.model_id.clone(),
                provider_id: options.provider_id.clone(),
                start_mode: options.start_mode,
                current_mode: options.start_mode,
            });
        }

        let mut cmd = self.base_command()?;
        cmd.arg("session")
            .arg("create")
            .arg("--dir")
            .arg(&cell.workspace_path)
            .arg("--mode")
            .arg(options.start_mode.as_str())
            .arg("--json");
        if let Some(model) = &options.model_id {
            cmd.arg("--model").arg(model);
        }
        if let Some(provider) = &options.provider_id {
            cmd.arg("--provider").arg(provider);
        }

        let stdout = self.run_bounded(cmd, "session create").await?;
        let session_id = parse_session_id(&stdout)
            .ok_or_else(|| anyhow!("Agent runtime returned no session id: {stdout:?}"))?;

        info!("Ensured agent session {session_id} for cell {}", cell.id);
        Ok(AgentSession {
            id: session_id,
            provider: "opencode".to_string(),
            model_id: options.model_id.clone(),
            provider_id: options.provider_id.clone(),
            start_mode: options.start_mode,
            current_mode: options.start_mode,
        })
    }

    async fn send_message(&self, session_id: &str, content: &str) -> Result<()> {
        let mut cmd = self.base_command()?;
        cmd.arg("run")
            .arg("--session")
            .arg(session_id)
            .arg("--detach")
            .arg(content);
        self.run_bounded(cmd, "send message").await?;
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        let mut cmd = self.base_command()?;
        cmd.arg("session").arg("close").arg(session_id);
        self.run_bounded(cmd, "session close").await?;
        Ok(())
    }
}

/// The CLI prints a JSON object with an `id` field; older builds print the
/// bare id on the last line.
fn parse_session_id(stdout: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout.trim())
        && let Some(id) = value.get("id").and_then(|v| v.as_str())
    {
        return Some(id.to_string());
    }
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(String::from)
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MockAgent {
        pub fail_ensure: bool,
        pub sent: Mutex<Vec<(String, String)>>,
        pub closed: Mutex<Vec<String>>,
        pub ensured: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentRuntime for MockAgent {
        async fn ensure_session(
            &self,
            cell: &Cell,
            options: &AgentSessionOptions,
        ) -> Result<AgentSession> {
            if self.fail_ensure {
                return Err(anyhow!("agent runtime unavailable"));
            }
            self.ensured.lock().push(cell.id.clone());
            let id = options
                .existing_session_id
                .clone()
                .unwrap_or_else(|| format!("sess-{}", cell.id));
            Ok(AgentSession {
                id,
                provider: "mock".to_string(),
                model_id: options.model_id.clone(),
                provider_id: options.provider_id.clone(),
                start_mode: options.start_mode,
                current_mode: options.start_mode,
            })
        }

        async fn send_message(&self, session_id: &str, content: &str) -> Result<()> {
            self.sent
                .lock()
                .push((session_id.to_string(), content.to_string()));
            Ok(())
        }

        async fn close_session(&self, session_id: &str) -> Result<()> {
            self.closed.lock().push(session_id.to_string());
            Ok(())
        }
    }
}
