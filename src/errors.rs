use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Top-level error union for the HTTP surface. Carries a stable `kind`
/// discriminator so clients (and the engine's re-hydration path) never have
/// to string-match messages.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum HiveError {
    CellNotFound { cell_id: String },
    WorkspaceNotFound { workspace_id: String },
    TemplateNotFound { template_id: String },
    ServiceNotFound { service_id: String },
    TerminalNotFound { terminal_key: String },
    TerminalNotRunning { terminal_key: String },
    ProvisioningInFlight { cell_id: String },
    CellDeleting { cell_id: String },
    CellNotReady { cell_id: String, status: String },
    InvalidInput { field: String, message: String },
    DatabaseError { message: String },
    Internal { message: String },
}

impl HiveError {
    pub fn invalid_input(field: &str, message: impl ToString) -> Self {
        HiveError::InvalidInput {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn internal(error: impl ToString) -> Self {
        HiveError::Internal {
            message: error.to_string(),
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            HiveError::CellNotFound { .. }
            | HiveError::WorkspaceNotFound { .. }
            | HiveError::ServiceNotFound { .. }
            | HiveError::TerminalNotFound { .. } => 404,
            HiveError::TemplateNotFound { .. } | HiveError::InvalidInput { .. } => 400,
            HiveError::ProvisioningInFlight { .. }
            | HiveError::CellDeleting { .. }
            | HiveError::CellNotReady { .. }
            | HiveError::TerminalNotRunning { .. } => 409,
            HiveError::DatabaseError { .. } | HiveError::Internal { .. } => 500,
        }
    }
}

impl fmt::Display for HiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CellNotFound { cell_id } => write!(f, "Cell '{cell_id}' not found"),
            Self::WorkspaceNotFound { workspace_id } => {
                write!(f, "Workspace '{workspace_id}' not found")
            }
            Self::TemplateNotFound { template_id } => {
                write!(f, "Template '{template_id}' not found")
            }
            Self::ServiceNotFound { service_id } => {
                write!(f, "Service '{service_id}' not found")
            }
            Self::TerminalNotFound { terminal_key } => {
                write!(f, "Terminal '{terminal_key}' not found")
            }
            Self::TerminalNotRunning { terminal_key } => {
                write!(f, "Terminal '{terminal_key}' is not running")
            }
            Self::ProvisioningInFlight { cell_id } => {
                write!(f, "Provisioning already in flight for cell '{cell_id}'")
            }
            Self::CellDeleting { cell_id } => {
                write!(f, "Cell '{cell_id}' is being deleted")
            }
            Self::CellNotReady { cell_id, status } => {
                write!(
                    f,
                    "Cell '{cell_id}' is not ready (status '{status}')"
                )
            }
            Self::InvalidInput { field, message } => {
                write!(f, "Invalid input for field '{field}': {message}")
            }
            Self::DatabaseError { message } => write!(f, "Database error: {message}"),
            Self::Internal { message } => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::error::Error for HiveError {}

/// A supervisor-launched process exited non-zero.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("Command '{command}' in {cwd} exited with {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown code".into()))]
pub struct CommandExecutionError {
    pub command: String,
    pub cwd: String,
    pub exit_code: Option<i32>,
}

/// A template's one-time setup recipe failed. The worktree itself is valid;
/// the cell row and worktree are preserved so the user can inspect and retry.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("Template setup failed for '{template_id}' in {workspace_path}: command '{command}' exited with {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown code".into()))]
pub struct TemplateSetupError {
    pub template_id: String,
    pub workspace_path: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub cause: Option<String>,
}

impl TemplateSetupError {
    /// Multi-line diagnostic persisted as `last_setup_error`.
    pub fn diagnostic(&self) -> String {
        let mut lines = vec![
            format!("Template setup failed for template '{}'", self.template_id),
            format!("Workspace: {}", self.workspace_path),
            format!("Command: {}", self.command),
        ];
        match self.exit_code {
            Some(code) => lines.push(format!("Exit code {code}")),
            None => lines.push("Exited without a status code".to_string()),
        }
        if let Some(cause) = &self.cause {
            lines.push(format!("Cause: {cause}"));
        }
        lines.join("\n")
    }
}

/// The cell was deleted (or flipped to `deleting`) while a provisioning
/// attempt was running. Recovery must not mark the cell `error`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Provisioning cancelled for cell '{cell_id}': {reason:?}")]
pub struct ProvisioningCancelled {
    pub cell_id: String,
    pub reason: CancellationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    RowDeleted,
    Deleting,
}

/// Worktree creation/removal failures as a closed union.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WorktreeError {
    #[error("Git repository not found at {repo_path}")]
    GitMissing { repo_path: PathBuf },
    #[error("Failed to resolve HEAD of {repo_path}: {message}")]
    HeadResolutionFailed { repo_path: PathBuf, message: String },
    #[error("Branch '{branch}' already exists")]
    BranchExists { branch: String },
    #[error("Worktree already registered at {path}")]
    WorktreeExists { path: PathBuf },
    #[error("Worktree path {path} is already in use")]
    PathInUse { path: PathBuf },
    #[error("Filesystem error on {path}: {message}")]
    FilesystemError { path: PathBuf, message: String },
    #[error("Git operation '{operation}' failed: {message}")]
    GitOperationFailed { operation: String, message: String },
}

/// Walks an error chain and recovers a `TemplateSetupError`, including
/// instances that crossed a serialization boundary as a JSON record (the
/// supervisor may hand errors over as plain `{name, templateId, ...}`
/// payloads). Matching is structural, never on the message text.
pub fn recover_template_setup_error(err: &anyhow::Error) -> Option<TemplateSetupError> {
    for cause in err.chain() {
        if let Some(setup) = cause.downcast_ref::<TemplateSetupError>() {
            return Some(setup.clone());
        }
        if let Some(setup) = rehydrate_template_setup(&cause.to_string()) {
            return Some(setup);
        }
    }
    None
}

/// Same walk for `CommandExecutionError`.
pub fn recover_command_error(err: &anyhow::Error) -> Option<CommandExecutionError> {
    for cause in err.chain() {
        if let Some(cmd) = cause.downcast_ref::<CommandExecutionError>() {
            return Some(cmd.clone());
        }
        if let Some(cmd) = rehydrate_command_error(&cause.to_string()) {
            return Some(cmd);
        }
    }
    None
}

pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ProvisioningCancelled>().is_some())
}

fn rehydrate_template_setup(raw: &str) -> Option<TemplateSetupError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    let name_matches = value
        .get("name")
        .or_else(|| value.get("kind"))
        .and_then(|v| v.as_str())
        .is_some_and(|n| n == "TemplateSetupError" || n == "template_setup_error");
    if !name_matches && value.get("templateId").is_none() {
        return None;
    }
    Some(TemplateSetupError {
        template_id: value.get("templateId")?.as_str()?.to_string(),
        workspace_path: value
            .get("workspacePath")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        command: value
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        exit_code: value
            .get("exitCode")
            .and_then(|v| v.as_i64())
            .map(|c| c as i32),
        cause: value
            .get("cause")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

fn rehydrate_command_error(raw: &str) -> Option<CommandExecutionError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    let name_matches = value
        .get("name")
        .or_else(|| value.get("kind"))
        .and_then(|v| v.as_str())
        .is_some_and(|n| n == "CommandExecutionError" || n == "command_execution_error");
    let has_shape = value.get("command").is_some() && value.get("cwd").is_some();
    if !name_matches && !has_shape {
        return None;
    }
    Some(CommandExecutionError {
        command: value.get("command")?.as_str()?.to_string(),
        cwd: value
            .get("cwd")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        exit_code: value
            .get("exitCode")
            .and_then(|v| v.as_i64())
            .map(|c| c as i32),
    })
}
