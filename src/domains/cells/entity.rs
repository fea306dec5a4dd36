use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Spawning,
    Ready,
    Error,
    Deleting,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Spawning => "spawning",
            CellStatus::Ready => "ready",
            CellStatus::Error => "error",
            CellStatus::Deleting => "deleting",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "spawning" => Some(CellStatus::Spawning),
            "ready" => Some(CellStatus::Ready),
            "error" => Some(CellStatus::Error),
            "deleting" => Some(CellStatus::Deleting),
            _ => None,
        }
    }
}

/// The unit of isolation: worktree + services + agent session + terminals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub id: String,
    pub workspace_id: String,
    pub workspace_root_path: PathBuf,
    /// Absolute path to the worktree, chosen deterministically before the
    /// worktree exists so the row can be inserted first.
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub base_commit: Option<String>,
    pub template_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: CellStatus,
    pub opencode_session_id: Option<String>,
    pub last_setup_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Plan,
    Build,
}

impl StartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMode::Plan => "plan",
            StartMode::Build => "build",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "plan" => Some(StartMode::Plan),
            "build" => Some(StartMode::Build),
            _ => None,
        }
    }
}

/// 1:1 with a cell; retry/attempt bookkeeping plus the agent selection
/// overrides applied when the session is (re)started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellProvisioningState {
    pub cell_id: String,
    pub model_id_override: Option<String>,
    pub provider_id_override: Option<String>,
    pub start_mode: StartMode,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Process,
    Docker,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Process => "process",
            ServiceKind::Docker => "docker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "process" => Some(ServiceKind::Process),
            "docker" => Some(ServiceKind::Docker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    NeedsResume,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
            ServiceStatus::NeedsResume => "needs_resume",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ServiceStatus::Pending),
            "starting" => Some(ServiceStatus::Starting),
            "running" => Some(ServiceStatus::Running),
            "stopping" => Some(ServiceStatus::Stopping),
            "stopped" => Some(ServiceStatus::Stopped),
            "error" => Some(ServiceStatus::Error),
            "needs_resume" => Some(ServiceStatus::NeedsResume),
            _ => None,
        }
    }
}

/// One row per service declared by the cell's template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellService {
    pub id: String,
    pub cell_id: String,
    pub name: String,
    pub kind: ServiceKind,
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub status: ServiceStatus,
    pub last_known_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingWorkflow {
    Create,
    Delete,
}

impl TimingWorkflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimingWorkflow::Create => "create",
            TimingWorkflow::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(TimingWorkflow::Create),
            "delete" => Some(TimingWorkflow::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingStatus {
    Ok,
    Error,
}

impl TimingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimingStatus::Ok => "ok",
            TimingStatus::Error => "error",
        }
    }
}

/// Append-only: one row per phase of a create or delete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellTimingEvent {
    pub id: i64,
    pub cell_id: String,
    pub run_id: String,
    pub workflow: TimingWorkflow,
    pub step: String,
    pub status: TimingStatus,
    pub duration_ms: i64,
    pub attempt: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit trail of user-visible actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellActivityEvent {
    pub id: i64,
    pub cell_id: String,
    pub action: String,
    pub detail: Option<String>,
    pub source: Option<String>,
    pub tool: Option<String>,
    pub audit_event: Option<String>,
    pub service_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_status_round_trips_through_strings() {
        for status in [
            CellStatus::Spawning,
            CellStatus::Ready,
            CellStatus::Error,
            CellStatus::Deleting,
        ] {
            assert_eq!(CellStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CellStatus::parse("bogus"), None);
    }

    #[test]
    fn service_status_covers_needs_resume() {
        assert_eq!(
            ServiceStatus::parse("needs_resume"),
            Some(ServiceStatus::NeedsResume)
        );
        assert_eq!(ServiceStatus::NeedsResume.as_str(), "needs_resume");
    }

    #[test]
    fn cell_serializes_with_camel_case_fields() {
        let cell = Cell {
            id: "c1".into(),
            workspace_id: "w1".into(),
            workspace_root_path: PathBuf::from("/repo"),
            workspace_path: PathBuf::from("/repo/.hive/cells/c1"),
            branch_name: "cell-c1".into(),
            base_commit: None,
            template_id: "hive-dev".into(),
            name: "c1".into(),
            description: None,
            status: CellStatus::Spawning,
            opencode_session_id: None,
            last_setup_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["workspaceId"], "w1");
        assert_eq!(json["status"], "spawning");
        assert!(json["opencodeSessionId"].is_null());
    }
}
