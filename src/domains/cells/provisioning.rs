//! The provisioning workflow: the state machine that drives a cell from
//! `spawning` to `ready` (or `error`).
//!
//! The synchronous create path pre-reserves the cell row with a
//! deterministic worktree path and branch, answers the client immediately,
//! and hands off to a detached background attempt. Exactly one attempt per
//! cell may run at a time; deletion cancels an attempt by flipping the row
//! to `deleting`, which every phase boundary observes.

use crate::domains::agent::AgentSessionOptions;
use crate::domains::cells::entity::{
    Cell, CellProvisioningState, CellStatus, StartMode, TimingStatus, TimingWorkflow,
};
use crate::domains::cells::timing::TimingRecorder;
use crate::domains::templates::resolve_start_mode;
use crate::domains::worktrees::{TimingSample, WorktreeManager};
use crate::engine::Engine;
use crate::errors::{
    CancellationReason, HiveError, ProvisioningCancelled, is_cancellation,
    recover_template_setup_error,
};
use crate::infrastructure::database::{CellMethods, ProvisioningStateMethods};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const MAX_PROVISIONING_ATTEMPTS: i64 = 3;
pub const RETRY_LIMIT_MESSAGE: &str =
    "Provisioning interrupted by a server restart. Retry limit exceeded.";
const INITIAL_PROMPT_WARN_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CreateCellRequest {
    pub workspace_id: String,
    pub template_id: String,
    pub name: String,
    pub description: Option<String>,
    pub model_id_override: Option<String>,
    pub provider_id_override: Option<String>,
    pub start_mode: Option<StartMode>,
}

impl Engine {
    /// Synchronous create path: resolve workspace and template, pre-reserve
    /// the row as `spawning`, kick off the background workflow, and return
    /// the spawning cell for the 201 response.
    pub async fn create_cell(self: &Arc<Self>, req: CreateCellRequest) -> Result<Cell, HiveError> {
        let workspace = self.registry.workspace(&req.workspace_id).ok_or_else(|| {
            HiveError::WorkspaceNotFound {
                workspace_id: req.workspace_id.clone(),
            }
        })?;
        let template = self.registry.template(&req.template_id).ok_or_else(|| {
            HiveError::TemplateNotFound {
                template_id: req.template_id.clone(),
            }
        })?;
        if req.name.trim().is_empty() {
            return Err(HiveError::invalid_input("name", "must not be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let cell = Cell {
            workspace_path: self.config.cell_worktree_path(&id),
            branch_name: WorktreeManager::branch_name(&id),
            id: id.clone(),
            workspace_id: workspace.id.clone(),
            workspace_root_path: workspace.root_path.clone(),
            base_commit: None,
            template_id: template.id.clone(),
            name: req.name.trim().to_string(),
            description: req.description.clone(),
            status: CellStatus::Spawning,
            opencode_session_id: None,
            last_setup_error: None,
            created_at: now,
            updated_at: now,
        };

        self.db.create_cell(&cell).map_err(HiveError::internal)?;
        self.db
            .insert_provisioning_state(&CellProvisioningState {
                cell_id: id.clone(),
                model_id_override: req.model_id_override,
                provider_id_override: req.provider_id_override,
                start_mode: resolve_start_mode(req.start_mode, template),
                started_at: None,
                finished_at: None,
                attempt_count: 0,
            })
            .map_err(HiveError::internal)?;

        self.publish_cell_status(&cell.workspace_id, &cell.id);
        self.start_provisioning_workflow(&cell.id);
        info!("Created cell {id} ({}) in workspace {}", cell.name, cell.workspace_id);
        Ok(cell)
    }

    /// Single-flight guard plus detached attempt. Returns `false` when a
    /// workflow for this cell is already executing.
    pub fn start_provisioning_workflow(self: &Arc<Self>, cell_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.active_provisioning.entry(cell_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let engine = Arc::clone(self);
        let id = cell_id.to_string();
        let handle = tokio::spawn(async move {
            engine.run_provisioning_attempt(&id).await;
            engine.active_provisioning.remove(&id);
            engine.workflows.lock().remove(&id);
        });
        self.workflows.lock().insert(cell_id.to_string(), handle);
        // The task may have already finished on another worker; do not keep
        // a handle for a completed attempt.
        if !self.active_provisioning.contains_key(cell_id) {
            self.workflows.lock().remove(cell_id);
        }
        true
    }

    async fn run_provisioning_attempt(self: &Arc<Self>, cell_id: &str) {
        let attempt = match self.db.begin_attempt(cell_id) {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!("Cannot begin provisioning attempt for cell {cell_id}: {e}");
                return;
            }
        };
        let recorder = TimingRecorder::new(
            self.db.clone(),
            self.events.clone(),
            cell_id.to_string(),
            TimingWorkflow::Create,
            Some(attempt),
        );
        info!(
            "Provisioning attempt {attempt} for cell {cell_id} (run {})",
            recorder.run_id()
        );

        let total = Instant::now();
        match self.provision(cell_id, attempt, &recorder).await {
            Ok(()) => {
                recorder.record(
                    "total",
                    TimingStatus::Ok,
                    total.elapsed().as_millis() as i64,
                    serde_json::json!({ "attempt": attempt }),
                );
                info!("Cell {cell_id} is ready (attempt {attempt})");
            }
            Err(err) => {
                recorder.record(
                    "total",
                    TimingStatus::Error,
                    total.elapsed().as_millis() as i64,
                    serde_json::json!({ "attempt": attempt, "error": format!("{err:#}") }),
                );
                self.recover_failed_attempt(cell_id, err).await;
            }
        }
    }

    async fn provision(
        self: &Arc<Self>,
        cell_id: &str,
        attempt: i64,
        recorder: &TimingRecorder,
    ) -> Result<()> {
        let cell = self
            .db
            .get_cell(cell_id)?
            .ok_or_else(|| cancellation(cell_id, CancellationReason::RowDeleted))?;
        let state = self
            .db
            .get_provisioning_state(cell_id)?
            .context("Provisioning state row is missing")?;
        let template = self
            .registry
            .template(&cell.template_id)
            .cloned()
            .ok_or_else(|| anyhow!("Template '{}' is no longer registered", cell.template_id))?;
        let prior_session = cell.opencode_session_id.clone();

        self.check_cancelled(cell_id)?;

        // Phase: create worktree. An interrupted attempt that already has a
        // base commit and a directory on disk reuses them instead of
        // recreating (the resume path must not mint a second worktree).
        let cell = if cell.base_commit.is_some() && cell.workspace_path.exists() {
            recorder.record(
                "create_worktree",
                TimingStatus::Ok,
                0,
                serde_json::json!({ "reused": true }),
            );
            cell
        } else {
            let created = recorder
                .phase("create_worktree", async {
                    let worktrees = self.worktrees.clone();
                    let root = cell.workspace_root_path.clone();
                    let id = cell.id.clone();
                    let include = template.include.clone();
                    let (result, samples) = tokio::task::spawn_blocking(move || {
                        let samples = parking_lot::Mutex::new(Vec::<TimingSample>::new());
                        let sink = |sample: TimingSample| samples.lock().push(sample);
                        let result =
                            worktrees.create_worktree(&root, &id, &include, true, Some(&sink));
                        (result, samples.into_inner())
                    })
                    .await?;
                    for sample in samples {
                        recorder.record(
                            &format!("create_worktree:{}", sample.step),
                            TimingStatus::Ok,
                            sample.duration_ms,
                            sample.metadata,
                        );
                    }
                    result.map_err(anyhow::Error::from)
                })
                .await?;
            self.db
                .set_cell_worktree(cell_id, &created.path, &created.branch, &created.base_commit)?;
            self.db
                .get_cell(cell_id)?
                .ok_or_else(|| cancellation(cell_id, CancellationReason::RowDeleted))?
        };

        self.check_cancelled(cell_id)?;

        // Phase: ensure services (includes the template's one-shot setup).
        {
            let samples = parking_lot::Mutex::new(Vec::<TimingSample>::new());
            let sink = |sample: TimingSample| samples.lock().push(sample);
            let result = recorder
                .phase(
                    "ensure_services",
                    self.supervisor
                        .ensure_cell_services(&cell, &template, Some(&sink)),
                )
                .await;
            for sample in samples.into_inner() {
                recorder.record(
                    &format!("ensure_services:{}", sample.step),
                    TimingStatus::Ok,
                    sample.duration_ms,
                    sample.metadata,
                );
            }
            result?;
        }

        self.check_cancelled(cell_id)?;

        // Phase: ensure agent session.
        let session = recorder
            .phase(
                "ensure_agent_session",
                self.agent.ensure_session(
                    &cell,
                    &AgentSessionOptions {
                        model_id: state.model_id_override.clone(),
                        provider_id: state.provider_id_override.clone(),
                        start_mode: state.start_mode,
                        existing_session_id: prior_session.clone(),
                    },
                ),
            )
            .await?;
        self.db.set_cell_opencode_session(cell_id, &session.id)?;

        self.check_cancelled(cell_id)?;

        // Phase: send initial prompt. Fire-and-forget; a soft timeout only
        // warns, and finalization never waits on the dispatch.
        if attempt == 1 || prior_session.is_none() {
            self.dispatch_initial_prompt(&cell, &session.id, recorder);
        } else {
            recorder.record(
                "send_initial_prompt",
                TimingStatus::Ok,
                0,
                serde_json::json!({ "skipped": "session already prompted" }),
            );
        }

        self.check_cancelled(cell_id)?;

        // Phase: mark ready.
        recorder
            .phase("mark_ready", async {
                self.db.set_cell_setup_error(cell_id, None)?;
                self.db.update_cell_status(cell_id, CellStatus::Ready)?;
                self.db.finish_attempt(cell_id)?;
                Ok(())
            })
            .await?;
        self.publish_cell_status(&cell.workspace_id, cell_id);
        Ok(())
    }

    fn dispatch_initial_prompt(&self, cell: &Cell, session_id: &str, recorder: &TimingRecorder) {
        let prompt = match cell.description.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => prompt.to_string(),
            _ => {
                recorder.record(
                    "send_initial_prompt",
                    TimingStatus::Ok,
                    0,
                    serde_json::json!({ "skipped": "no description" }),
                );
                return;
            }
        };

        let agent = self.agent.clone();
        let session_id = session_id.to_string();
        let cell_id = cell.id.clone();
        let dispatch = tokio::spawn(async move {
            if let Err(e) = agent.send_message(&session_id, &prompt).await {
                warn!("Initial prompt for cell {cell_id} failed: {e:#}");
            }
        });
        let watch_cell = cell.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INITIAL_PROMPT_WARN_AFTER).await;
            if !dispatch.is_finished() {
                warn!(
                    "Initial prompt for cell {watch_cell} still in flight after {INITIAL_PROMPT_WARN_AFTER:?}"
                );
            }
        });
        recorder.record(
            "send_initial_prompt",
            TimingStatus::Ok,
            0,
            serde_json::json!({ "dispatched": true }),
        );
    }

    fn check_cancelled(&self, cell_id: &str) -> Result<()> {
        match self.resolve_provisioning_cancellation(cell_id)? {
            Some(reason) => Err(cancellation(cell_id, reason)),
            None => Ok(()),
        }
    }

    /// Failure recovery. Cancellation leaves cleanup to the deletion
    /// pipeline; a template setup failure preserves the worktree and row for
    /// inspection and retry; anything else rolls the worktree back and marks
    /// the cell `error`.
    async fn recover_failed_attempt(self: &Arc<Self>, cell_id: &str, err: anyhow::Error) {
        let cancelled = is_cancellation(&err)
            || matches!(
                self.resolve_provisioning_cancellation(cell_id),
                Ok(Some(_))
            );

        if let Err(e) = self.supervisor.stop_cell_services(cell_id, true).await {
            warn!("Cleanup of services for cell {cell_id} failed: {e:#}");
        }

        if cancelled {
            // If the deletion pipeline already removed the row, a worktree
            // materialized by the overlapping create phase is ours to sweep.
            if let Ok(None) = self.db.get_cell(cell_id) {
                let path = self.config.cell_worktree_path(cell_id);
                if path.exists() {
                    let _ =
                        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path)).await;
                }
            }
            info!("Provisioning for cell {cell_id} cancelled; deletion pipeline owns cleanup");
            return;
        }

        let Ok(Some(cell)) = self.db.get_cell(cell_id) else {
            return;
        };

        let preserve = recover_template_setup_error(&err);
        match &preserve {
            Some(setup) => {
                // Preserve-on-failure: the worktree is valid, the recipe
                // failed. Keep everything for inspection and retry.
                if let Err(e) = self.db.set_cell_setup_error(cell_id, Some(&setup.diagnostic())) {
                    warn!("Failed to persist setup error for cell {cell_id}: {e}");
                }
            }
            None => {
                if let Err(e) = self
                    .db
                    .set_cell_setup_error(cell_id, Some(&format!("{err:#}")))
                {
                    warn!("Failed to persist setup error for cell {cell_id}: {e}");
                }
                let worktrees = self.worktrees.clone();
                let root = cell.workspace_root_path.clone();
                let id = cell.id.clone();
                let path = cell.workspace_path.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if worktrees.remove_worktree(&root, &id).is_err() && path.exists() {
                        let _ = std::fs::remove_dir_all(&path);
                    }
                })
                .await;
            }
        }

        if let Err(e) = self.db.update_cell_status(cell_id, CellStatus::Error) {
            warn!("Failed to mark cell {cell_id} as error: {e}");
        }
        self.publish_cell_status(&cell.workspace_id, cell_id);
        warn!(
            "Provisioning attempt for cell {cell_id} failed ({}): {err:#}",
            if preserve.is_some() {
                "worktree preserved"
            } else {
                "worktree rolled back"
            }
        );
    }

    /// Explicit retry: reset the row to `spawning` and start a fresh run.
    /// Conflicts (already in flight, deleting) surface as 409.
    pub async fn retry_setup(self: &Arc<Self>, cell_id: &str) -> Result<Cell, HiveError> {
        let cell = self
            .db
            .get_cell(cell_id)
            .map_err(HiveError::internal)?
            .ok_or_else(|| HiveError::CellNotFound {
                cell_id: cell_id.to_string(),
            })?;
        if cell.status == CellStatus::Deleting {
            return Err(HiveError::CellDeleting {
                cell_id: cell_id.to_string(),
            });
        }
        if self.provisioning_in_flight(cell_id) {
            return Err(HiveError::ProvisioningInFlight {
                cell_id: cell_id.to_string(),
            });
        }

        self.db
            .set_cell_setup_error(cell_id, None)
            .map_err(HiveError::internal)?;
        self.db
            .update_cell_status(cell_id, CellStatus::Spawning)
            .map_err(HiveError::internal)?;
        // Re-insert the state row if a previous cleanup removed it (no-op
        // on conflict).
        let template = self.registry.template(&cell.template_id);
        self.db
            .insert_provisioning_state(&CellProvisioningState {
                cell_id: cell_id.to_string(),
                model_id_override: None,
                provider_id_override: None,
                start_mode: template
                    .map(|t| resolve_start_mode(None, t))
                    .unwrap_or(StartMode::Plan),
                started_at: None,
                finished_at: None,
                attempt_count: 0,
            })
            .map_err(HiveError::internal)?;

        if !self.start_provisioning_workflow(cell_id) {
            return Err(HiveError::ProvisioningInFlight {
                cell_id: cell_id.to_string(),
            });
        }

        self.publish_cell_status(&cell.workspace_id, cell_id);
        info!("Retry requested for cell {cell_id}");
        self.db
            .get_cell(cell_id)
            .map_err(HiveError::internal)?
            .ok_or_else(|| HiveError::CellNotFound {
                cell_id: cell_id.to_string(),
            })
    }

    /// Boot-time recovery: flag services that lost their processes with the
    /// previous server, restart interrupted provisioning runs (capped at
    /// `MAX_PROVISIONING_ATTEMPTS`), and re-run interrupted deletions.
    pub async fn resume_interrupted(self: &Arc<Self>) -> Result<()> {
        use crate::infrastructure::database::CellServiceMethods;
        let flagged = self.db.mark_services_needing_resume()?;
        if flagged > 0 {
            info!("Flagged {flagged} service(s) from a previous server run as needs_resume");
        }

        for cell in self.db.list_cells_by_status(CellStatus::Spawning)? {
            let attempts = self
                .db
                .get_provisioning_state(&cell.id)?
                .map(|state| state.attempt_count)
                .unwrap_or(0);
            if attempts >= MAX_PROVISIONING_ATTEMPTS {
                warn!(
                    "Cell {} exceeded {MAX_PROVISIONING_ATTEMPTS} provisioning attempts; marking error",
                    cell.id
                );
                self.db
                    .set_cell_setup_error(&cell.id, Some(RETRY_LIMIT_MESSAGE))?;
                self.db.update_cell_status(&cell.id, CellStatus::Error)?;
                self.publish_cell_status(&cell.workspace_id, &cell.id);
                continue;
            }
            info!(
                "Resuming interrupted provisioning for cell {} (attempt {} so far)",
                cell.id, attempts
            );
            self.start_provisioning_workflow(&cell.id);
        }

        for cell in self.db.list_cells_by_status(CellStatus::Deleting)? {
            info!("Resuming interrupted deletion for cell {}", cell.id);
            let engine = Arc::clone(self);
            let cell_id = cell.id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.delete_cell(&cell_id).await {
                    warn!("Resumed deletion of cell {cell_id} failed: {e}");
                }
            });
        }
        Ok(())
    }
}

fn cancellation(cell_id: &str, reason: CancellationReason) -> anyhow::Error {
    anyhow::Error::new(ProvisioningCancelled {
        cell_id: cell_id.to_string(),
        reason,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::domains::agent::mock::MockAgent;
    use crate::domains::templates::Registry;
    use crate::infrastructure::database::TimingMethods;
    use std::path::PathBuf;
    use std::process::Command;
    use tempfile::TempDir;

    pub(crate) fn setup_workspace_repo(tmp: &TempDir) -> PathBuf {
        let repo_path = tmp.path().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(&repo_path)
                .output()
                .unwrap();
        }
        std::fs::write(repo_path.join("README.md"), "Initial").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        repo_path
    }

    pub(crate) fn test_engine(tmp: &TempDir, template_body: &str) -> Arc<Engine> {
        let repo_path = setup_workspace_repo(tmp);
        let registry = Registry::parse(&format!(
            r#"
            [[workspaces]]
            id = "w1"
            name = "Main"
            root_path = "{}"

            [[templates]]
            id = "hive-dev"
            {template_body}
            "#,
            repo_path.display()
        ))
        .unwrap();
        let config = RuntimeConfig::from_env(
            "127.0.0.1:0".parse().unwrap(),
            Some(tmp.path().join("data")),
            tmp.path().join("hive.toml"),
        )
        .unwrap();
        Engine::for_tests(config, registry, Arc::new(MockAgent::default()))
    }

    pub(crate) fn create_request() -> CreateCellRequest {
        CreateCellRequest {
            workspace_id: "w1".to_string(),
            template_id: "hive-dev".to_string(),
            name: "c1".to_string(),
            description: Some("build the widget".to_string()),
            model_id_override: None,
            provider_id_override: None,
            start_mode: None,
        }
    }

    pub(crate) async fn wait_for_status(
        engine: &Engine,
        cell_id: &str,
        status: CellStatus,
    ) -> Cell {
        for _ in 0..300 {
            if let Some(cell) = engine.db.get_cell(cell_id).unwrap()
                && cell.status == status
            {
                return cell;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("cell {cell_id} never reached {status:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn happy_create_converges_to_ready() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(
            &tmp,
            r#"
            setup = ["echo setting up"]
            [[templates.services]]
            name = "worker"
            command = "sleep 30"
            "#,
        );

        let cell = engine.create_cell(create_request()).await.unwrap();
        assert_eq!(cell.status, CellStatus::Spawning);

        let ready = wait_for_status(&engine, &cell.id, CellStatus::Ready).await;
        assert_eq!(ready.opencode_session_id.as_deref(), Some(&*format!("sess-{}", cell.id)));
        assert!(ready.workspace_path.exists());
        assert!(ready.base_commit.is_some());
        assert!(ready.last_setup_error.is_none());

        let state = engine.db.get_provisioning_state(&cell.id).unwrap().unwrap();
        assert_eq!(state.attempt_count, 1);
        assert!(state.finished_at.is_some());

        let timings = engine.db.list_timing_events(&cell.id, None).unwrap();
        let total = timings
            .iter()
            .find(|t| t.step == "total")
            .expect("total event must exist");
        assert_eq!(total.status, TimingStatus::Ok);
        let run_ids: std::collections::HashSet<_> =
            timings.iter().map(|t| t.run_id.clone()).collect();
        assert_eq!(run_ids.len(), 1, "one run id per workflow run");

        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_setup_failure_preserves_worktree_and_row() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, r#"setup = ["exit 7"]"#);

        let cell = engine.create_cell(create_request()).await.unwrap();
        let failed = wait_for_status(&engine, &cell.id, CellStatus::Error).await;

        let detail = failed.last_setup_error.expect("diagnostic must be set");
        assert!(detail.contains("Exit code 7"), "got: {detail}");
        assert!(detail.contains("exit 7"), "got: {detail}");
        assert!(
            failed.workspace_path.exists(),
            "worktree must be preserved on template setup failure"
        );

        // Retry flips the row back to spawning.
        let retried = engine.retry_setup(&cell.id).await.unwrap();
        assert_eq!(retried.status, CellStatus::Spawning);
        assert!(retried.last_setup_error.is_none());

        wait_for_status(&engine, &cell.id, CellStatus::Error).await;
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_failure_rolls_back_the_worktree() {
        let tmp = TempDir::new().unwrap();
        let repo_path = setup_workspace_repo(&tmp);
        let registry = Registry::parse(&format!(
            r#"
            [[workspaces]]
            id = "w1"
            name = "Main"
            root_path = "{}"

            [[templates]]
            id = "hive-dev"
            "#,
            repo_path.display()
        ))
        .unwrap();
        let config = RuntimeConfig::from_env(
            "127.0.0.1:0".parse().unwrap(),
            Some(tmp.path().join("data")),
            tmp.path().join("hive.toml"),
        )
        .unwrap();
        let agent = Arc::new(MockAgent {
            fail_ensure: true,
            ..Default::default()
        });
        let engine = Engine::for_tests(config, registry, agent);

        let cell = engine.create_cell(create_request()).await.unwrap();
        let failed = wait_for_status(&engine, &cell.id, CellStatus::Error).await;
        assert!(
            !failed.workspace_path.exists(),
            "generic failures must roll the worktree back"
        );
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workflow_is_single_flight_per_cell() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, r#"setup = ["sleep 5"]"#);
        let cell = engine.create_cell(create_request()).await.unwrap();

        assert!(!engine.start_provisioning_workflow(&cell.id));
        let err = engine.retry_setup(&cell.id).await.unwrap_err();
        assert!(matches!(err, HiveError::ProvisioningInFlight { .. }));

        engine.delete_cell(&cell.id).await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resume_caps_at_three_attempts() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, "");
        let cell = engine.create_cell(create_request()).await.unwrap();
        wait_for_status(&engine, &cell.id, CellStatus::Ready).await;

        // Simulate a crash loop: back to spawning with the cap reached.
        engine
            .db
            .update_cell_status(&cell.id, CellStatus::Spawning)
            .unwrap();
        engine.db.begin_attempt(&cell.id).unwrap();
        engine.db.begin_attempt(&cell.id).unwrap();

        engine.resume_interrupted().await.unwrap();
        let failed = wait_for_status(&engine, &cell.id, CellStatus::Error).await;
        assert_eq!(failed.last_setup_error.as_deref(), Some(RETRY_LIMIT_MESSAGE));
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resume_restarts_interrupted_attempts_below_the_cap() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, "");
        let cell = engine.create_cell(create_request()).await.unwrap();
        wait_for_status(&engine, &cell.id, CellStatus::Ready).await;

        // One prior attempt, interrupted mid-flight: worktree exists,
        // status back to spawning.
        engine
            .db
            .update_cell_status(&cell.id, CellStatus::Spawning)
            .unwrap();
        engine.resume_interrupted().await.unwrap();

        let ready = wait_for_status(&engine, &cell.id, CellStatus::Ready).await;
        let state = engine.db.get_provisioning_state(&cell.id).unwrap().unwrap();
        assert_eq!(state.attempt_count, 2);
        assert!(ready.workspace_path.exists());
        engine.shutdown().await;
    }
}
