//! The deletion pipeline.
//!
//! `deleting` is absorbing: the status flip doubles as the cancellation
//! signal for any in-flight provisioning attempt. Every subsequent step is
//! best-effort except the final row delete; the row cascades its service,
//! provisioning, activity, and timing rows away.

use crate::domains::cells::entity::{CellStatus, TimingStatus, TimingWorkflow};
use crate::domains::cells::timing::TimingRecorder;
use crate::domains::terminal::keys::{
    chat_terminal_key, service_terminal_key, setup_terminal_key, shell_terminal_key,
};
use crate::engine::Engine;
use crate::errors::HiveError;
use crate::infrastructure::database::{CellMethods, CellServiceMethods};
use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

impl Engine {
    pub async fn delete_cell(self: &Arc<Self>, cell_id: &str) -> Result<(), HiveError> {
        let cell = self
            .db
            .get_cell(cell_id)
            .map_err(HiveError::internal)?
            .ok_or_else(|| HiveError::CellNotFound {
                cell_id: cell_id.to_string(),
            })?;

        // Absorbing state; also the cancellation signal for provisioning.
        if cell.status != CellStatus::Deleting {
            self.db
                .update_cell_status(cell_id, CellStatus::Deleting)
                .map_err(HiveError::internal)?;
            self.publish_cell_status(&cell.workspace_id, cell_id);
        }

        let recorder = TimingRecorder::new(
            self.db.clone(),
            self.events.clone(),
            cell_id.to_string(),
            TimingWorkflow::Delete,
            None,
        );
        let total = Instant::now();
        info!("Deleting cell {cell_id} (run {})", recorder.run_id());

        let _ = recorder
            .phase("close_agent_session", async {
                if let Some(session_id) = &cell.opencode_session_id
                    && let Err(e) = self.agent.close_session(session_id).await
                {
                    warn!("Closing agent session for cell {cell_id} failed: {e:#}");
                }
                Ok(())
            })
            .await;

        let _ = recorder
            .phase("close_terminals", async {
                self.shell_terminals.close_session(&shell_terminal_key(cell_id));
                self.chat_terminals.close_session(&chat_terminal_key(cell_id));
                self.service_terminals
                    .close_session(&setup_terminal_key(cell_id));
                for service in self.db.list_cell_services(cell_id).unwrap_or_default() {
                    self.service_terminals
                        .close_session(&service_terminal_key(&service.id));
                }
                Ok(())
            })
            .await;

        let _ = recorder
            .phase("stop_services", async {
                self.supervisor.stop_cell_services(cell_id, true).await?;
                Ok(())
            })
            .await;

        let _ = recorder
            .phase("remove_worktree", async {
                let worktrees = self.worktrees.clone();
                let root = cell.workspace_root_path.clone();
                let id = cell.id.clone();
                let path = cell.workspace_path.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = worktrees.remove_worktree(&root, &id) {
                        warn!("Structured worktree removal for cell {id} failed ({e}); falling back to filesystem removal");
                        if path.exists() {
                            std::fs::remove_dir_all(&path)?;
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                })
                .await??;
                Ok(())
            })
            .await;

        // Recorded before the row goes away; the cascade removes this run's
        // rows, but subscribers already saw the events live.
        recorder.record(
            "total",
            TimingStatus::Ok,
            total.elapsed().as_millis() as i64,
            serde_json::json!({}),
        );

        let deleted = self
            .db
            .delete_cell(cell_id)
            .map_err(HiveError::internal)?;
        if !deleted {
            // A concurrent deletion finished first; nothing left to do.
            return Ok(());
        }

        self.publish_cell_removed(&cell.workspace_id, cell_id);
        info!("Deleted cell {cell_id}");
        Ok(())
    }

    /// Sequential fan-out; returns only the IDs that were actually removed.
    pub async fn delete_cells(self: &Arc<Self>, cell_ids: &[String]) -> Vec<String> {
        let mut deleted = Vec::new();
        for cell_id in cell_ids {
            match self.delete_cell(cell_id).await {
                Ok(()) => deleted.push(cell_id.clone()),
                Err(e) => warn!("Bulk delete: skipping cell {cell_id}: {e}"),
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::cells::provisioning::tests::{
        create_request, test_engine, wait_for_status,
    };
    use crate::domains::services::ports::process_alive;
    use crate::infrastructure::database::ProvisioningStateMethods;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_removes_rows_worktree_and_processes() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(
            &tmp,
            r#"
            [[templates.services]]
            name = "worker"
            command = "sleep 60"
            "#,
        );
        let cell = engine.create_cell(create_request()).await.unwrap();
        wait_for_status(&engine, &cell.id, crate::domains::cells::entity::CellStatus::Ready).await;

        let services = engine.supervisor.start_cell_services(&cell.id).await.unwrap();
        let pid = services[0].pid.expect("service must be running");
        assert!(process_alive(pid));

        engine.delete_cell(&cell.id).await.unwrap();

        assert!(engine.db.get_cell(&cell.id).unwrap().is_none());
        assert!(
            engine
                .db
                .get_provisioning_state(&cell.id)
                .unwrap()
                .is_none()
        );
        assert!(engine.db.list_cell_services(&cell.id).unwrap().is_empty());
        assert!(!cell.workspace_path.exists());

        // SIGTERM grace may still be draining; poll briefly.
        for _ in 0..50 {
            if !process_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!process_alive(pid), "service process must not survive");
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_during_provisioning_cancels_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, r#"setup = ["sleep 10"]"#);
        let cell = engine.create_cell(create_request()).await.unwrap();

        // Let the workflow get into the setup phase, then delete.
        tokio::time::sleep(Duration::from_millis(400)).await;
        engine.delete_cell(&cell.id).await.unwrap();

        // Wait for the cancelled workflow to settle.
        for _ in 0..100 {
            if !engine.provisioning_in_flight(&cell.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(engine.db.get_cell(&cell.id).unwrap().is_none());
        assert!(!cell.workspace_path.exists());
        assert!(!engine.provisioning_in_flight(&cell.id));
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bulk_delete_reports_only_successes() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, "");
        let cell = engine.create_cell(create_request()).await.unwrap();
        wait_for_status(&engine, &cell.id, crate::domains::cells::entity::CellStatus::Ready).await;

        let deleted = engine
            .delete_cells(&[cell.id.clone(), "missing-cell".to_string()])
            .await;
        assert_eq!(deleted, vec![cell.id.clone()]);
        engine.shutdown().await;
    }
}
