//! Per-run timing telemetry.
//!
//! Every provisioning or deletion run gets a fresh `run_id`; each phase is
//! persisted as a `cell_timing_events` row and mirrored on the cell's
//! timing topic so SSE subscribers see them live.

use crate::domains::cells::entity::{TimingStatus, TimingWorkflow};
use crate::infrastructure::database::{Database, NewTimingEvent, TimingMethods};
use crate::infrastructure::events::{BusEvent, EventBus, cell_timing_topic};
use log::debug;
use std::time::Instant;
use uuid::Uuid;

pub struct TimingRecorder {
    db: Database,
    events: EventBus,
    cell_id: String,
    run_id: String,
    workflow: TimingWorkflow,
    attempt: Option<i64>,
}

impl TimingRecorder {
    pub fn new(
        db: Database,
        events: EventBus,
        cell_id: String,
        workflow: TimingWorkflow,
        attempt: Option<i64>,
    ) -> Self {
        Self {
            db,
            events,
            cell_id,
            run_id: Uuid::new_v4().to_string(),
            workflow,
            attempt,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Persists and publishes one sample. Failures are swallowed: telemetry
    /// must never fail a workflow, and late samples of a delete run lose
    /// their row the moment the cell cascades away.
    pub fn record(
        &self,
        step: &str,
        status: TimingStatus,
        duration_ms: i64,
        metadata: serde_json::Value,
    ) {
        let event = NewTimingEvent {
            cell_id: self.cell_id.clone(),
            run_id: self.run_id.clone(),
            workflow: self.workflow,
            step: step.to_string(),
            status,
            duration_ms,
            attempt: self.attempt,
            metadata,
        };
        match self.db.insert_timing_event(&event) {
            Ok(persisted) => {
                self.events.publish(
                    &cell_timing_topic(&self.cell_id),
                    BusEvent::new("timing", &persisted),
                );
            }
            Err(e) => {
                debug!(
                    "Dropping timing sample '{step}' for cell {}: {e}",
                    self.cell_id
                );
            }
        }
    }

    /// Runs a phase, timing it and recording ok/error.
    pub async fn phase<T, F>(&self, step: &str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        match fut.await {
            Ok(value) => {
                self.record(
                    step,
                    TimingStatus::Ok,
                    started.elapsed().as_millis() as i64,
                    serde_json::json!({}),
                );
                Ok(value)
            }
            Err(err) => {
                self.record(
                    step,
                    TimingStatus::Error,
                    started.elapsed().as_millis() as i64,
                    serde_json::json!({ "error": format!("{err:#}") }),
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::CellMethods;
    use crate::infrastructure::database::db_cells::test_cell;

    fn recorder(db: &Database) -> TimingRecorder {
        TimingRecorder::new(
            db.clone(),
            EventBus::new(),
            "c1".to_string(),
            TimingWorkflow::Create,
            Some(1),
        )
    }

    #[tokio::test]
    async fn phases_share_the_run_id_and_carry_status() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        db.create_cell(&test_cell("c1", "w1")).unwrap();

        let recorder = recorder(&db);
        recorder
            .phase("create_worktree", async { Ok(()) })
            .await
            .unwrap();
        let failed: anyhow::Result<()> = recorder
            .phase("ensure_services", async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(failed.is_err());

        let events = db.list_timing_events("c1", None).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.run_id == recorder.run_id()));
        assert_eq!(events[0].status, TimingStatus::Ok);
        assert_eq!(events[1].status, TimingStatus::Error);
        assert!(events[1].metadata["error"].as_str().unwrap().contains("boom"));
        assert_eq!(events[1].attempt, Some(1));
    }

    #[tokio::test]
    async fn recording_for_a_deleted_cell_is_silent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        let recorder = recorder(&db);
        // No cell row exists; the FK violation must not panic or error.
        recorder.record("total", TimingStatus::Ok, 5, serde_json::json!({}));
    }
}
