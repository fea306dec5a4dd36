use super::connection::Database;
use crate::domains::cells::entity::{CellTimingEvent, TimingStatus, TimingWorkflow};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use rusqlite::{Row, params};

/// Insert payload; `id`/`created_at` are assigned by the database.
#[derive(Debug, Clone)]
pub struct NewTimingEvent {
    pub cell_id: String,
    pub run_id: String,
    pub workflow: TimingWorkflow,
    pub step: String,
    pub status: TimingStatus,
    pub duration_ms: i64,
    pub attempt: Option<i64>,
    pub metadata: serde_json::Value,
}

pub trait TimingMethods {
    fn insert_timing_event(&self, event: &NewTimingEvent) -> Result<CellTimingEvent>;
    fn list_timing_events(
        &self,
        cell_id: &str,
        workflow: Option<TimingWorkflow>,
    ) -> Result<Vec<CellTimingEvent>>;
    fn list_global_timing_events(&self, limit: usize) -> Result<Vec<CellTimingEvent>>;
}

impl TimingMethods for Database {
    fn insert_timing_event(&self, event: &NewTimingEvent) -> Result<CellTimingEvent> {
        let conn = self.get_conn()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO cell_timing_events (
                cell_id, run_id, workflow, step, status, duration_ms, attempt, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.cell_id,
                event.run_id,
                event.workflow.as_str(),
                event.step,
                event.status.as_str(),
                event.duration_ms,
                event.attempt,
                event.metadata.to_string(),
                created_at.timestamp(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(CellTimingEvent {
            id,
            cell_id: event.cell_id.clone(),
            run_id: event.run_id.clone(),
            workflow: event.workflow,
            step: event.step.clone(),
            status: event.status,
            duration_ms: event.duration_ms,
            attempt: event.attempt,
            metadata: event.metadata.clone(),
            created_at: Utc.timestamp_opt(created_at.timestamp(), 0).unwrap(),
        })
    }

    fn list_timing_events(
        &self,
        cell_id: &str,
        workflow: Option<TimingWorkflow>,
    ) -> Result<Vec<CellTimingEvent>> {
        let conn = self.get_conn()?;
        let mut events = Vec::new();
        match workflow {
            Some(workflow) => {
                let mut stmt = conn.prepare(&format!(
                    "{TIMING_SELECT} WHERE cell_id = ?1 AND workflow = ?2
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows =
                    stmt.query_map(params![cell_id, workflow.as_str()], row_to_timing)?;
                for row in rows {
                    events.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{TIMING_SELECT} WHERE cell_id = ?1 ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(params![cell_id], row_to_timing)?;
                for row in rows {
                    events.push(row?);
                }
            }
        }
        Ok(events)
    }

    fn list_global_timing_events(&self, limit: usize) -> Result<Vec<CellTimingEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{TIMING_SELECT} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_timing)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

const TIMING_SELECT: &str = "SELECT id, cell_id, run_id, workflow, step, status, duration_ms,
            attempt, metadata, created_at
     FROM cell_timing_events";

fn row_to_timing(row: &Row<'_>) -> rusqlite::Result<CellTimingEvent> {
    let workflow_raw: String = row.get(3)?;
    let workflow = TimingWorkflow::parse(&workflow_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown workflow '{workflow_raw}'").into(),
        )
    })?;
    let status_raw: String = row.get(5)?;
    let status = if status_raw == "ok" {
        TimingStatus::Ok
    } else {
        TimingStatus::Error
    };
    let metadata_raw: String = row.get(8)?;
    Ok(CellTimingEvent {
        id: row.get(0)?,
        cell_id: row.get(1)?,
        run_id: row.get(2)?,
        workflow,
        step: row.get(4)?,
        status,
        duration_ms: row.get(6)?,
        attempt: row.get(7)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        created_at: Utc.timestamp_opt(row.get::<_, i64>(9)?, 0).unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::CellMethods;
    use crate::infrastructure::database::db_cells::test_cell;

    fn event(cell_id: &str, run_id: &str, workflow: TimingWorkflow, step: &str) -> NewTimingEvent {
        NewTimingEvent {
            cell_id: cell_id.to_string(),
            run_id: run_id.to_string(),
            workflow,
            step: step.to_string(),
            status: TimingStatus::Ok,
            duration_ms: 12,
            attempt: Some(1),
            metadata: serde_json::json!({}),
        }
    }

    fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        (tmp, db)
    }

    #[test]
    fn events_of_one_run_are_totally_ordered() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();

        for step in ["create_worktree", "ensure_services", "total"] {
            db.insert_timing_event(&event("c1", "r1", TimingWorkflow::Create, step))
                .unwrap();
        }
        let events = db.list_timing_events("c1", None).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.run_id == "r1"));
        assert_eq!(events[0].step, "create_worktree");
        assert_eq!(events[2].step, "total");
    }

    #[test]
    fn workflow_filter_applies() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();
        db.insert_timing_event(&event("c1", "r1", TimingWorkflow::Create, "total"))
            .unwrap();
        db.insert_timing_event(&event("c1", "r2", TimingWorkflow::Delete, "total"))
            .unwrap();

        let creates = db
            .list_timing_events("c1", Some(TimingWorkflow::Create))
            .unwrap();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].workflow, TimingWorkflow::Create);

        let all = db.list_timing_events("c1", None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn global_listing_is_bounded() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();
        for i in 0..5 {
            db.insert_timing_event(&event("c1", "r1", TimingWorkflow::Create, &format!("s{i}")))
                .unwrap();
        }
        assert_eq!(db.list_global_timing_events(3).unwrap().len(), 3);
    }
}
