use super::connection::Database;
use crate::domains::cells::entity::{CellProvisioningState, StartMode};
use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use rusqlite::{OptionalExtension, Row, params};

pub trait ProvisioningStateMethods {
    /// Inserts the 1:1 state row; a no-op when it already exists.
    fn insert_provisioning_state(&self, state: &CellProvisioningState) -> Result<()>;
    fn get_provisioning_state(&self, cell_id: &str) -> Result<Option<CellProvisioningState>>;
    /// Marks the beginning of an attempt: bumps `attempt_count`, stamps
    /// `started_at`, clears `finished_at`. Returns the new attempt number.
    fn begin_attempt(&self, cell_id: &str) -> Result<i64>;
    fn finish_attempt(&self, cell_id: &str) -> Result<()>;
}

impl ProvisioningStateMethods for Database {
    fn insert_provisioning_state(&self, state: &CellProvisioningState) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO cell_provisioning_states (
                cell_id, model_id_override, provider_id_override, start_mode,
                started_at, finished_at, attempt_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                state.cell_id,
                state.model_id_override,
                state.provider_id_override,
                state.start_mode.as_str(),
                state.started_at.map(|t| t.timestamp()),
                state.finished_at.map(|t| t.timestamp()),
                state.attempt_count,
            ],
        )?;
        Ok(())
    }

    fn get_provisioning_state(&self, cell_id: &str) -> Result<Option<CellProvisioningState>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT cell_id, model_id_override, provider_id_override, start_mode,
                    started_at, finished_at, attempt_count
             FROM cell_provisioning_states
             WHERE cell_id = ?1",
        )?;
        let state = stmt
            .query_row(params![cell_id], row_to_state)
            .optional()?;
        Ok(state)
    }

    fn begin_attempt(&self, cell_id: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE cell_provisioning_states
             SET attempt_count = attempt_count + 1, started_at = ?1, finished_at = NULL
             WHERE cell_id = ?2",
            params![Utc::now().timestamp(), cell_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("No provisioning state for cell '{cell_id}'"));
        }
        let attempt = conn.query_row(
            "SELECT attempt_count FROM cell_provisioning_states WHERE cell_id = ?1",
            params![cell_id],
            |row| row.get(0),
        )?;
        Ok(attempt)
    }

    fn finish_attempt(&self, cell_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE cell_provisioning_states SET finished_at = ?1 WHERE cell_id = ?2",
            params![Utc::now().timestamp(), cell_id],
        )?;
        Ok(())
    }
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<CellProvisioningState> {
    let mode_raw: String = row.get(3)?;
    let start_mode = StartMode::parse(&mode_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown start mode '{mode_raw}'").into(),
        )
    })?;
    Ok(CellProvisioningState {
        cell_id: row.get(0)?,
        model_id_override: row.get(1)?,
        provider_id_override: row.get(2)?,
        start_mode,
        started_at: row
            .get::<_, Option<i64>>(4)?
            .map(|ts| Utc.timestamp_opt(ts, 0).unwrap()),
        finished_at: row
            .get::<_, Option<i64>>(5)?
            .map(|ts| Utc.timestamp_opt(ts, 0).unwrap()),
        attempt_count: row.get(6)?,
    })
}
