use super::connection::Database;
use crate::domains::cells::entity::{Cell, CellStatus};
use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::path::PathBuf;

pub trait CellMethods {
    fn create_cell(&self, cell: &Cell) -> Result<()>;
    fn get_cell(&self, id: &str) -> Result<Option<Cell>>;
    fn list_cells(&self, workspace_id: &str) -> Result<Vec<Cell>>;
    fn list_cells_by_status(&self, status: CellStatus) -> Result<Vec<Cell>>;
    fn update_cell_status(&self, id: &str, status: CellStatus) -> Result<()>;
    fn set_cell_worktree(
        &self,
        id: &str,
        workspace_path: &std::path::Path,
        branch_name: &str,
        base_commit: &str,
    ) -> Result<()>;
    fn set_cell_opencode_session(&self, id: &str, session_id: &str) -> Result<()>;
    fn set_cell_setup_error(&self, id: &str, error: Option<&str>) -> Result<()>;
    fn delete_cell(&self, id: &str) -> Result<bool>;
}

impl CellMethods for Database {
    fn create_cell(&self, cell: &Cell) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO cells (
                id, workspace_id, workspace_root_path, workspace_path, branch_name,
                base_commit, template_id, name, description, status,
                opencode_session_id, last_setup_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                cell.id,
                cell.workspace_id,
                cell.workspace_root_path.to_string_lossy(),
                cell.workspace_path.to_string_lossy(),
                cell.branch_name,
                cell.base_commit,
                cell.template_id,
                cell.name,
                cell.description,
                cell.status.as_str(),
                cell.opencode_session_id,
                cell.last_setup_error,
                cell.created_at.timestamp(),
                cell.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    fn get_cell(&self, id: &str) -> Result<Option<Cell>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{CELL_SELECT} WHERE id = ?1"))?;
        let cell = stmt.query_row(params![id], row_to_cell).optional()?;
        Ok(cell)
    }

    fn list_cells(&self, workspace_id: &str) -> Result<Vec<Cell>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{CELL_SELECT} WHERE workspace_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![workspace_id], row_to_cell)?;
        let mut cells = Vec::new();
        for row in rows {
            cells.push(row?);
        }
        Ok(cells)
    }

    fn list_cells_by_status(&self, status: CellStatus) -> Result<Vec<Cell>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{CELL_SELECT} WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_cell)?;
        let mut cells = Vec::new();
        for row in rows {
            cells.push(row?);
        }
        Ok(cells)
    }

    fn update_cell_status(&self, id: &str, status: CellStatus) -> Result<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE cells SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().timestamp(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("Cell '{id}' not found"));
        }
        Ok(())
    }

    fn set_cell_worktree(
        &self,
        id: &str,
        workspace_path: &std::path::Path,
        branch_name: &str,
        base_commit: &str,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE cells
             SET workspace_path = ?1, branch_name = ?2, base_commit = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                workspace_path.to_string_lossy(),
                branch_name,
                base_commit,
                Utc::now().timestamp(),
                id
            ],
        )?;
        Ok(())
    }

    fn set_cell_opencode_session(&self, id: &str, session_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE cells SET opencode_session_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![session_id, Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    fn set_cell_setup_error(&self, id: &str, error: Option<&str>) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE cells SET last_setup_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    fn delete_cell(&self, id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM cells WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

const CELL_SELECT: &str = "SELECT id, workspace_id, workspace_root_path, workspace_path,
            branch_name, base_commit, template_id, name, description, status,
            opencode_session_id, last_setup_error, created_at, updated_at
     FROM cells";

fn row_to_cell(row: &Row<'_>) -> rusqlite::Result<Cell> {
    let status_raw: String = row.get(9)?;
    let status = CellStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown cell status '{status_raw}'").into(),
        )
    })?;
    Ok(Cell {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        workspace_root_path: PathBuf::from(row.get::<_, String>(2)?),
        workspace_path: PathBuf::from(row.get::<_, String>(3)?),
        branch_name: row.get(4)?,
        base_commit: row.get(5)?,
        template_id: row.get(6)?,
        name: row.get(7)?,
        description: row.get(8)?,
        status,
        opencode_session_id: row.get(10)?,
        last_setup_error: row.get(11)?,
        created_at: Utc.timestamp_opt(row.get::<_, i64>(12)?, 0).unwrap(),
        updated_at: Utc.timestamp_opt(row.get::<_, i64>(13)?, 0).unwrap(),
    })
}

#[cfg(test)]
pub fn test_cell(id: &str, workspace_id: &str) -> Cell {
    Cell {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        workspace_root_path: PathBuf::from("/repo"),
        workspace_path: PathBuf::from(format!("/repo/.hive/cells/{id}")),
        branch_name: format!("cell-{id}"),
        base_commit: None,
        template_id: "hive-dev".to_string(),
        name: id.to_string(),
        description: None,
        status: CellStatus::Spawning,
        opencode_session_id: None,
        last_setup_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
