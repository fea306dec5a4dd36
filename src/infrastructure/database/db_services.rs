use super::connection::Database;
use crate::domains::cells::entity::{CellService, ServiceKind, ServiceStatus};
use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;

pub trait CellServiceMethods {
    /// Inserts a service row; a no-op when (cell_id, name) already exists.
    fn insert_cell_service(&self, service: &CellService) -> Result<()>;
    fn get_cell_service(&self, id: &str) -> Result<Option<CellService>>;
    fn list_cell_services(&self, cell_id: &str) -> Result<Vec<CellService>>;
    fn update_service_runtime(
        &self,
        id: &str,
        status: ServiceStatus,
        pid: Option<u32>,
        last_known_error: Option<&str>,
    ) -> Result<()>;
    /// Boot-time sweep: anything that claims to be running or starting lost
    /// its process with the previous server and must be resumed explicitly.
    fn mark_services_needing_resume(&self) -> Result<usize>;
}

impl CellServiceMethods for Database {
    fn insert_cell_service(&self, service: &CellService) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO cell_services (
                id, cell_id, name, kind, command, cwd, env, port, pid,
                status, last_known_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                service.id,
                service.cell_id,
                service.name,
                service.kind.as_str(),
                service.command,
                service.cwd,
                serde_json::to_string(&service.env)?,
                service.port,
                service.pid,
                service.status.as_str(),
                service.last_known_error,
                service.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    fn get_cell_service(&self, id: &str) -> Result<Option<CellService>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{SERVICE_SELECT} WHERE id = ?1"))?;
        let service = stmt.query_row(params![id], row_to_service).optional()?;
        Ok(service)
    }

    fn list_cell_services(&self, cell_id: &str) -> Result<Vec<CellService>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SERVICE_SELECT} WHERE cell_id = ?1 ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map(params![cell_id], row_to_service)?;
        let mut services = Vec::new();
        for row in rows {
            services.push(row?);
        }
        Ok(services)
    }

    fn update_service_runtime(
        &self,
        id: &str,
        status: ServiceStatus,
        pid: Option<u32>,
        last_known_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE cell_services
             SET status = ?1, pid = ?2, last_known_error = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                pid,
                last_known_error,
                Utc::now().timestamp(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("Service '{id}' not found"));
        }
        Ok(())
    }

    fn mark_services_needing_resume(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE cell_services
             SET status = 'needs_resume', pid = NULL, updated_at = ?1
             WHERE status IN ('running', 'starting', 'stopping')",
            params![Utc::now().timestamp()],
        )?;
        Ok(changed)
    }
}

const SERVICE_SELECT: &str = "SELECT id, cell_id, name, kind, command, cwd, env, port, pid,
            status, last_known_error, updated_at
     FROM cell_services";

fn row_to_service(row: &Row<'_>) -> rusqlite::Result<CellService> {
    let kind_raw: String = row.get(3)?;
    let kind = ServiceKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown service kind '{kind_raw}'").into(),
        )
    })?;
    let status_raw: String = row.get(9)?;
    let status = ServiceStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown service status '{status_raw}'").into(),
        )
    })?;
    let env_raw: String = row.get(6)?;
    let env: HashMap<String, String> = serde_json::from_str(&env_raw).unwrap_or_default();
    Ok(CellService {
        id: row.get(0)?,
        cell_id: row.get(1)?,
        name: row.get(2)?,
        kind,
        command: row.get(4)?,
        cwd: row.get(5)?,
        env,
        port: row.get(7)?,
        pid: row.get(8)?,
        status,
        last_known_error: row.get(10)?,
        updated_at: Utc.timestamp_opt(row.get::<_, i64>(11)?, 0).unwrap(),
    })
}
