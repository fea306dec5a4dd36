use super::connection::Database;
use crate::domains::cells::entity::CellActivityEvent;
use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use rusqlite::{Row, params};

/// Insert payload; `id`/`created_at` are assigned by the database. The
/// optional attribution fields come from the `x-hive-*` request headers.
#[derive(Debug, Clone, Default)]
pub struct NewActivityEvent {
    pub cell_id: String,
    pub action: String,
    pub detail: Option<String>,
    pub source: Option<String>,
    pub tool: Option<String>,
    pub audit_event: Option<String>,
    pub service_name: Option<String>,
}

/// Page of activity events plus the cursor for the next page, if any.
#[derive(Debug, Clone)]
pub struct ActivityPage {
    pub events: Vec<CellActivityEvent>,
    pub next_cursor: Option<String>,
}

pub trait ActivityMethods {
    fn insert_activity_event(&self, event: &NewActivityEvent) -> Result<()>;
    /// Newest-first page; `cursor` is the opaque value returned by the
    /// previous page.
    fn list_activity_events(
        &self,
        cell_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ActivityPage>;
}

impl ActivityMethods for Database {
    fn insert_activity_event(&self, event: &NewActivityEvent) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO cell_activity_events (
                cell_id, action, detail, source, tool, audit_event, service_name, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.cell_id,
                event.action,
                event.detail,
                event.source,
                event.tool,
                event.audit_event,
                event.service_name,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    fn list_activity_events(
        &self,
        cell_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ActivityPage> {
        let conn = self.get_conn()?;
        let mut events = Vec::new();

        match cursor.map(parse_cursor).transpose()? {
            Some((created_at, id)) => {
                let mut stmt = conn.prepare(&format!(
                    "{ACTIVITY_SELECT}
                     WHERE cell_id = ?1 AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))
                     ORDER BY created_at DESC, id DESC LIMIT ?4"
                ))?;
                let rows = stmt.query_map(
                    params![cell_id, created_at, id, (limit + 1) as i64],
                    row_to_activity,
                )?;
                for row in rows {
                    events.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{ACTIVITY_SELECT}
                     WHERE cell_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![cell_id, (limit + 1) as i64], row_to_activity)?;
                for row in rows {
                    events.push(row?);
                }
            }
        }

        let next_cursor = if events.len() > limit {
            events.truncate(limit);
            events
                .last()
                .map(|last| format!("{}:{}", last.created_at.timestamp(), last.id))
        } else {
            None
        };

        Ok(ActivityPage {
            events,
            next_cursor,
        })
    }
}

fn parse_cursor(raw: &str) -> Result<(i64, i64)> {
    let (ts, id) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Malformed activity cursor '{raw}'"))?;
    Ok((
        ts.parse()
            .map_err(|_| anyhow!("Malformed activity cursor '{raw}'"))?,
        id.parse()
            .map_err(|_| anyhow!("Malformed activity cursor '{raw}'"))?,
    ))
}

const ACTIVITY_SELECT: &str = "SELECT id, cell_id, action, detail, source, tool, audit_event,
            service_name, created_at
     FROM cell_activity_events";

fn row_to_activity(row: &Row<'_>) -> rusqlite::Result<CellActivityEvent> {
    Ok(CellActivityEvent {
        id: row.get(0)?,
        cell_id: row.get(1)?,
        action: row.get(2)?,
        detail: row.get(3)?,
        source: row.get(4)?,
        tool: row.get(5)?,
        audit_event: row.get(6)?,
        service_name: row.get(7)?,
        created_at: Utc.timestamp_opt(row.get::<_, i64>(8)?, 0).unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::CellMethods;
    use crate::infrastructure::database::db_cells::test_cell;

    fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        (tmp, db)
    }

    fn insert(db: &Database, cell_id: &str, action: &str) {
        db.insert_activity_event(&NewActivityEvent {
            cell_id: cell_id.to_string(),
            action: action.to_string(),
            source: Some("cli".to_string()),
            ..Default::default()
        })
        .unwrap();
    }

    #[test]
    fn pagination_walks_the_full_feed_without_duplicates() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();
        for i in 0..7 {
            insert(&db, "c1", &format!("action-{i}"));
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = db
                .list_activity_events("c1", cursor.as_deref(), 3)
                .unwrap();
            seen.extend(page.events.iter().map(|e| e.id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 7);
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(deduped, seen, "no id may repeat across pages");
    }

    #[test]
    fn newest_events_come_first() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();
        insert(&db, "c1", "first");
        insert(&db, "c1", "second");

        let page = db.list_activity_events("c1", None, 10).unwrap();
        assert_eq!(page.events.first().unwrap().action, "second");
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();
        assert!(db.list_activity_events("c1", Some("junk"), 10).is_err());
    }

    #[test]
    fn audit_headers_are_persisted() {
        let (_tmp, db) = test_db();
        db.create_cell(&test_cell("c1", "w1")).unwrap();
        db.insert_activity_event(&NewActivityEvent {
            cell_id: "c1".to_string(),
            action: "setup_retry".to_string(),
            tool: Some("hive-mcp".to_string()),
            audit_event: Some("retry".to_string()),
            service_name: Some("web".to_string()),
            ..Default::default()
        })
        .unwrap();

        let page = db.list_activity_events("c1", None, 1).unwrap();
        let event = &page.events[0];
        assert_eq!(event.tool.as_deref(), Some("hive-mcp"));
        assert_eq!(event.service_name.as_deref(), Some("web"));
    }
}
