use super::connection::Database;

pub fn initialize_schema(db: &Database) -> anyhow::Result<()> {
    let conn = db.get_conn()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cells (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            workspace_root_path TEXT NOT NULL,
            workspace_path TEXT NOT NULL,
            branch_name TEXT NOT NULL,
            base_commit TEXT,
            template_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL,  -- 'spawning', 'ready', 'error', or 'deleting'
            opencode_session_id TEXT,
            last_setup_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cells_workspace ON cells(workspace_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cells_status ON cells(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cell_provisioning_states (
            cell_id TEXT PRIMARY KEY,
            model_id_override TEXT,
            provider_id_override TEXT,
            start_mode TEXT NOT NULL DEFAULT 'plan',
            started_at INTEGER,
            finished_at INTEGER,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(cell_id) REFERENCES cells(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cell_services (
            id TEXT PRIMARY KEY,
            cell_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,  -- 'process' or 'docker'
            command TEXT NOT NULL,
            cwd TEXT,
            env TEXT NOT NULL DEFAULT '{}',
            port INTEGER,
            pid INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            last_known_error TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE(cell_id, name),
            FOREIGN KEY(cell_id) REFERENCES cells(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cell_services_cell ON cell_services(cell_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cell_timing_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cell_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            workflow TEXT NOT NULL,  -- 'create' or 'delete'
            step TEXT NOT NULL,
            status TEXT NOT NULL,  -- 'ok' or 'error'
            duration_ms INTEGER NOT NULL,
            attempt INTEGER,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            FOREIGN KEY(cell_id) REFERENCES cells(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cell_timings_cell ON cell_timing_events(cell_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cell_timings_run ON cell_timing_events(run_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cell_activity_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cell_id TEXT NOT NULL,
            action TEXT NOT NULL,
            detail TEXT,
            source TEXT,
            tool TEXT,
            audit_event TEXT,
            service_name TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY(cell_id) REFERENCES cells(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cell_activity_cell
         ON cell_activity_events(cell_id, created_at DESC, id DESC)",
        [],
    )?;

    apply_cells_migrations(&conn)?;

    Ok(())
}

/// Idempotent migrations for the cells table; they silently fail when the
/// column already exists.
fn apply_cells_migrations(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    let _ = conn.execute("ALTER TABLE cells ADD COLUMN description TEXT", []);
    let _ = conn.execute("ALTER TABLE cells ADD COLUMN last_setup_error TEXT", []);
    Ok(())
}
