use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Opens (or creates) the database. `None` uses a private temporary file
    /// database, which is only useful in tests.
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let manager = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
                }
                SqliteConnectionManager::file(path)
            }
            None => SqliteConnectionManager::file(""),
        };

        let manager = manager.with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("Failed to build sqlite connection pool")?;

        let db = Self { pool };
        super::db_schema::initialize_schema(&db)?;
        Ok(db)
    }

    pub fn get_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .context("Failed to acquire database connection from pool")
    }
}
