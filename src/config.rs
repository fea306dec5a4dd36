use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_OPENCODE_BIN: &str = "opencode";
pub const DEFAULT_OPENCODE_START_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_SERVICE_HOST: &str = "localhost";
pub const DEFAULT_SERVICE_PROTOCOL: &str = "http";

/// Runtime configuration resolved once at startup from CLI arguments and the
/// environment. Cloned freely; everything here is immutable after boot.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub bind: SocketAddr,
    /// Root for per-cell worktrees; worktree paths are `cells_root/<cellId>`.
    pub cells_root: PathBuf,
    pub db_path: PathBuf,
    pub registry_path: PathBuf,
    pub service_host: String,
    pub service_protocol: String,
    pub opencode_bin: String,
    pub opencode_server_url: Option<Url>,
    pub opencode_start_timeout: Duration,
}

impl RuntimeConfig {
    pub fn from_env(
        bind: SocketAddr,
        data_dir: Option<PathBuf>,
        registry_path: PathBuf,
    ) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

        let opencode_server_url = match std::env::var("HIVE_OPENCODE_SERVER_URL") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                Url::parse(raw.trim())
                    .with_context(|| format!("Invalid HIVE_OPENCODE_SERVER_URL: {raw}"))?,
            ),
            _ => None,
        };

        let opencode_start_timeout = std::env::var("HIVE_OPENCODE_START_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_OPENCODE_START_TIMEOUT_MS));

        Ok(Self {
            bind,
            cells_root: data_dir.join("cells"),
            db_path: data_dir.join("hive.db"),
            registry_path,
            service_host: env_or("SERVICE_HOST", DEFAULT_SERVICE_HOST),
            service_protocol: env_or("SERVICE_PROTOCOL", DEFAULT_SERVICE_PROTOCOL),
            opencode_bin: env_or("HIVE_OPENCODE_BIN", DEFAULT_OPENCODE_BIN),
            opencode_server_url,
            opencode_start_timeout,
        })
    }

    /// Port of the external agent server, derived from the URL. Never
    /// persisted on cell rows.
    pub fn opencode_server_port(&self) -> Option<u16> {
        self.opencode_server_url
            .as_ref()
            .and_then(|url| url.port_or_known_default())
    }

    pub fn service_url(&self, port: u16) -> String {
        format!("{}://{}:{}", self.service_protocol, self.service_host, port)
    }

    pub fn cell_worktree_path(&self, cell_id: &str) -> PathBuf {
        self.cells_root.join(cell_id)
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not determine a data directory for this user")?;
    Ok(base.join("hive"))
}
