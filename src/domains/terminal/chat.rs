//! Chat terminal launch: attaches the opencode TUI to a cell's agent
//! session. The binary is overridable through `HIVE_OPENCODE_BIN`; identical
//! launch parameters make `ensure_session` a no-op while the attach is
//! running.

use super::{DEFAULT_COLS, DEFAULT_ROWS, LaunchSpec};
use crate::config::RuntimeConfig;
use crate::domains::cells::entity::Cell;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;
use which::which;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Dark,
    Light,
    #[default]
    System,
}

impl ThemeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeMode::Dark => "dark",
            ThemeMode::Light => "light",
            ThemeMode::System => "system",
        }
    }
}

/// Builds the attach command for a cell's chat terminal.
pub fn chat_launch_spec(
    config: &RuntimeConfig,
    cell: &Cell,
    session_id: &str,
    theme: ThemeMode,
    cols: Option<u16>,
    rows: Option<u16>,
) -> Result<LaunchSpec> {
    let binary = resolve_binary(&config.opencode_bin)?;

    let mut argv = vec![
        binary,
        "attach".to_string(),
        "--session".to_string(),
        session_id.to_string(),
        "--dir".to_string(),
        cell.workspace_path.to_string_lossy().to_string(),
        "--theme".to_string(),
        theme.as_str().to_string(),
    ];
    if let Some(url) = &config.opencode_server_url {
        argv.push("--server".to_string());
        argv.push(url.to_string());
    }

    let mut spec = LaunchSpec::new(argv, cell.workspace_path.clone());
    spec.cols = cols.unwrap_or(DEFAULT_COLS);
    spec.rows = rows.unwrap_or(DEFAULT_ROWS);
    Ok(spec)
}

/// Accepts either a bare program name (resolved on PATH) or an explicit
/// path. Tilde-prefixed paths are expanded against $HOME.
pub fn resolve_binary(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Agent binary override is empty"));
    }

    let expanded = match (trimmed.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => trimmed.to_string(),
    };

    if expanded.contains('/') {
        if !Path::new(&expanded).exists() {
            return Err(anyhow!("Agent binary '{expanded}' does not exist"));
        }
        return Ok(expanded);
    }

    which(&expanded)
        .map(|path| path.to_string_lossy().to_string())
        .map_err(|_| anyhow!("Agent binary '{expanded}' not found on PATH"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::db_cells::test_cell;
    use serial_test::serial;

    fn config(dir: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig::from_env(
            "127.0.0.1:0".parse().unwrap(),
            Some(dir.to_path_buf()),
            dir.join("hive.toml"),
        )
        .unwrap()
    }

    #[test]
    #[serial]
    fn attach_command_carries_session_dir_and_theme() {
        unsafe {
            std::env::set_var("HIVE_OPENCODE_BIN", "sh");
            std::env::remove_var("HIVE_OPENCODE_SERVER_URL");
        }
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config(tmp.path());
        let cell = test_cell("c1", "w1");

        let spec = chat_launch_spec(&config, &cell, "sess-9", ThemeMode::Dark, Some(120), None)
            .unwrap();
        assert!(spec.argv[0].ends_with("sh"));
        assert!(spec.argv.contains(&"--session".to_string()));
        assert!(spec.argv.contains(&"sess-9".to_string()));
        assert!(spec.argv.contains(&"--theme".to_string()));
        assert!(spec.argv.contains(&"dark".to_string()));
        assert!(!spec.argv.contains(&"--server".to_string()));
        assert_eq!(spec.cols, 120);
        assert_eq!(spec.rows, DEFAULT_ROWS);
        unsafe {
            std::env::remove_var("HIVE_OPENCODE_BIN");
        }
    }

    #[test]
    #[serial]
    fn server_url_is_appended_when_configured() {
        unsafe {
            std::env::set_var("HIVE_OPENCODE_BIN", "sh");
            std::env::set_var("HIVE_OPENCODE_SERVER_URL", "http://127.0.0.1:4096");
        }
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config(tmp.path());
        let cell = test_cell("c1", "w1");

        let spec =
            chat_launch_spec(&config, &cell, "sess-9", ThemeMode::System, None, None).unwrap();
        assert!(spec.argv.contains(&"--server".to_string()));
        unsafe {
            std::env::remove_var("HIVE_OPENCODE_BIN");
            std::env::remove_var("HIVE_OPENCODE_SERVER_URL");
        }
    }

    #[test]
    fn missing_binary_is_a_hard_error() {
        assert!(resolve_binary("definitely-not-a-real-binary-xyz").is_err());
        assert!(resolve_binary("").is_err());
        assert!(resolve_binary("/nonexistent/path/bin").is_err());
    }
}
