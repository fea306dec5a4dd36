use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "hive", version = VERSION, about = "Cell lifecycle server")]
pub struct Cli {
    /// Address to bind the HTTP server on.
    #[arg(long, default_value = "127.0.0.1:7420")]
    pub bind: SocketAddr,

    /// Directory holding the database and per-cell worktrees. Defaults to
    /// the platform data dir.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Workspace/template registry file.
    #[arg(long, default_value = "hive.toml")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["hive"]);
        assert_eq!(cli.bind.port(), 7420);
        assert_eq!(cli.config, PathBuf::from("hive.toml"));
        assert!(cli.data_dir.is_none());
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "hive",
            "--bind",
            "0.0.0.0:9000",
            "--data-dir",
            "/tmp/hive",
            "--config",
            "/etc/hive/hive.toml",
        ]);
        assert_eq!(cli.bind.to_string(), "0.0.0.0:9000");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/hive")));
    }
}
