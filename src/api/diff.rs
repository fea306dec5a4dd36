//! Worktree diff endpoint: changes in the cell's worktree relative to its
//! base commit.

use super::{ApiBody, error_response, internal_error_response, json_response};
use crate::engine::Engine;
use crate::errors::HiveError;
use crate::infrastructure::database::CellMethods;
use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Oid, Repository};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffFile {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub base_commit: String,
    pub files: Vec<DiffFile>,
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

pub async fn diff(engine: &Arc<Engine>, cell_id: &str) -> Response<ApiBody> {
    let cell = match engine.db.get_cell(cell_id) {
        Ok(Some(cell)) => cell,
        Ok(None) => {
            return error_response(&HiveError::CellNotFound {
                cell_id: cell_id.to_string(),
            });
        }
        Err(err) => return internal_error_response(&err),
    };

    let Some(base_commit) = cell.base_commit.clone() else {
        return error_response(&HiveError::invalid_input(
            "cell",
            "cell has no base commit yet",
        ));
    };
    if !cell.workspace_path.exists() {
        return error_response(&HiveError::CellNotReady {
            cell_id: cell_id.to_string(),
            status: cell.status.as_str().to_string(),
        });
    }

    let path = cell.workspace_path.clone();
    let result =
        tokio::task::spawn_blocking(move || compute_diff(path, &base_commit)).await;
    match result {
        Ok(Ok(summary)) => json_response(StatusCode::OK, &summary),
        Ok(Err(err)) => internal_error_response(&err),
        Err(err) => internal_error_response(&anyhow::Error::new(err)),
    }
}

fn compute_diff(worktree_path: PathBuf, base_commit: &str) -> Result<DiffSummary> {
    let repo = Repository::open(&worktree_path).context("Failed to open worktree repository")?;
    let base_oid = Oid::from_str(base_commit).context("Invalid base commit")?;
    let base_tree = repo
        .find_commit(base_oid)
        .and_then(|commit| commit.tree())
        .context("Base commit not found in worktree")?;

    let mut opts = DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo
        .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
        .context("Failed to compute diff")?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        let path = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        files.push(DiffFile {
            path,
            status: delta_status(delta.status()).to_string(),
        });
    }

    let stats = diff.stats().context("Failed to compute diff stats")?;
    Ok(DiffSummary {
        base_commit: base_commit.to_string(),
        files_changed: stats.files_changed(),
        additions: stats.insertions(),
        deletions: stats.deletions(),
        files,
    })
}

fn delta_status(status: Delta) -> &'static str {
    match status {
        Delta::Added | Delta::Untracked => "added",
        Delta::Deleted => "deleted",
        Delta::Modified => "modified",
        Delta::Renamed => "renamed",
        Delta::Copied => "copied",
        Delta::Typechange => "typechange",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn diff_counts_new_and_modified_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let repo_path = tmp.path().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "t@e.c"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(&repo_path)
                .output()
                .unwrap();
        }
        std::fs::write(repo_path.join("a.txt"), "one\n").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(&repo_path)
            .output()
            .unwrap();

        let repo = Repository::open(&repo_path).unwrap();
        let base = repo.head().unwrap().peel_to_commit().unwrap().id().to_string();

        std::fs::write(repo_path.join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::write(repo_path.join("b.txt"), "new\n").unwrap();

        let summary = compute_diff(repo_path, &base).unwrap();
        assert_eq!(summary.files.len(), 2);
        assert!(summary.additions >= 2);
        assert!(
            summary
                .files
                .iter()
                .any(|f| f.path == "b.txt" && f.status == "added")
        );
        assert!(
            summary
                .files
                .iter()
                .any(|f| f.path == "a.txt" && f.status == "modified")
        );
    }
}
