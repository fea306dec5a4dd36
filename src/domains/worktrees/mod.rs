//! Git worktree lifecycle for cells.
//!
//! Every cell owns exactly one worktree at `cells_root/<cellId>` bound to a
//! branch `cell-<cellId>`. Both names are chosen before the worktree exists
//! so the cell row can be inserted first and the resume path can find its
//! way back after a crash.

use crate::errors::WorktreeError;
use git2::{BranchType, ErrorCode, Repository, WorktreeAddOptions, WorktreePruneOptions};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// A single measured sub-step, surfaced to the provisioning engine through
/// the `on_timing` callback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSample {
    pub step: String,
    pub duration_ms: i64,
    pub metadata: serde_json::Value,
}

pub type TimingSink<'a> = &'a (dyn Fn(TimingSample) + Send + Sync);

#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    cells_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(cells_root: PathBuf) -> Self {
        Self { cells_root }
    }

    pub fn worktree_path(&self, cell_id: &str) -> PathBuf {
        self.cells_root.join(cell_id)
    }

    pub fn branch_name(cell_id: &str) -> String {
        format!("cell-{cell_id}")
    }

    /// Creates the worktree and branch for a cell at HEAD of the workspace
    /// repository. `force` wipes any prior branch/worktree first, which
    /// makes the call idempotent across provisioning retries.
    pub fn create_worktree(
        &self,
        repo_path: &Path,
        cell_id: &str,
        include: &[String],
        force: bool,
        on_timing: Option<TimingSink>,
    ) -> Result<CreatedWorktree, WorktreeError> {
        let worktree_path = self.worktree_path(cell_id);
        let branch = Self::branch_name(cell_id);

        let repo = Repository::open(repo_path).map_err(|_| WorktreeError::GitMissing {
            repo_path: repo_path.to_path_buf(),
        })?;

        if force {
            self.wipe_prior(&repo, cell_id, &branch, &worktree_path);
        }

        let started = Instant::now();
        let head_commit = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|e| WorktreeError::HeadResolutionFailed {
                repo_path: repo_path.to_path_buf(),
                message: e.message().to_string(),
            })?;
        let base_commit = head_commit.id().to_string();
        emit(on_timing, "resolve_head", started, serde_json::json!({ "commit": base_commit }));

        let started = Instant::now();
        let new_branch = repo.branch(&branch, &head_commit, false).map_err(|e| {
            if e.code() == ErrorCode::Exists {
                WorktreeError::BranchExists {
                    branch: branch.clone(),
                }
            } else {
                WorktreeError::GitOperationFailed {
                    operation: "create_branch".to_string(),
                    message: e.message().to_string(),
                }
            }
        })?;
        let branch_ref = new_branch.into_reference();
        emit(on_timing, "create_branch", started, serde_json::json!({ "branch": branch }));

        let started = Instant::now();
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::FilesystemError {
                path: parent.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        if worktree_path.exists() {
            return Err(WorktreeError::PathInUse {
                path: worktree_path,
            });
        }
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(cell_id, &worktree_path, Some(&opts))
            .map_err(|e| {
                if e.code() == ErrorCode::Exists {
                    WorktreeError::WorktreeExists {
                        path: worktree_path.clone(),
                    }
                } else {
                    WorktreeError::GitOperationFailed {
                        operation: "add_worktree".to_string(),
                        message: e.message().to_string(),
                    }
                }
            })?;
        emit(on_timing, "add_worktree", started, serde_json::json!({}));

        if !include.is_empty() {
            let started = Instant::now();
            let copied = copy_includes(repo_path, &worktree_path, include)?;
            emit(
                on_timing,
                "copy_includes",
                started,
                serde_json::json!({ "copied": copied }),
            );
        }

        info!(
            "Created worktree for cell {cell_id} at {} ({base_commit})",
            worktree_path.display()
        );

        Ok(CreatedWorktree {
            path: worktree_path,
            branch,
            base_commit,
        })
    }

    /// Removes the cell's worktree directory and its Git registration, then
    /// deletes the branch. Best-effort: the caller falls back to plain
    /// filesystem removal on structural failure.
    pub fn remove_worktree(
        &self,
        repo_path: &Path,
        cell_id: &str,
    ) -> Result<(), WorktreeError> {
        let worktree_path = self.worktree_path(cell_id);
        let branch = Self::branch_name(cell_id);

        let repo = Repository::open(repo_path).map_err(|_| WorktreeError::GitMissing {
            repo_path: repo_path.to_path_buf(),
        })?;

        if worktree_path.exists() {
            std::fs::remove_dir_all(&worktree_path).map_err(|e| {
                WorktreeError::FilesystemError {
                    path: worktree_path.clone(),
                    message: e.to_string(),
                }
            })?;
        }

        // Prune the now-invalid registration so Git forgets the worktree.
        if let Ok(wt) = repo.find_worktree(cell_id) {
            let mut opts = WorktreePruneOptions::new();
            if let Err(e) = wt.prune(Some(opts.valid(true).working_tree(true))) {
                warn!("Failed to prune worktree registration for {cell_id}: {e}");
            }
        }

        if let Ok(mut br) = repo.find_branch(&branch, BranchType::Local)
            && let Err(e) = br.delete()
        {
            warn!("Failed to delete branch '{branch}': {e}");
        }

        info!("Removed worktree for cell {cell_id}");
        Ok(())
    }

    /// True when Git still knows a worktree for this cell.
    pub fn is_registered(&self, repo_path: &Path, cell_id: &str) -> bool {
        Repository::open(repo_path)
            .ok()
            .and_then(|repo| repo.find_worktree(cell_id).ok())
            .is_some()
    }

    fn wipe_prior(&self, repo: &Repository, cell_id: &str, branch: &str, worktree_path: &Path) {
        if worktree_path.exists() {
            if let Err(e) = std::fs::remove_dir_all(worktree_path) {
                warn!(
                    "Failed to remove stale worktree dir {}: {e}",
                    worktree_path.display()
                );
            }
        }
        if let Ok(wt) = repo.find_worktree(cell_id) {
            let mut opts = WorktreePruneOptions::new();
            if let Err(e) = wt.prune(Some(opts.valid(true).working_tree(true))) {
                warn!("Failed to prune stale worktree {cell_id}: {e}");
            }
        }
        if let Ok(mut br) = repo.find_branch(branch, BranchType::Local) {
            info!("Deleting existing branch: {branch}");
            if let Err(e) = br.delete() {
                warn!("Failed to delete stale branch '{branch}': {e}");
            }
        }
    }
}

/// Copies template include patterns (exact relative paths, or directories
/// copied recursively) from the workspace root into the fresh worktree.
fn copy_includes(
    repo_path: &Path,
    worktree_path: &Path,
    include: &[String],
) -> Result<usize, WorktreeError> {
    let mut copied = 0usize;
    for pattern in include {
        let source = repo_path.join(pattern);
        if !source.exists() {
            continue;
        }
        if source.is_dir() {
            for entry in walkdir::WalkDir::new(&source)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                let Ok(rel) = entry.path().strip_prefix(repo_path) else {
                    continue;
                };
                copied += copy_one(entry.path(), &worktree_path.join(rel))?;
            }
        } else {
            copied += copy_one(&source, &worktree_path.join(pattern))?;
        }
    }
    Ok(copied)
}

fn copy_one(source: &Path, dest: &Path) -> Result<usize, WorktreeError> {
    if dest.exists() {
        return Ok(0);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WorktreeError::FilesystemError {
            path: parent.to_path_buf(),
            message: e.to_string(),
        })?;
    }
    std::fs::copy(source, dest).map_err(|e| WorktreeError::FilesystemError {
        path: dest.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(1)
}

fn emit(on_timing: Option<TimingSink>, step: &str, started: Instant, metadata: serde_json::Value) {
    if let Some(sink) = on_timing {
        sink(TimingSample {
            step: step.to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
            metadata,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(&repo_path)
                .output()
                .unwrap();
        }

        std::fs::write(repo_path.join("README.md"), "Initial").unwrap();
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

        (temp_dir, repo_path)
    }

    fn manager(temp: &TempDir) -> WorktreeManager {
        WorktreeManager::new(temp.path().join("cells"))
    }

    #[test]
    fn creates_worktree_branch_and_reports_base_commit() {
        let (temp, repo_path) = setup_test_repo();
        let manager = manager(&temp);

        let created = manager
            .create_worktree(&repo_path, "c1", &[], false, None)
            .unwrap();
        assert_eq!(created.branch, "cell-c1");
        assert!(created.path.exists());
        assert!(created.path.join(".git").exists());
        assert_eq!(created.base_commit.len(), 40);

        let repo = Repository::open(&repo_path).unwrap();
        assert!(repo.find_branch("cell-c1", BranchType::Local).is_ok());
    }

    #[test]
    fn second_create_without_force_fails_with_branch_exists() {
        let (temp, repo_path) = setup_test_repo();
        let manager = manager(&temp);
        manager
            .create_worktree(&repo_path, "c1", &[], false, None)
            .unwrap();

        let err = manager
            .create_worktree(&repo_path, "c1", &[], false, None)
            .unwrap_err();
        assert!(matches!(err, WorktreeError::BranchExists { .. }));
    }

    #[test]
    fn force_recreate_is_idempotent_and_leaves_one_branch() {
        let (temp, repo_path) = setup_test_repo();
        let manager = manager(&temp);
        manager
            .create_worktree(&repo_path, "c1", &[], true, None)
            .unwrap();
        let created = manager
            .create_worktree(&repo_path, "c1", &[], true, None)
            .unwrap();
        assert!(created.path.exists());

        let repo = Repository::open(&repo_path).unwrap();
        let branches: Vec<_> = repo
            .branches(Some(BranchType::Local))
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|(b, _)| b.name().ok().flatten().map(String::from))
            .filter(|name| name == "cell-c1")
            .collect();
        assert_eq!(branches.len(), 1);
    }

    #[test]
    fn missing_repo_is_git_missing() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let err = manager
            .create_worktree(&temp.path().join("nope"), "c1", &[], false, None)
            .unwrap_err();
        assert!(matches!(err, WorktreeError::GitMissing { .. }));
    }

    #[test]
    fn remove_clears_path_registration_and_branch() {
        let (temp, repo_path) = setup_test_repo();
        let manager = manager(&temp);
        let created = manager
            .create_worktree(&repo_path, "c1", &[], false, None)
            .unwrap();

        manager.remove_worktree(&repo_path, "c1").unwrap();
        assert!(!created.path.exists());
        assert!(!manager.is_registered(&repo_path, "c1"));

        let repo = Repository::open(&repo_path).unwrap();
        assert!(repo.find_branch("cell-c1", BranchType::Local).is_err());
    }

    #[test]
    fn include_patterns_copy_untracked_files() {
        let (temp, repo_path) = setup_test_repo();
        std::fs::write(repo_path.join(".env.local"), "SECRET=1").unwrap();
        std::fs::create_dir_all(repo_path.join("config/local")).unwrap();
        std::fs::write(repo_path.join("config/local/dev.json"), "{}").unwrap();

        let manager = manager(&temp);
        let samples = std::sync::Mutex::new(Vec::new());
        let sink = |sample: TimingSample| samples.lock().unwrap().push(sample);
        let created = manager
            .create_worktree(
                &repo_path,
                "c1",
                &[".env.local".to_string(), "config".to_string()],
                false,
                Some(&sink),
            )
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(created.path.join(".env.local")).unwrap(),
            "SECRET=1"
        );
        assert!(created.path.join("config/local/dev.json").exists());

        let samples = samples.into_inner().unwrap();
        let steps: Vec<_> = samples.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            steps,
            vec!["resolve_head", "create_branch", "add_worktree", "copy_includes"]
        );
    }
}
