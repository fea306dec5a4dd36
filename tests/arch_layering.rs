//! Layering checks: the persistence crate stays behind the repository
//! layer, and the HTTP layer talks to the engine instead of the database
//! driver or git directly.

use std::path::{Path, PathBuf};

fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect()
}

fn files_importing(dir: &Path, needle: &str) -> Vec<PathBuf> {
    rust_files(dir)
        .into_iter()
        .filter(|path| {
            std::fs::read_to_string(path)
                .map(|content| {
                    content
                        .lines()
                        .any(|line| line.trim_start().starts_with("use ") && line.contains(needle))
                })
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn rusqlite_stays_behind_the_database_layer() {
    let offenders: Vec<_> = files_importing(Path::new("src"), "rusqlite")
        .into_iter()
        .filter(|path| !path.starts_with("src/infrastructure/database"))
        .collect();
    assert!(
        offenders.is_empty(),
        "rusqlite must only be imported under src/infrastructure/database: {offenders:?}"
    );
}

#[test]
fn api_layer_does_not_touch_git_directly() {
    let offenders: Vec<_> = files_importing(Path::new("src/api"), "git2")
        .into_iter()
        .filter(|path| !path.ends_with("diff.rs"))
        .collect();
    assert!(
        offenders.is_empty(),
        "api handlers must go through the engine, not git2: {offenders:?}"
    );
}

#[test]
fn api_layer_does_not_spawn_ptys_directly() {
    let offenders = files_importing(Path::new("src/api"), "portable_pty");
    assert!(
        offenders.is_empty(),
        "api handlers must use the terminal registries: {offenders:?}"
    );
}
