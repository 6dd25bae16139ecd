//! Shared test fixtures for loom integration tests.
//!
//! Two builders cover what scenario tests need: a scratch coordination
//! store ([`TempCoordinationStore`]) and a scratch git repository with a
//! worktree base ([`TempRepo`]). Both clean up their backing directories
//! on drop via `tempfile::TempDir`.

use std::path::{Path, PathBuf};
use std::process::Command;

use loom_store::{CoordinationConfig, CoordinationStore};
use tempfile::TempDir;

/// A coordination store rooted in a fresh temp directory.
pub struct TempCoordinationStore {
    _dir: TempDir,
    pub store: CoordinationStore,
}

impl TempCoordinationStore {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir for coordination store");
        let config = CoordinationConfig::new(dir.path().join("coordination"));
        let store = CoordinationStore::open(config)
            .await
            .expect("failed to open coordination store");
        Self { _dir: dir, store }
    }
}

/// A git repository in a temp directory, with an initial commit, plus a
/// separate temp directory to use as a worktree base.
pub struct TempRepo {
    _repo_dir: TempDir,
    _worktree_dir: TempDir,
    pub path: PathBuf,
    pub worktree_base: PathBuf,
}

impl TempRepo {
    pub fn new() -> Self {
        let repo_dir = TempDir::new().expect("failed to create temp dir for repo");
        let worktree_dir = TempDir::new().expect("failed to create temp dir for worktrees");
        let path = repo_dir.path().to_path_buf();

        run_git(&path, &["init"]);
        run_git(&path, &["config", "user.email", "loom@loom.dev"]);
        run_git(&path, &["config", "user.name", "Loom"]);
        std::fs::write(path.join("README.md"), "# scratch repo\n").expect("failed to write README.md");
        run_git(&path, &["add", "."]);
        run_git(&path, &["commit", "-m", "init"]);

        Self {
            _repo_dir: repo_dir,
            worktree_base: worktree_dir.path().to_path_buf(),
            _worktree_dir: worktree_dir,
            path,
        }
    }

    /// Write `contents` to `relative_path` inside the repo's working tree
    /// and commit it, returning the new commit sha.
    pub fn commit_file(&self, relative_path: &str, contents: &str, message: &str) -> String {
        let full_path = self.path.join(relative_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent directories");
        }
        std::fs::write(&full_path, contents).expect("failed to write file");
        run_git(&self.path, &["add", "."]);
        run_git(&self.path, &["commit", "-m", message]);
        self.head_commit()
    }

    pub fn head_commit(&self) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.path)
            .output()
            .expect("failed to run git rev-parse");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    if !output.status.success() {
        panic!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
}
