//! Git worktree and VCS effects for task isolation.
//!
//! Each task runs in its own git worktree, providing filesystem isolation
//! without the overhead of full repository clones. Worktrees share the
//! object store of the main repository but have independent working
//! directories and index files. This module also exposes the broader VCS
//! effects contract (merge, rebase, diff, raw escape hatch) used by the
//! worker, judge and integration engine.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during worktree/VCS operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("worktree path exists but has unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Result of a merge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success { merged_files: Vec<String> },
    Conflict {
        conflicts: Vec<String>,
        details: String,
    },
}

/// Merge strategy, per spec §6's `integration.mergeStrategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    FfPrefer,
    NoFf,
}

impl MergeStrategy {
    fn git_flag(self) -> &'static str {
        match self {
            Self::FfPrefer => "--ff",
            Self::NoFf => "--no-ff",
        }
    }
}

/// Options for [`WorktreeManager::merge_branch`].
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub no_commit: bool,
    pub gpg_sign: bool,
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages git worktrees and VCS effects for task isolation.
///
/// Git does not support concurrent worktree operations on the same
/// repository (it uses a lock file on the shared object store). This
/// manager serialises all mutating git operations through an internal
/// mutex so that concurrent task units do not race.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a new `WorktreeManager`. Worktrees are placed under
    /// `<repo>/.git/worktree/<name>` per spec §4.4, unless overridden.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let git_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let worktree_base = worktree_base.unwrap_or_else(|| {
            let git_dir_path = if Path::new(&git_dir).is_absolute() {
                PathBuf::from(&git_dir)
            } else {
                repo_path.join(&git_dir)
            };
            git_dir_path.join("worktree")
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Build the conventional branch name for a task: `loom/<session>/<task>`.
    pub fn branch_name(session_id: &str, task_id: &str) -> String {
        format!("loom/{session_id}/{task_id}")
    }

    /// Create a worktree for `branch_name`, rooted at `base` (a commit-ish)
    /// if the branch does not yet exist. Idempotent: returns the existing
    /// worktree if one is already checked out at the expected path.
    pub fn create_worktree(
        &self,
        branch_name: &str,
        base: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if let Some(ref branch) = existing.branch {
                if branch == branch_name {
                    tracing::info!(path = %worktree_path.display(), branch = branch_name, "worktree already exists");
                    return Ok(existing);
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_string(),
                    found: branch.clone(),
                });
            }
            return Ok(existing);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
                message: format!(
                    "failed to create worktree base directory: {}",
                    self.worktree_base.display()
                ),
                source: e,
            })?;
        }

        let branch_exists = self.branch_exists(branch_name)?;
        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(branch_name)
                .current_dir(&self.repo_path)
                .output()
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch_name)
                .arg(&worktree_path)
                .arg(base)
                .current_dir(&self.repo_path)
                .output()
        }
        .map_err(|e| WorktreeError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Remove a worktree by path. No-op (idempotent) if not registered.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(path = %path.display(), "directory exists but not registered as worktree, removing");
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// `git worktree prune`: clean up registrations whose directories were
    /// removed externally.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        self.run_simple(&["worktree", "prune"])
    }

    /// Merge `branch_name` into the current branch of the main repo.
    pub fn merge_branch(
        &self,
        branch_name: &str,
        opts: MergeOptions,
    ) -> Result<MergeResult, WorktreeError> {
        self.merge_branch_in(&self.repo_path.clone(), branch_name, opts)
    }

    /// Merge `branch_name` into whatever is checked out at `dir` (either
    /// the main repo or one of its worktrees). Used to build merge-base
    /// branches for multi-dependency tasks (spec §4.4 step 1).
    pub fn merge_branch_in(
        &self,
        dir: &Path,
        branch_name: &str,
        opts: MergeOptions,
    ) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut args = vec!["merge", opts.strategy.git_flag()];
        if opts.no_commit {
            args.push("--no-commit");
        }
        if opts.gpg_sign {
            args.push("--gpg-sign");
        } else {
            args.push("--no-gpg-sign");
        }
        args.push(branch_name);

        let output = Command::new("git")
            .args(&args)
            .current_dir(dir)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git merge".into(),
                source: e,
            })?;

        if output.status.success() {
            let merged_files = self
                .diff_name_only_in(dir, &format!("{branch_name}~1..{branch_name}"))
                .unwrap_or_default();
            return Ok(MergeResult::Success { merged_files });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let conflicts = self.get_conflicted_files_in(dir).unwrap_or_default();
            if !opts.no_commit {
                let _ = Command::new("git")
                    .args(["merge", "--abort"])
                    .current_dir(dir)
                    .output();
            }
            return Ok(MergeResult::Conflict {
                conflicts,
                details: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(WorktreeError::GitExit {
            command: "merge".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    pub fn abort_merge(&self) -> Result<(), WorktreeError> {
        self.run_simple(&["merge", "--abort"])
    }

    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn checkout(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run_simple(&["checkout", branch_name])
    }

    pub fn current_branch(&self) -> Result<String, WorktreeError> {
        let output = self.run_capture(&["branch", "--show-current"])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    pub fn has_remote(&self) -> bool {
        Command::new("git")
            .args(["remote", "get-url", "origin"])
            .current_dir(&self.repo_path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn pull(&self, branch_name: &str) -> Result<(), WorktreeError> {
        self.run_simple(&["pull", "origin", branch_name])
    }

    pub fn push(&self, branch_name: &str) -> Result<(), WorktreeError> {
        self.run_simple(&["push", "origin", branch_name])
    }

    /// Get the HEAD commit SHA of the worktree rooted at `path`.
    pub fn head_commit(&self, path: &Path) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse HEAD".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "rev-parse HEAD".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stage `scope_paths` in the worktree at `path`. Returns `Ok(true)` if
    /// the command succeeded and something was staged, `Ok(false)`
    /// otherwise (caller should fall back to staging everything).
    pub fn stage_paths(&self, path: &Path, scope_paths: &[String]) -> Result<bool, WorktreeError> {
        if scope_paths.is_empty() {
            return Ok(false);
        }
        let mut args = vec!["add", "--"];
        args.extend(scope_paths.iter().map(String::as_str));
        let output = Command::new("git")
            .args(&args)
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git add (scoped)".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(self.has_staged_changes(path)?)
    }

    /// Stage all changes in the worktree.
    pub fn stage_all(&self, path: &Path) -> Result<bool, WorktreeError> {
        self.run_simple_in(path, &["add", "-A"])?;
        self.has_staged_changes(path)
    }

    fn has_staged_changes(&self, path: &Path) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["diff", "--cached", "--name-only"])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git diff --cached".into(),
                source: e,
            })?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    /// Commit staged changes in the worktree at `path`. Returns the new
    /// commit SHA, or `None` if there was nothing to commit.
    pub fn commit(
        &self,
        path: &Path,
        message: &str,
        gpg_sign: bool,
    ) -> Result<Option<String>, WorktreeError> {
        if !self.has_staged_changes(path)? {
            return Ok(None);
        }

        let mut args = vec!["commit", "-m", message];
        if gpg_sign {
            args.push("--gpg-sign");
        } else {
            args.push("--no-gpg-sign");
        }

        let output = Command::new("git")
            .args(&args)
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git commit".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "commit".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(Some(self.head_commit(path)?))
    }

    /// `git diff <range>` (textual diff).
    pub fn diff(&self, path: &Path, range: &str) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(["diff", range])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git diff".into(),
                source: e,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `git diff --stat <range>`.
    pub fn diff_stat(&self, path: &Path, range: &str) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(["diff", "--stat", range])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git diff --stat".into(),
                source: e,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn diff_name_only(&self, range: &str) -> Result<Vec<String>, WorktreeError> {
        self.diff_name_only_in(&self.repo_path.clone(), range)
    }

    fn diff_name_only_in(&self, dir: &Path, range: &str) -> Result<Vec<String>, WorktreeError> {
        let output = Command::new("git")
            .args(["diff", "--name-only", range])
            .current_dir(dir)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git diff --name-only".into(),
                source: e,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect())
    }

    /// Rebase the current branch of `path` onto `base`.
    pub fn rebase(&self, path: &Path, base: &str, gpg_sign: bool) -> Result<MergeResult, WorktreeError> {
        let mut args = vec!["rebase".to_string()];
        if gpg_sign {
            args.push("--gpg-sign".to_string());
        }
        args.push(base.to_string());

        let output = Command::new("git")
            .args(&args)
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rebase".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(MergeResult::Success { merged_files: vec![] });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if self.is_rebase_in_progress(path) {
            let conflicts = self.get_conflicted_files_in(path).unwrap_or_default();
            return Ok(MergeResult::Conflict { conflicts, details: stderr });
        }

        Err(WorktreeError::GitExit {
            command: "rebase".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    pub fn rebase_continue(&self, path: &Path) -> Result<(), WorktreeError> {
        self.run_simple_in(path, &["rebase", "--continue"])
    }

    pub fn rebase_abort(&self, path: &Path) -> Result<(), WorktreeError> {
        self.run_simple_in(path, &["rebase", "--abort"])
    }

    pub fn is_rebase_in_progress(&self, path: &Path) -> bool {
        path.join(".git").join("rebase-merge").exists() || path.join(".git").join("rebase-apply").exists()
    }

    fn get_conflicted_files(&self) -> Result<Vec<String>, WorktreeError> {
        self.get_conflicted_files_in(&self.repo_path)
    }

    pub fn get_conflicted_files_in(&self, path: &Path) -> Result<Vec<String>, WorktreeError> {
        let output = Command::new("git")
            .args(["diff", "--name-only", "--diff-filter=U"])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git diff --diff-filter=U".into(),
                source: e,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn has_conflict_markers(&self, path: &Path, file: &str) -> bool {
        std::fs::read_to_string(path.join(file))
            .map(|content| content.contains("<<<<<<<") || content.contains(">>>>>>>"))
            .unwrap_or(false)
    }

    pub fn mark_conflict_resolved(&self, path: &Path, file: &str) -> Result<(), WorktreeError> {
        self.run_simple_in(path, &["add", "--", file])
    }

    /// Escape hatch for uncommon git invocations, e.g. `checkout --ours <path>`.
    pub fn raw(&self, path: &Path, args: &[&str]) -> Result<Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    fn run_simple(&self, args: &[&str]) -> Result<(), WorktreeError> {
        self.run_simple_in(&self.repo_path.clone(), args)
    }

    fn run_simple_in(&self, dir: &Path, args: &[&str]) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune();
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let status = Command::new("git")
            .args(["init"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git init");
        assert!(status.status.success());

        let _ = Command::new("git")
            .args(["config", "user.email", "test@loom.dev"])
            .current_dir(&repo_path)
            .output();
        let _ = Command::new("git")
            .args(["config", "user.name", "Loom Test"])
            .current_dir(&repo_path)
            .output();

        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        let _ = Command::new("git").args(["add", "."]).current_dir(&repo_path).output();
        let status = Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git commit");
        assert!(status.status.success());

        (dir, repo_path)
    }

    #[test]
    fn branch_name_convention() {
        assert_eq!(
            WorktreeManager::branch_name("sess-1", "t1"),
            "loom/sess-1/t1"
        );
    }

    #[test]
    fn create_and_list_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(worktree_base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("sess", "t1");
        let info = mgr.create_worktree(&branch, "HEAD").expect("create failed");

        assert!(info.path.exists());
        assert_eq!(info.branch.as_deref(), Some(branch.as_str()));

        let worktrees = mgr.list_worktrees().unwrap();
        assert!(worktrees.iter().any(|w| w.branch.as_deref() == Some(branch.as_str())));
    }

    #[test]
    fn create_worktree_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(worktree_base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("sess", "idem");
        let info1 = mgr.create_worktree(&branch, "HEAD").unwrap();
        let info2 = mgr.create_worktree(&branch, "HEAD").unwrap();
        assert_eq!(info1.path, info2.path);
    }

    #[test]
    fn stage_commit_and_diff() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(worktree_base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("sess", "work");
        let info = mgr.create_worktree(&branch, "HEAD").unwrap();

        std::fs::write(info.path.join("feature.txt"), "hello\n").unwrap();
        let staged = mgr.stage_all(&info.path).unwrap();
        assert!(staged);

        let sha = mgr.commit(&info.path, "loom: t1", false).unwrap();
        assert!(sha.is_some());

        let diff = mgr.diff(&info.path, "HEAD~1..HEAD").unwrap();
        assert!(diff.contains("feature.txt"));
    }

    #[test]
    fn commit_with_nothing_staged_returns_none() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(worktree_base.path().to_path_buf())).unwrap();
        let branch = WorktreeManager::branch_name("sess", "empty");
        let info = mgr.create_worktree(&branch, "HEAD").unwrap();

        let sha = mgr.commit(&info.path, "nothing to see", false).unwrap();
        assert!(sha.is_none());
    }

    #[test]
    fn merge_clean_branch() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(worktree_base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("sess", "merge-me");
        let info = mgr.create_worktree(&branch, "HEAD").unwrap();
        std::fs::write(info.path.join("feature.txt"), "hi\n").unwrap();
        mgr.stage_all(&info.path).unwrap();
        mgr.commit(&info.path, "loom: add feature", false).unwrap();
        mgr.remove_worktree(&info.path).unwrap();

        let result = mgr
            .merge_branch(
                &branch,
                MergeOptions {
                    strategy: MergeStrategy::NoFf,
                    no_commit: false,
                    gpg_sign: false,
                },
            )
            .unwrap();
        assert!(matches!(result, MergeResult::Success { .. }));
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn merge_conflicting_branch_is_detected_and_aborted() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(worktree_base.path().to_path_buf())).unwrap();

        // Commit a conflicting change directly on main.
        std::fs::write(repo_path.join("README.md"), "main change\n").unwrap();
        mgr.stage_all(&repo_path).unwrap();
        mgr.commit(&repo_path, "loom: main edit", false).unwrap();

        let branch = WorktreeManager::branch_name("sess", "conflict");
        let info = mgr.create_worktree(&branch, "HEAD~1").unwrap();
        std::fs::write(info.path.join("README.md"), "branch change\n").unwrap();
        mgr.stage_all(&info.path).unwrap();
        mgr.commit(&info.path, "loom: branch edit", false).unwrap();
        mgr.remove_worktree(&info.path).unwrap();

        let result = mgr
            .merge_branch(
                &branch,
                MergeOptions {
                    strategy: MergeStrategy::NoFf,
                    no_commit: false,
                    gpg_sign: false,
                },
            )
            .unwrap();
        assert!(matches!(result, MergeResult::Conflict { .. }));
    }

    #[test]
    fn parse_porcelain_output_basic() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktree/t1
HEAD 789abc012def
branch refs/heads/loom/sess/t1

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1].branch.as_deref(), Some("loom/sess/t1"));
    }
}
