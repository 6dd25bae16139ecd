//! `executeTaskWithWorktree` (spec §4.4): runs one task to completion in
//! its own worktree.
//!
//! Adapted from the teacher's staged `run_agent_lifecycle` pipeline
//! ([`crate::lifecycle`]) and its `commit_agent_work` helper, generalised
//! to honour `scope_paths`-first staging and multi-dependency base
//! resolution via a merge-base branch.

use std::path::PathBuf;
use std::time::Duration;

use loom_store::{CoordinationStore, PendingConflictResolution, Run, RunStatus, Task};
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentRequest, AgentRole, AgentRunner};
use crate::config::EngineConfig;
use crate::worktree::{MergeOptions, MergeResult, MergeStrategy, WorktreeError, WorktreeManager};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Store(#[from] loom_store::StoreError),

    #[error("a multi-dependency task must depend on at least one completed task")]
    NoDependencies,
}

/// Outcome of one attempt at `executeTaskWithWorktree`.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub run_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub changed_files: Vec<String>,
    /// The worktree's HEAD commit at checkout, before the agent ran. The
    /// Judge diffs `base_commit..HEAD` to see what the worker changed.
    pub base_commit: String,
    /// Set when `success` is false because base resolution hit a merge
    /// conflict, so the caller can attach it to the task's block state.
    pub pending_conflict_resolution: Option<PendingConflictResolution>,
}

/// Either a resolved base ref, or the detail of a merge conflict hit while
/// constructing one.
enum BaseResolution {
    Ready(String),
    Conflict(PendingConflictResolution),
}

/// Classification of a worker failure, feeding `blockTask`'s `reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    SystemErrorTransient,
    Conflict,
    Unknown,
}

pub struct Worker<'a> {
    store: &'a CoordinationStore,
    worktrees: &'a WorktreeManager,
    agent_runner: &'a dyn AgentRunner,
    config: &'a EngineConfig,
}

impl<'a> Worker<'a> {
    pub fn new(
        store: &'a CoordinationStore,
        worktrees: &'a WorktreeManager,
        agent_runner: &'a dyn AgentRunner,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            worktrees,
            agent_runner,
            config,
        }
    }

    /// Run `task` to completion in its own worktree. `base_branch` is the
    /// repository's integration branch; `dependencies` are the already
    /// completed tasks `task` depends on (used to resolve the base for
    /// multi-dependency tasks).
    pub async fn execute_task_with_worktree(
        &self,
        task: &Task,
        base_branch: &str,
        dependencies: &[Task],
    ) -> Result<WorkerOutcome, WorkerError> {
        let base = match self.resolve_base(task, base_branch, dependencies)? {
            BaseResolution::Ready(base) => base,
            BaseResolution::Conflict(detail) => {
                warn!(task_id = %task.id, "merge conflict resolving multi-dependency base");
                return Ok(WorkerOutcome {
                    run_id: CoordinationStore::new_run_id(),
                    success: false,
                    error: Some(format!("merge conflict resolving base: {}", detail.details)),
                    changed_files: Vec::new(),
                    base_commit: String::new(),
                    pending_conflict_resolution: Some(detail),
                });
            }
        };

        let branch = WorktreeManager::branch_name(&task.session_id, &task.id);
        let info = self.worktrees.create_worktree(&branch, &base)?;

        let prompt = self.build_prompt(task);
        let run_id = CoordinationStore::new_run_id();
        let log_path = self.store.run_log_path(&run_id);
        let metadata_path = self
            .store
            .config()
            .runs_dir()
            .join(format!("{run_id}.meta.json"));

        let agent_cfg = &self.config.agents.worker;
        let request = AgentRequest {
            role: AgentRole::Worker,
            agent_type: agent_cfg.agent_type.clone(),
            model: agent_cfg.model.clone(),
            prompt,
            working_dir: info.path.clone(),
            session_id: None,
            log_path: log_path.clone(),
            metadata_path,
            timeout: Duration::from_secs(u64::from(self.config.planning.max_task_duration) * 3600),
            env_vars: Default::default(),
        };

        let run_result = match self.agent_runner.run_agent(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "agent runner invocation failed");
                let run = Run {
                    id: run_id.clone(),
                    task_id: task.id.clone(),
                    agent_type: agent_cfg.agent_type.clone(),
                    status: RunStatus::Failed,
                    started_at: chrono::Utc::now(),
                    finished_at: Some(chrono::Utc::now()),
                    log_path: log_path.to_string_lossy().to_string(),
                    session_id: String::new(),
                    error_message: Some(e.to_string()),
                };
                self.store.write_run(&run).await?;
                return Ok(WorkerOutcome {
                    run_id,
                    success: false,
                    error: Some(e.to_string()),
                    changed_files: Vec::new(),
                    base_commit: info.head_commit.clone(),
                    pending_conflict_resolution: None,
                });
            }
        };

        let staged_by_scope = if task.scope_paths.is_empty() {
            false
        } else {
            self.worktrees.stage_paths(&info.path, &task.scope_paths)?
        };
        let staged = if staged_by_scope {
            true
        } else {
            self.worktrees.stage_all(&info.path)?
        };

        let commit_message = format!("loom: {} ({})", task.id, task.task_type);
        let commit_sha = if staged {
            self.worktrees
                .commit(&info.path, &commit_message, self.config.commit.auto_signature)?
        } else {
            None
        };

        let changed_files = if let Some(ref sha) = commit_sha {
            self.worktrees
                .diff(&info.path, &format!("{sha}~1..{sha}"))
                .map(|d| parse_diff_files(&d))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        // Success iff there is a new commit, or the worktree was already
        // clean (nothing left to do — the acceptance criteria were already
        // satisfied before the agent ran).
        let success = commit_sha.is_some() || !staged;

        let run = Run {
            id: run_id.clone(),
            task_id: task.id.clone(),
            agent_type: agent_cfg.agent_type.clone(),
            status: if success { RunStatus::Success } else { RunStatus::Failed },
            started_at: chrono::Utc::now(),
            finished_at: Some(chrono::Utc::now()),
            log_path: run_result.log_path.to_string_lossy().to_string(),
            session_id: run_result.session_id,
            error_message: if success {
                None
            } else {
                Some("no commit produced and worktree has uncommitted changes".to_string())
            },
        };
        self.store.write_run(&run).await?;

        info!(task_id = %task.id, run_id = %run_id, success, "task execution finished");

        Ok(WorkerOutcome {
            run_id,
            success,
            error: run.error_message,
            changed_files,
            base_commit: info.head_commit.clone(),
            pending_conflict_resolution: None,
        })
    }

    /// Remove the worktree for `task`. Never deletes the branch — the
    /// branch is the durable record of the task's work until integration.
    pub fn cleanup_worktree(&self, task: &Task) -> Result<(), WorkerError> {
        let branch = WorktreeManager::branch_name(&task.session_id, &task.id);
        let dir_name = branch.replace('/', "--");
        let path = self.worktrees.worktree_base().join(dir_name);
        self.worktrees.remove_worktree(&path)?;
        Ok(())
    }

    /// Classify a failure for `blockTask`'s `BlockReason` (spec §4.4).
    pub fn classify_failure(&self, outcome: &WorkerOutcome) -> FailureClass {
        match &outcome.error {
            Some(msg) if msg.contains("CONFLICT") || msg.contains("conflict") => FailureClass::Conflict,
            Some(_) => FailureClass::SystemErrorTransient,
            None => FailureClass::Unknown,
        }
    }

    fn resolve_base(
        &self,
        task: &Task,
        base_branch: &str,
        dependencies: &[Task],
    ) -> Result<BaseResolution, WorkerError> {
        match dependencies.len() {
            0 => Ok(BaseResolution::Ready(base_branch.to_string())),
            1 => Ok(BaseResolution::Ready(dependencies[0].branch.clone())),
            _ => {
                // Multi-dependency base: construct a merge-base branch by
                // branching off `base_branch` then merging each dependency
                // branch into it in turn (spec §4.4 step 1, option (a)).
                let merge_branch_name = format!("{}-base", WorktreeManager::branch_name(&task.session_id, &task.id));
                let info = self.worktrees.create_worktree(&merge_branch_name, base_branch)?;

                for dep in dependencies {
                    let result = self.worktrees.merge_branch_in(
                        &info.path,
                        &dep.branch,
                        MergeOptions {
                            strategy: MergeStrategy::NoFf,
                            no_commit: false,
                            gpg_sign: false,
                        },
                    )?;
                    if let MergeResult::Conflict { conflicts, details } = result {
                        self.worktrees.remove_worktree(&info.path)?;
                        self.worktrees.delete_branch(&merge_branch_name)?;
                        // A conflict here blocks only this task, not the whole
                        // run (spec: BLOCKED(CONFLICT) with a per-task
                        // `pendingConflictResolution`), unlike the
                        // `WorktreeError`s this function raises for actual
                        // git-command failures.
                        return Ok(BaseResolution::Conflict(PendingConflictResolution {
                            conflicting_files: conflicts,
                            details,
                        }));
                    }
                }

                let base_commit = self.worktrees.head_commit(&info.path)?;
                self.worktrees.remove_worktree(&info.path)?;
                self.worktrees.delete_branch(&merge_branch_name)?;
                Ok(BaseResolution::Ready(base_commit))
            }
        }
    }

    fn build_prompt(&self, task: &Task) -> String {
        format!(
            "You are implementing task `{id}` ({task_type}).\n\n\
             Acceptance criteria:\n{acceptance}\n\n\
             Context:\n{context}\n\n\
             Scope paths: {scope}\n\n\
             Make the smallest change that satisfies the acceptance criteria, then stop.",
            id = task.id,
            task_type = task.task_type,
            acceptance = task.acceptance,
            context = task.context,
            scope = if task.scope_paths.is_empty() {
                "(entire repository)".to_string()
            } else {
                task.scope_paths.join(", ")
            },
        )
    }
}

fn parse_diff_files(diff: &str) -> Vec<String> {
    diff.lines()
        .filter_map(|line| line.strip_prefix("diff --git a/"))
        .filter_map(|rest| rest.split(" b/").next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FakeAgentRunner;
    use loom_store::TaskType;
    use loom_test_utils::{TempCoordinationStore, TempRepo};

    fn sample_task(id: &str, repo: &str) -> Task {
        Task::new(
            id,
            repo,
            format!("loom/sess/{id}"),
            "add a line to README.md",
            TaskType::Implementation,
            "sess",
            "sess",
        )
    }

    #[tokio::test]
    async fn successful_run_produces_commit_and_done_run() {
        let repo = TempRepo::new();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo.path, Some(repo.worktree_base.clone())).unwrap();
        let config = EngineConfig::default();

        let task = sample_task("t1", repo.path.to_str().unwrap());
        let runner = FakeAgentRunner::new("done");

        let worker = Worker::new(store, &worktrees, &runner, &config);

        // The fake runner doesn't touch the worktree, so seed a change so
        // staging has something to commit.
        let branch = WorktreeManager::branch_name(&task.session_id, &task.id);
        // Pre-create the worktree so we can write into it before running,
        // mirroring what a real agent would have done inside its sandbox.
        let info = worktrees.create_worktree(&branch, "HEAD").unwrap();
        std::fs::write(info.path.join("feature.txt"), "added by worker\n").unwrap();

        let outcome = worker
            .execute_task_with_worktree(&task, "HEAD", &[])
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.changed_files.contains(&"feature.txt".to_string()));

        let run = store.read_run(&outcome.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn already_satisfied_with_no_changes_is_success() {
        let repo = TempRepo::new();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo.path, Some(repo.worktree_base.clone())).unwrap();
        let config = EngineConfig::default();

        let task = sample_task("t1", repo.path.to_str().unwrap());
        let runner = FakeAgentRunner::new("nothing to do, already satisfied");
        let worker = Worker::new(store, &worktrees, &runner, &config);

        let outcome = worker
            .execute_task_with_worktree(&task, "HEAD", &[])
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.changed_files.is_empty());
    }

    #[tokio::test]
    async fn agent_runner_error_is_recorded_as_failed_run() {
        use crate::agent::{AgentError, AgentRunResult};
        use async_trait::async_trait;

        struct FailingRunner;
        #[async_trait]
        impl AgentRunner for FailingRunner {
            async fn run_agent(&self, _req: AgentRequest) -> Result<AgentRunResult, AgentError> {
                Err(AgentError::Timeout(Duration::from_secs(1)))
            }
        }

        let repo = TempRepo::new();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo.path, Some(repo.worktree_base.clone())).unwrap();
        let config = EngineConfig::default();

        let task = sample_task("t1", repo.path.to_str().unwrap());
        let runner = FailingRunner;
        let worker = Worker::new(store, &worktrees, &runner, &config);

        let outcome = worker
            .execute_task_with_worktree(&task, "HEAD", &[])
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }
}
