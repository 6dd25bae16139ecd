//! `judgeTask` (spec §4.6): evaluates a completed run against its task's
//! acceptance criterion.
//!
//! Grounded in the teacher's [`crate::gate`] verdict/evaluator split — here
//! the verdict comes from an LLM prompt rather than a shell-invariant exit
//! code, but the shape (read artefacts, evaluate, return a tagged verdict)
//! and the `truncate_snippet` helper carry over unchanged.

use std::path::Path;

use loom_store::{BlockReason, CoordinationStore, LastJudgement, StoreError, Task, TaskState};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::agent::{AgentError, AgentRequest, AgentRole, AgentRunner};
use crate::config::EngineConfig;
use crate::worktree::{WorktreeError, WorktreeManager};

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("judge reply failed to parse as JSON after {attempts} attempts: {last_error}")]
    ParseExhausted { attempts: u32, last_error: String },

    #[error("task {0} has no base_commit recorded; cannot compute diff scope")]
    MissingBaseCommit(String),

    #[error("task {0} has no latest_run_id; nothing to judge")]
    MissingRun(String),
}

/// The raw JSON shape the Judge agent is prompted to reply with.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JudgeReply {
    success: bool,
    #[serde(default)]
    should_continue: bool,
    #[serde(default)]
    should_replan: bool,
    #[serde(default)]
    already_satisfied: bool,
    reason: String,
    #[serde(default)]
    missing_requirements: Vec<String>,
}

/// The enforced, engine-authoritative outcome of a judgement.
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub success: bool,
    pub should_continue: bool,
    pub should_replan: bool,
    pub already_satisfied: bool,
    pub reason: String,
    pub missing_requirements: Vec<String>,
}

impl JudgeOutcome {
    /// The `TaskState`/`BlockReason` this outcome implies, per spec §4.6's
    /// enforcement rules. Does not itself mutate the store — the pipeline
    /// calls the appropriate [`crate::scheduler`] transition.
    pub fn implied_transition(&self) -> ImpliedTransition {
        if self.already_satisfied {
            ImpliedTransition::Skip
        } else if self.should_replan {
            ImpliedTransition::Replan
        } else if self.success {
            ImpliedTransition::Complete
        } else if self.should_continue {
            ImpliedTransition::Continue
        } else {
            ImpliedTransition::Block(BlockReason::MaxRetries)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpliedTransition {
    Skip,
    Replan,
    Complete,
    Continue,
    Block(BlockReason),
}

pub struct Judge<'a> {
    store: &'a CoordinationStore,
    worktrees: &'a WorktreeManager,
    agent_runner: &'a dyn AgentRunner,
    config: &'a EngineConfig,
}

impl<'a> Judge<'a> {
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

    pub async fn judge_task(&self, task: &Task, worktree_path: &Path) -> Result<JudgeOutcome, JudgeError> {
        let run_id = task
            .latest_run_id
            .as_ref()
            .ok_or_else(|| JudgeError::MissingRun(task.id.clone()))?;
        let base_commit = task
            .base_commit
            .as_ref()
            .ok_or_else(|| JudgeError::MissingBaseCommit(task.id.clone()))?;

        let log = tokio::fs::read_to_string(self.store.run_log_path(run_id))
            .await
            .unwrap_or_default();
        let diff_stat = self
            .worktrees
            .diff_stat(worktree_path, &format!("{base_commit}..HEAD"))?;

        let prompt = self.build_prompt(task, &log, &diff_stat);

        let mut last_error = String::new();
        let max_attempts = self.config.iterations.judge_task_retries.max(1);
        for attempt in 0..max_attempts {
            let agent_cfg = &self.config.agents.judge;
            let run_id = CoordinationStore::new_run_id();
            let request = AgentRequest {
                role: AgentRole::Judge,
                agent_type: agent_cfg.agent_type.clone(),
                model: agent_cfg.model.clone(),
                prompt: prompt.clone(),
                working_dir: worktree_path.to_path_buf(),
                session_id: None,
                log_path: self.store.run_log_path(&run_id),
                metadata_path: self.store.config().runs_dir().join(format!("{run_id}.meta.json")),
                timeout: std::time::Duration::from_secs(600),
                env_vars: Default::default(),
            };

            let result = self.agent_runner.run_agent(request).await?;
            match parse_judge_reply(&result.final_response) {
                Ok(reply) => return Ok(self.enforce(task, reply)),
                Err(e) => {
                    warn!(task_id = %task.id, attempt, error = %e, "judge reply failed to parse, retrying");
                    last_error = e;
                }
            }
        }

        Err(JudgeError::ParseExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    fn enforce(&self, task: &Task, reply: JudgeReply) -> JudgeOutcome {
        let mut outcome = JudgeOutcome {
            success: reply.success,
            should_continue: reply.should_continue,
            should_replan: reply.should_replan,
            already_satisfied: reply.already_satisfied,
            reason: reply.reason,
            missing_requirements: reply.missing_requirements,
        };

        if outcome.should_continue {
            let next_iteration = task.judgement_feedback.iteration + 1;
            if next_iteration > task.judgement_feedback.max_iterations {
                outcome.should_continue = false;
                outcome.success = false;
                outcome.reason = "exceeded max iterations".to_string();
            }
        }

        outcome
    }

    fn build_prompt(&self, task: &Task, log: &str, diff_stat: &str) -> String {
        let log_tail: String = log.lines().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
        format!(
            "Evaluate whether the following work satisfies the acceptance criterion.\n\n\
             Acceptance criterion:\n{acceptance}\n\n\
             Run log (tail):\n{log}\n\n\
             Diff stat:\n{diff}\n\n\
             Reply with a single JSON object: \
             {{\"success\": bool, \"shouldContinue\": bool, \"shouldReplan\": bool, \
             \"alreadySatisfied\": bool, \"reason\": string, \"missingRequirements\": [string]}}.",
            acceptance = task.acceptance,
            log = truncate_snippet(&log_tail, 4096),
            diff = truncate_snippet(diff_stat, 2048),
        )
    }
}

/// Extract and parse the first JSON object found in `response` (agents
/// commonly wrap replies in prose or code fences).
fn parse_judge_reply(response: &str) -> Result<JudgeReply, String> {
    let start = response.find('{').ok_or("no JSON object found in judge reply")?;
    let end = response.rfind('}').ok_or("no closing brace found in judge reply")?;
    if end < start {
        return Err("malformed JSON object in judge reply".to_string());
    }
    serde_json::from_str(&response[start..=end]).map_err(|e| e.to_string())
}

/// Truncate a string to at most `max_bytes` bytes, appending "..." if truncated.
fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FakeAgentRunner;
    use loom_store::TaskType;
    use loom_test_utils::{TempCoordinationStore, TempRepo};

    fn sample_task(repo: &str, base_commit: &str, run_id: &str) -> Task {
        let mut t = Task::new(
            "t1",
            repo,
            "loom/sess/t1",
            "adds a feature flag",
            TaskType::Implementation,
            "sess",
            "sess",
        );
        t.base_commit = Some(base_commit.to_string());
        t.latest_run_id = Some(run_id.to_string());
        t
    }

    #[tokio::test]
    async fn success_reply_is_passed_through() {
        let repo_fixture = TempRepo::new();
        let repo = repo_fixture.path.clone();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
        let config = EngineConfig::default();

        let head = worktrees.head_commit(&repo).unwrap();
        let run_id = "run-1";
        std::fs::create_dir_all(store.config().runs_dir()).unwrap();
        std::fs::write(store.run_log_path(run_id), "worker finished successfully").unwrap();

        let task = sample_task(repo.to_str().unwrap(), &head, run_id);
        let runner = FakeAgentRunner::new(
            r#"Here is my evaluation: {"success": true, "reason": "criteria met", "missingRequirements": []}"#,
        );
        let judge = Judge::new(store, &worktrees, &runner, &config);

        let outcome = judge.judge_task(&task, &repo).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.implied_transition(), ImpliedTransition::Complete);
    }

    #[tokio::test]
    async fn continue_past_max_iterations_is_rewritten_to_failure() {
        let repo_fixture = TempRepo::new();
        let repo = repo_fixture.path.clone();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
        let config = EngineConfig::default();

        let head = worktrees.head_commit(&repo).unwrap();
        let run_id = "run-1";
        std::fs::create_dir_all(store.config().runs_dir()).unwrap();
        std::fs::write(store.run_log_path(run_id), "partial progress").unwrap();

        let mut task = sample_task(repo.to_str().unwrap(), &head, run_id);
        task.judgement_feedback.iteration = 3;
        task.judgement_feedback.max_iterations = 3;

        let runner = FakeAgentRunner::new(
            r#"{"success": false, "shouldContinue": true, "reason": "needs more work", "missingRequirements": ["tests"]}"#,
        );
        let judge = Judge::new(store, &worktrees, &runner, &config);

        let outcome = judge.judge_task(&task, &repo).await.unwrap();
        assert!(!outcome.should_continue);
        assert_eq!(outcome.reason, "exceeded max iterations");
        assert!(matches!(outcome.implied_transition(), ImpliedTransition::Block(_)));
    }

    #[tokio::test]
    async fn already_satisfied_implies_skip() {
        let repo_fixture = TempRepo::new();
        let repo = repo_fixture.path.clone();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
        let config = EngineConfig::default();

        let head = worktrees.head_commit(&repo).unwrap();
        let run_id = "run-1";
        std::fs::create_dir_all(store.config().runs_dir()).unwrap();
        std::fs::write(store.run_log_path(run_id), "nothing to do").unwrap();

        let task = sample_task(repo.to_str().unwrap(), &head, run_id);
        let runner = FakeAgentRunner::new(
            r#"{"success": true, "alreadySatisfied": true, "reason": "already done", "missingRequirements": []}"#,
        );
        let judge = Judge::new(store, &worktrees, &runner, &config);

        let outcome = judge.judge_task(&task, &repo).await.unwrap();
        assert_eq!(outcome.implied_transition(), ImpliedTransition::Skip);
    }

    #[tokio::test]
    async fn unparseable_reply_exhausts_retries() {
        let repo_fixture = TempRepo::new();
        let repo = repo_fixture.path.clone();
        let store_fixture = TempCoordinationStore::new().await;
        let store = &store_fixture.store;
        let worktrees = WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
        let mut config = EngineConfig::default();
        config.iterations.judge_task_retries = 2;

        let head = worktrees.head_commit(&repo).unwrap();
        let run_id = "run-1";
        std::fs::create_dir_all(store.config().runs_dir()).unwrap();
        std::fs::write(store.run_log_path(run_id), "log").unwrap();

        let task = sample_task(repo.to_str().unwrap(), &head, run_id);
        let runner = FakeAgentRunner::new("not json at all");
        let judge = Judge::new(store, &worktrees, &runner, &config);

        let result = judge.judge_task(&task, &repo).await;
        assert!(matches!(result, Err(JudgeError::ParseExhausted { attempts: 2, .. })));
    }
}
