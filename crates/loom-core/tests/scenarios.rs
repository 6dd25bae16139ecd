//! Crate-level scenario tests exercising the execution pipeline end to end
//! against scripted agent effects -- no real subprocess spawned. Covers the
//! fan-out-with-failure, conflict-auto-resolution, continuation, and
//! additional-task-loop scenarios. The linear-chain and cycle scenarios are
//! already covered by `pipeline.rs`'s own `#[cfg(test)]` module.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use loom_core::{
    AgentError, AgentRequest, AgentRole, AgentRunResult, AgentRunner, EngineConfig, Pipeline,
    Planner,
};
use loom_store::{Task, TaskType};
use loom_test_utils::{TempCoordinationStore, TempRepo};
use tokio_util::sync::CancellationToken;

const SUCCESS_JUDGE_REPLY: &str =
    r#"{"success": true, "reason": "looks good", "missingRequirements": []}"#;

/// `TempRepo` only seeds a README; the conflict scenarios below also need a
/// second tracked file both branches touch.
fn init_repo() -> TempRepo {
    let repo = TempRepo::new();
    repo.commit_file("shared.lock", "base lock\n", "add shared.lock");
    repo
}

fn sample_task(id: &str, repo: &str, deps: &[&str]) -> Task {
    let mut t = Task::new(
        id,
        repo,
        format!("loom/sess/{id}"),
        format!("acceptance for {id}"),
        TaskType::Implementation,
        "sess",
        "sess",
    );
    t.dependencies = deps.iter().map(|s| s.to_string()).collect();
    t
}

/// Write a canned response to `req.log_path` and return it as the agent's
/// final response, mirroring `FakeAgentRunner` but allowing role-specific
/// and call-ordered behaviour.
async fn respond(req: AgentRequest, text: &str) -> Result<AgentRunResult, AgentError> {
    if let Some(parent) = req.log_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(&req.log_path, text).await.unwrap();
    Ok(AgentRunResult {
        final_response: text.to_string(),
        session_id: req.session_id.clone().unwrap_or_else(|| "test-session".to_string()),
        log_path: req.log_path.clone(),
        metadata_path: req.metadata_path.clone(),
    })
}

// S2 -- fan-out with one failure: T1 keeps getting "shouldContinue" from the
// Judge past its continuation budget and ends up Blocked(MaxRetries), which
// blast-radius-blocks its dependent T3, while T0/T2 complete normally.
struct FlakyJudgeRunner {
    flaky_marker: String,
    worker_calls: AtomicU32,
}

#[async_trait]
impl AgentRunner for FlakyJudgeRunner {
    async fn run_agent(&self, req: AgentRequest) -> Result<AgentRunResult, AgentError> {
        match req.role {
            AgentRole::Worker => {
                let n = self.worker_calls.fetch_add(1, Ordering::SeqCst);
                tokio::fs::write(req.working_dir.join(format!("change-{n}.txt")), "work\n")
                    .await
                    .unwrap();
                respond(req, "worker finished").await
            }
            AgentRole::Judge => {
                let reply = if req.prompt.contains(&self.flaky_marker) {
                    r#"{"success": false, "shouldContinue": true, "reason": "needs more work", "missingRequirements": ["more work"]}"#
                } else {
                    SUCCESS_JUDGE_REPLY
                };
                respond(req, reply).await
            }
            AgentRole::Planner => respond(req, "{}").await,
        }
    }
}

#[tokio::test]
async fn fan_out_with_one_failure_blast_radius_blocks_dependent() {
    let repo_fixture = init_repo();
    let repo = repo_fixture.path.clone();
    let store_fixture = TempCoordinationStore::new().await;
    let store = &store_fixture.store;
    let worktrees =
        loom_core::WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
    let mut config = EngineConfig::default();
    config.integration.post_integration_evaluation = false;

    let repo_str = repo.to_str().unwrap();
    store.create_task(sample_task("t0", repo_str, &[])).await.unwrap();
    let mut t1 = sample_task("t1", repo_str, &["t0"]);
    t1.acceptance = "acceptance for t1 (FLAKY)".to_string();
    t1.judgement_feedback.max_iterations = 1;
    store.create_task(t1).await.unwrap();
    store.create_task(sample_task("t2", repo_str, &["t0"])).await.unwrap();
    store.create_task(sample_task("t3", repo_str, &["t1", "t2"])).await.unwrap();

    let runner = FlakyJudgeRunner {
        flaky_marker: "FLAKY".to_string(),
        worker_calls: AtomicU32::new(0),
    };
    let pipeline = Pipeline::new(&store, &worktrees, &runner, &config, "HEAD");
    let result = pipeline.run(CancellationToken::new()).await.unwrap();

    assert!(!result.success());
    assert!(result.completed_task_ids.contains(&"t0".to_string()));
    assert!(result.completed_task_ids.contains(&"t2".to_string()));
    assert!(result.blocked_task_ids.contains(&"t1".to_string()));
    assert!(result.blocked_task_ids.contains(&"t3".to_string()));

    let t1_final = store.read_task("t1").await.unwrap();
    assert_eq!(t1_final.block_reason, Some(loom_store::BlockReason::MaxRetries));
}

// S4 -- conflict auto-resolution: two independent tasks both touch
// `shared.lock`; the second merge conflicts on it but it's in
// `auto_resolve_ours_globs`, so integration auto-resolves and commits.
struct ConflictingWorkRunner;

#[async_trait]
impl AgentRunner for ConflictingWorkRunner {
    async fn run_agent(&self, req: AgentRequest) -> Result<AgentRunResult, AgentError> {
        match req.role {
            AgentRole::Worker => {
                let marker = if req.prompt.contains("`t1`") { "t1" } else { "t2" };
                tokio::fs::write(
                    req.working_dir.join("shared.lock"),
                    format!("{marker} lock contents\n"),
                )
                .await
                .unwrap();
                tokio::fs::write(
                    req.working_dir.join(format!("{marker}.txt")),
                    format!("{marker} work\n"),
                )
                .await
                .unwrap();
                respond(req, "worker finished").await
            }
            AgentRole::Judge => respond(req, SUCCESS_JUDGE_REPLY).await,
            AgentRole::Planner => respond(req, "{}").await,
        }
    }
}

#[tokio::test]
async fn conflicting_lockfile_changes_auto_resolve_during_integration() {
    let repo_fixture = init_repo();
    let repo = repo_fixture.path.clone();
    let store_fixture = TempCoordinationStore::new().await;
    let store = &store_fixture.store;
    let worktrees =
        loom_core::WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
    let mut config = EngineConfig::default();
    config.integration.auto_resolve_ours_globs = vec!["shared.lock".to_string()];
    // No planner session exists in this test, so the post-integration
    // evaluation loop merges and then exits immediately (no session to
    // judge against) -- exactly what this scenario needs to observe.
    assert!(config.integration.post_integration_evaluation);

    let repo_str = repo.to_str().unwrap();
    store.create_task(sample_task("t1", repo_str, &[])).await.unwrap();
    store.create_task(sample_task("t2", repo_str, &[])).await.unwrap();

    let runner = ConflictingWorkRunner;
    let pipeline = Pipeline::new(&store, &worktrees, &runner, &config, "HEAD");
    let result = pipeline.run(CancellationToken::new()).await.unwrap();

    assert!(result.success());
    assert_eq!(result.completed_task_ids.len(), 2);
}

// S5 -- continuation: the Judge asks for another round, then accepts.
struct ContinuationRunner {
    judge_calls: AtomicU32,
    worker_calls: AtomicU32,
}

#[async_trait]
impl AgentRunner for ContinuationRunner {
    async fn run_agent(&self, req: AgentRequest) -> Result<AgentRunResult, AgentError> {
        match req.role {
            AgentRole::Worker => {
                let n = self.worker_calls.fetch_add(1, Ordering::SeqCst);
                tokio::fs::write(req.working_dir.join(format!("pass-{n}.txt")), "work\n")
                    .await
                    .unwrap();
                respond(req, "worker finished").await
            }
            AgentRole::Judge => {
                let n = self.judge_calls.fetch_add(1, Ordering::SeqCst);
                let reply = if n == 0 {
                    r#"{"success": false, "shouldContinue": true, "reason": "needs tests", "missingRequirements": ["add tests"]}"#
                } else {
                    r#"{"success": true, "reason": "tests added", "missingRequirements": []}"#
                };
                respond(req, reply).await
            }
            AgentRole::Planner => respond(req, "{}").await,
        }
    }
}

#[tokio::test]
async fn continuation_round_then_success_completes_task() {
    let repo_fixture = init_repo();
    let repo = repo_fixture.path.clone();
    let store_fixture = TempCoordinationStore::new().await;
    let store = &store_fixture.store;
    let worktrees =
        loom_core::WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
    let mut config = EngineConfig::default();
    config.integration.post_integration_evaluation = false;

    let mut t1 = sample_task("t1", repo.to_str().unwrap(), &[]);
    t1.judgement_feedback.max_iterations = 2;
    store.create_task(t1).await.unwrap();

    let runner = ContinuationRunner {
        judge_calls: AtomicU32::new(0),
        worker_calls: AtomicU32::new(0),
    };
    let pipeline = Pipeline::new(&store, &worktrees, &runner, &config, "HEAD");
    let result = pipeline.run(CancellationToken::new()).await.unwrap();

    assert!(result.success());
    assert_eq!(result.completed_task_ids, vec!["t1".to_string()]);
    assert_eq!(runner.judge_calls.load(Ordering::SeqCst), 2);
    assert_eq!(runner.worker_calls.load(Ordering::SeqCst), 2);

    let t1_final = store.read_task("t1").await.unwrap();
    assert_eq!(t1_final.judgement_feedback.iteration, 1);
}

// S6 -- additional-task loop: an initial two-task plan completes, the
// Planner's final judgement says a migration script is missing, it plans
// one more task, which completes, then the final judgement is satisfied.
struct PlannerLoopRunner {
    planner_replies: Mutex<VecDeque<String>>,
    worker_calls: AtomicU32,
}

#[async_trait]
impl AgentRunner for PlannerLoopRunner {
    async fn run_agent(&self, req: AgentRequest) -> Result<AgentRunResult, AgentError> {
        match req.role {
            AgentRole::Worker => {
                let n = self.worker_calls.fetch_add(1, Ordering::SeqCst);
                tokio::fs::write(req.working_dir.join(format!("work-{n}.txt")), "done\n")
                    .await
                    .unwrap();
                respond(req, "worker finished").await
            }
            AgentRole::Judge => respond(req, SUCCESS_JUDGE_REPLY).await,
            AgentRole::Planner => {
                let reply = {
                    let mut queue = self.planner_replies.lock().unwrap();
                    queue.pop_front().expect("unexpected extra planner call")
                };
                respond(req, &reply).await
            }
        }
    }
}

#[tokio::test]
async fn additional_task_loop_runs_until_final_judgement_is_satisfied() {
    let repo_fixture = init_repo();
    let repo = repo_fixture.path.clone();
    let store_fixture = TempCoordinationStore::new().await;
    let store = &store_fixture.store;
    let worktrees =
        loom_core::WorktreeManager::new(&repo, Some(repo_fixture.worktree_base.clone())).unwrap();
    let config = EngineConfig::default();
    let repo_str = repo.to_str().unwrap();

    let initial_plan_reply = r#"{
        "tasks": [
            {"id": "t1", "acceptance": "implement feature A", "taskType": "implementation", "context": "", "dependencies": [], "scopePaths": [], "estimatedHours": 1.0},
            {"id": "t2", "acceptance": "implement feature B", "taskType": "implementation", "context": "", "dependencies": [], "scopePaths": [], "estimatedHours": 1.0}
        ],
        "qualityScore": 90,
        "qualityReasoning": "clear and narrow"
    }"#;
    let final_judgement_incomplete = r#"{"isComplete": false, "missingAspects": ["migration script"], "additionalTaskSuggestions": ["add-migration-script"], "completionScore": 70.0}"#;
    let additional_plan_reply = r#"{
        "tasks": [
            {"id": "t3", "acceptance": "add migration script", "taskType": "implementation", "context": "", "dependencies": [], "scopePaths": [], "estimatedHours": 1.0}
        ],
        "qualityScore": 90,
        "qualityReasoning": "clear"
    }"#;
    let final_judgement_complete = r#"{"isComplete": true, "missingAspects": [], "additionalTaskSuggestions": [], "completionScore": 95.0}"#;

    let runner = PlannerLoopRunner {
        planner_replies: Mutex::new(VecDeque::from([
            initial_plan_reply.to_string(),
            final_judgement_incomplete.to_string(),
            additional_plan_reply.to_string(),
            final_judgement_complete.to_string(),
        ])),
        worker_calls: AtomicU32::new(0),
    };

    let planner = Planner::new(&store, &runner, &config, repo_str, "HEAD");
    let plan_result = planner.plan_tasks("build feature A and B").await.unwrap();
    assert_eq!(plan_result.task_ids.len(), 2);

    let pipeline = Pipeline::new(&store, &worktrees, &runner, &config, "HEAD");
    let result = pipeline.run(CancellationToken::new()).await.unwrap();

    assert!(result.success());
    let tasks = store.list_tasks().await.unwrap();
    let done_ids: Vec<String> = tasks
        .iter()
        .filter(|t| matches!(t.state, loom_store::TaskState::Done | loom_store::TaskState::Skipped))
        .map(|t| t.id.clone())
        .collect();
    assert!(done_ids.contains(&"t1".to_string()));
    assert!(done_ids.contains(&"t2".to_string()));
    assert!(done_ids.contains(&"t3".to_string()));
}
