//! Task lifecycle transitions and dispatch ordering (spec §4.3).
//!
//! Every transition is expressed as a CAS update against the coordination
//! store: the caller supplies the `Task` it last observed, the scheduler
//! validates the transition is legal from that state, then asks the store
//! to apply it conditioned on the version the caller observed. A version
//! mismatch means another coordinator mutated the task concurrently and
//! surfaces as [`SchedulerError::Store`].

use loom_store::{
    BlockReason, CoordinationStore, LastJudgement, PendingConflictResolution, ReplanningInfo, StoreError, Task,
    TaskState,
};
use thiserror::Error;

use crate::graph::DependencyGraph;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {id} is not claimable from state {state}")]
    NotClaimable { id: String, state: TaskState },

    #[error("task {id} has reached its continuation iteration cap ({max_iterations})")]
    MaxIterationsExceeded { id: String, max_iterations: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Claim a ready (or needs-continuation) task for `worker_slot_id`,
/// transitioning it to `Running`.
pub async fn claim_task(
    store: &CoordinationStore,
    task: &Task,
    worker_slot_id: &str,
) -> Result<Task, SchedulerError> {
    if !task.state.is_claimable() {
        return Err(SchedulerError::NotClaimable {
            id: task.id.clone(),
            state: task.state,
        });
    }

    let slot = worker_slot_id.to_string();
    let updated = store
        .update_task_cas(&task.id, task.version, move |t| {
            t.state = TaskState::Running;
            t.owner = Some(slot);
        })
        .await?;
    Ok(updated)
}

/// Transition a task to `Blocked`, recording why.
pub async fn block_task(
    store: &CoordinationStore,
    task: &Task,
    reason: BlockReason,
    message: impl Into<String>,
) -> Result<Task, SchedulerError> {
    let message = message.into();
    let updated = store
        .update_task_cas(&task.id, task.version, move |t| {
            t.state = TaskState::Blocked;
            t.owner = None;
            t.block_reason = Some(reason);
            t.block_message = Some(message);
        })
        .await?;
    Ok(updated)
}

/// Block a task on a merge-base conflict, attaching the conflicting files
/// and git output so a later retry (spec §4.4/§4.8) can act on it.
pub async fn block_task_for_conflict(
    store: &CoordinationStore,
    task: &Task,
    message: impl Into<String>,
    detail: PendingConflictResolution,
) -> Result<Task, SchedulerError> {
    let message = message.into();
    let updated = store
        .update_task_cas(&task.id, task.version, move |t| {
            t.state = TaskState::Blocked;
            t.owner = None;
            t.block_reason = Some(BlockReason::Conflict);
            t.block_message = Some(message);
            t.pending_conflict_resolution = Some(detail);
        })
        .await?;
    Ok(updated)
}

/// Rebase a previously BLOCKED task onto the integration branch for retry
/// (spec §4.5 Phase D / §4.8): clears block and conflict state, drops its
/// declared dependencies so base resolution falls through to whatever base
/// branch the retry is dispatched against, and marks `integration_retried`.
pub async fn retry_task_from_integration(store: &CoordinationStore, task: &Task) -> Result<Task, SchedulerError> {
    let updated = store
        .update_task_cas(&task.id, task.version, |t| {
            t.state = TaskState::Ready;
            t.owner = None;
            t.block_reason = None;
            t.block_message = None;
            t.pending_conflict_resolution = None;
            t.dependencies.clear();
            t.integration_retried = true;
        })
        .await?;
    Ok(updated)
}

/// Reset a task to `Ready`, e.g. after a transient system error. Preserves
/// `judgement_feedback` so continuation accounting is not lost.
pub async fn reset_task_to_ready(store: &CoordinationStore, task: &Task) -> Result<Task, SchedulerError> {
    let updated = store
        .update_task_cas(&task.id, task.version, |t| {
            t.state = TaskState::Ready;
            t.owner = None;
            t.block_reason = None;
            t.block_message = None;
        })
        .await?;
    Ok(updated)
}

/// Mark a task `Done`.
pub async fn mark_task_as_completed(store: &CoordinationStore, task: &Task) -> Result<Task, SchedulerError> {
    let updated = store
        .update_task_cas(&task.id, task.version, |t| {
            t.state = TaskState::Done;
            t.owner = None;
        })
        .await?;
    Ok(updated)
}

/// Mark a task `Skipped` (Judge found it already satisfied).
pub async fn mark_task_as_skipped(
    store: &CoordinationStore,
    task: &Task,
    reason: impl Into<String>,
) -> Result<Task, SchedulerError> {
    let reason = reason.into();
    let updated = store
        .update_task_cas(&task.id, task.version, move |t| {
            t.state = TaskState::Skipped;
            t.owner = None;
            t.skip_reason = Some(reason);
        })
        .await?;
    Ok(updated)
}

/// Mark a task for another continuation round after a Judge evaluation
/// that asked for more work. Increments `judgement_feedback.iteration`
/// (pre-increment convention: the new value is the count of continuations
/// scheduled so far). Fails once `iteration + 1` would exceed
/// `max_iterations` — the caller should block the task instead.
pub async fn mark_task_for_continuation(
    store: &CoordinationStore,
    task: &Task,
    judgement: LastJudgement,
) -> Result<Task, SchedulerError> {
    let next_iteration = task.judgement_feedback.iteration + 1;
    if next_iteration > task.judgement_feedback.max_iterations {
        return Err(SchedulerError::MaxIterationsExceeded {
            id: task.id.clone(),
            max_iterations: task.judgement_feedback.max_iterations,
        });
    }

    let updated = store
        .update_task_cas(&task.id, task.version, move |t| {
            t.state = TaskState::NeedsContinuation;
            t.owner = None;
            t.judgement_feedback.iteration = next_iteration;
            t.judgement_feedback.last_judgement = Some(judgement);
        })
        .await?;
    Ok(updated)
}

/// Transition a task to `ReplacedByReplan`: the Judge decided the task
/// itself is the wrong unit of work and the Planner generated a
/// replacement subtree in its place. `replaced_by` names the new tasks;
/// downstream dependents of the replaced task are still blocked by the
/// caller's usual blast-radius handling, since `ReplacedByReplan` does not
/// satisfy a dependency edge.
pub async fn mark_task_as_replaced(
    store: &CoordinationStore,
    task: &Task,
    reason: impl Into<String>,
    replaced_by: Vec<String>,
) -> Result<Task, SchedulerError> {
    let reason = reason.into();
    let iteration = task.replanning_info.as_ref().map(|r| r.iteration + 1).unwrap_or(1);
    let max_iterations = task.replanning_info.as_ref().map(|r| r.max_iterations).unwrap_or(3);
    let original_task_id = task.id.clone();
    let updated = store
        .update_task_cas(&task.id, task.version, move |t| {
            t.state = TaskState::ReplacedByReplan;
            t.owner = None;
            t.replanning_info = Some(ReplanningInfo {
                iteration,
                max_iterations,
                original_task_id,
                replaced_by,
                replan_reason: reason,
            });
        })
        .await?;
    Ok(updated)
}

/// Order a set of ready tasks for dispatch: fewest dependents first, then
/// id lexicographic (spec §4.3). Levels bound eligibility only — this
/// ordering governs which of several eligible tasks is claimed first when
/// worker capacity is constrained.
pub fn dispatch_order<'a>(ready: &'a [Task], graph: &DependencyGraph) -> Vec<&'a Task> {
    let mut ordered: Vec<&Task> = ready.iter().collect();
    ordered.sort_by(|a, b| {
        let dependents_a = graph.dependents(&a.id).len();
        let dependents_b = graph.dependents(&b.id).len();
        dependents_a.cmp(&dependents_b).then_with(|| a.id.cmp(&b.id))
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_store::TaskType;
    use loom_test_utils::TempCoordinationStore;

    async fn test_store() -> TempCoordinationStore {
        TempCoordinationStore::new().await
    }

    fn sample_task(id: &str) -> Task {
        Task::new(
            id,
            "/repo",
            format!("loom/sess/{id}"),
            "do the thing",
            TaskType::Implementation,
            "sess",
            "sess",
        )
    }

    #[tokio::test]
    async fn claim_transitions_ready_to_running() {
        let fixture = test_store().await;
        let store = &fixture.store;
        let task = store.create_task(sample_task("t1")).await.unwrap();
        let claimed = claim_task(&store, &task, "slot-0").await.unwrap();
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.owner.as_deref(), Some("slot-0"));
    }

    #[tokio::test]
    async fn claim_rejects_non_claimable_state() {
        let fixture = test_store().await;
        let store = &fixture.store;
        let mut t = sample_task("t1");
        t.state = TaskState::Done;
        let task = store.create_task(t).await.unwrap();
        let result = claim_task(&store, &task, "slot-0").await;
        assert!(matches!(result, Err(SchedulerError::NotClaimable { .. })));
    }

    #[tokio::test]
    async fn block_task_records_reason() {
        let fixture = test_store().await;
        let store = &fixture.store;
        let task = store.create_task(sample_task("t1")).await.unwrap();
        let blocked = block_task(&store, &task, BlockReason::Conflict, "merge conflict")
            .await
            .unwrap();
        assert_eq!(blocked.state, TaskState::Blocked);
        assert_eq!(blocked.block_reason, Some(BlockReason::Conflict));
        assert_eq!(blocked.block_message.as_deref(), Some("merge conflict"));
    }

    #[tokio::test]
    async fn continuation_increments_iteration_and_caps() {
        let fixture = test_store().await;
        let store = &fixture.store;
        let mut t = sample_task("t1");
        t.judgement_feedback.max_iterations = 1;
        let task = store.create_task(t).await.unwrap();

        let judgement = LastJudgement {
            reason: "missing tests".to_string(),
            missing_requirements: vec!["tests".to_string()],
            evaluated_at: chrono::Utc::now(),
        };

        let task = mark_task_for_continuation(&store, &task, judgement.clone())
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::NeedsContinuation);
        assert_eq!(task.judgement_feedback.iteration, 1);

        let result = mark_task_for_continuation(&store, &task, judgement).await;
        assert!(matches!(
            result,
            Err(SchedulerError::MaxIterationsExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn replan_records_lineage_and_clears_owner() {
        let fixture = test_store().await;
        let store = &fixture.store;
        let mut t = sample_task("t1");
        t.owner = Some("slot-0".to_string());
        let task = store.create_task(t).await.unwrap();

        let replaced = mark_task_as_replaced(
            &store,
            &task,
            "acceptance criterion was unreachable as scoped",
            vec!["t1-a".to_string(), "t1-b".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(replaced.state, TaskState::ReplacedByReplan);
        assert!(replaced.owner.is_none());
        let info = replaced.replanning_info.unwrap();
        assert_eq!(info.original_task_id, "t1");
        assert_eq!(info.replaced_by, vec!["t1-a".to_string(), "t1-b".to_string()]);
        assert_eq!(info.iteration, 1);
    }

    #[tokio::test]
    async fn dispatch_order_prefers_fewest_dependents_then_id() {
        let t_a = sample_task("b-task");
        let t_b = sample_task("a-task");
        let ready = vec![t_a, t_b];

        let graph = DependencyGraph::build(vec![
            ("a-task", &[][..]),
            ("b-task", &[][..]),
            ("c-task", &["a-task".to_string()][..]),
        ])
        .unwrap();

        let ordered = dispatch_order(&ready, &graph);
        // Both have zero dependents in this graph's remaining set except
        // a-task has one; tie-break falls to id order for equal counts,
        // but a-task (1 dependent) sorts after b-task (0 dependents).
        assert_eq!(ordered[0].id, "b-task");
        assert_eq!(ordered[1].id, "a-task");
    }
}
