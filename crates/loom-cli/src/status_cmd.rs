//! `loom status` command: show task progress.

use anyhow::{Context, Result};
use loom_store::{CoordinationStore, TaskState};

/// Run the status command.
///
/// When `task_id` is `Some`, shows detailed status for that task. When
/// `None`, lists every task with a one-line summary.
pub async fn run_status(store: &CoordinationStore, task_id: Option<&str>) -> Result<()> {
    match task_id {
        Some(id) => run_task_status(store, id).await,
        None => run_fleet_status(store).await,
    }
}

async fn run_task_status(store: &CoordinationStore, task_id: &str) -> Result<()> {
    let task = store
        .read_task(task_id)
        .await
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {}", task.id);
    println!("State: {}", task.state);
    println!("Version: {}", task.version);
    println!("Branch: {}", task.branch);
    if let Some(owner) = &task.owner {
        println!("Owner: {owner}");
    }
    if let Some(run_id) = &task.latest_run_id {
        println!("Latest run: {run_id}");
    }
    if let Some(reason) = &task.block_reason {
        println!("Block reason: {reason:?}");
    }
    if let Some(message) = &task.block_message {
        println!("Block message: {message}");
    }
    if !task.dependencies.is_empty() {
        println!("Dependencies: {}", task.dependencies.join(", "));
    }

    Ok(())
}

async fn run_fleet_status(store: &CoordinationStore) -> Result<()> {
    let tasks = store.list_tasks().await?;

    if tasks.is_empty() {
        println!("No tasks found. Use `loom plan create <file>` to generate some.");
        return Ok(());
    }

    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for task in &tasks {
        *counts.entry(task.state.to_string()).or_default() += 1;
    }
    print!("Progress: ");
    println!(
        "{}",
        counts
            .iter()
            .map(|(state, n)| format!("{state}={n}"))
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!();

    let id_w = tasks.iter().map(|t| t.id.len()).max().unwrap_or(2).max(2);
    println!("{:<id_w$}  {:<14}  BRANCH", "ID", "STATE");
    for task in &tasks {
        let icon = state_icon(&task.state);
        println!(
            "[{icon}] {:<id_w$}  {:<14}  {}",
            task.id,
            task.state.to_string(),
            task.branch
        );
    }

    Ok(())
}

fn state_icon(state: &TaskState) -> char {
    match state {
        TaskState::Ready => '.',
        TaskState::Running => '*',
        TaskState::NeedsContinuation => '~',
        TaskState::Done => '+',
        TaskState::Skipped => 's',
        TaskState::Blocked => 'X',
        TaskState::Cancelled => 'c',
        TaskState::ReplacedByReplan => 'r',
    }
}
