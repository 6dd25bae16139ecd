//! `loom plan` subcommands.
//!
//! - `loom plan create <file>` -- plan tasks from a plaintext instruction
//! - `loom plan show [task-id]` -- show task details, or list all tasks

use anyhow::{Context, Result};
use loom_core::agent::ProcessAgentRunner;
use loom_core::planner::Planner;
use loom_core::EngineConfig;
use loom_store::CoordinationStore;

use crate::PlanCommands;

pub async fn run_plan_command(
    command: PlanCommands,
    store: &CoordinationStore,
    config: &EngineConfig,
    repo_path: &str,
) -> Result<()> {
    match command {
        PlanCommands::Create { file, base_branch } => {
            cmd_create(store, config, repo_path, &file, &base_branch).await
        }
        PlanCommands::Show { task_id } => match task_id {
            Some(id) => cmd_show_one(store, &id).await,
            None => cmd_show_all(store).await,
        },
    }
}

async fn cmd_create(
    store: &CoordinationStore,
    config: &EngineConfig,
    repo_path: &str,
    file_path: &str,
    base_branch: &str,
) -> Result<()> {
    let instruction = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read instruction file: {file_path}"))?;

    let runner = ProcessAgentRunner::new();
    let planner = Planner::new(store, &runner, config, repo_path, base_branch);

    let result = planner
        .plan_tasks(instruction.trim())
        .await
        .context("planning failed")?;

    println!("Plan generated.");
    println!();
    println!("  Session ID: {}", result.session_id);
    println!("  Tasks:      {}", result.task_ids.len());
    for id in &result.task_ids {
        println!("    - {id}");
    }

    Ok(())
}

async fn cmd_show_all(store: &CoordinationStore) -> Result<()> {
    let tasks = store.list_tasks().await?;

    if tasks.is_empty() {
        println!("No tasks found. Use `loom plan create <file>` to generate some.");
        return Ok(());
    }

    let id_w = tasks.iter().map(|t| t.id.len()).max().unwrap_or(2).max(2);
    println!("{:<id_w$}  {:<12}  ACCEPTANCE", "ID", "STATE");
    for task in &tasks {
        println!(
            "{:<id_w$}  {:<12}  {}",
            task.id,
            task.state.to_string(),
            truncate(&task.acceptance, 60)
        );
    }

    Ok(())
}

async fn cmd_show_one(store: &CoordinationStore, task_id: &str) -> Result<()> {
    let task = store
        .read_task(task_id)
        .await
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {}", task.id);
    println!("  State:        {}", task.state);
    println!("  Type:         {:?}", task.task_type);
    println!("  Branch:       {}", task.branch);
    println!("  Acceptance:   {}", task.acceptance);
    if !task.dependencies.is_empty() {
        println!("  Dependencies: {}", task.dependencies.join(", "));
    }
    if let Some(reason) = &task.block_message {
        println!("  Block reason: {reason}");
    }
    if !task.context.is_empty() {
        println!("  Context:");
        for line in task.context.lines() {
            println!("    {line}");
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_len {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(max_len).collect();
        format!("{truncated}...")
    }
}
