//! `loom log` command: show a task's latest run and its log file.

use anyhow::{Context, Result};
use loom_store::CoordinationStore;

/// Run the log command.
pub async fn run_log(store: &CoordinationStore, task_id: &str) -> Result<()> {
    let task = store
        .read_task(task_id)
        .await
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {}", task.id);
    println!("State: {}", task.state);

    let Some(run_id) = &task.latest_run_id else {
        println!("\nNo runs recorded yet.");
        return Ok(());
    };

    let run = store
        .read_run(run_id)
        .await
        .with_context(|| format!("run {run_id} not found"))?;

    println!();
    println!("Run: {}", run.id);
    println!("  Agent:   {}", run.agent_type);
    println!("  Status:  {:?}", run.status);
    println!(
        "  Started: {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(finished_at) = run.finished_at {
        println!(
            "  Finished: {}",
            finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(err) = &run.error_message {
        println!("  Error: {err}");
    }
    println!();

    let log_path = store.run_log_path(&run.id);
    match std::fs::read_to_string(&log_path) {
        Ok(contents) => {
            println!("--- log ({}) ---", log_path.display());
            print!("{contents}");
        }
        Err(e) => {
            println!("(failed to read log at {}: {e})", log_path.display());
        }
    }

    Ok(())
}
