//! `loom run` command: run every outstanding task to completion via the
//! execution pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use loom_core::agent::ProcessAgentRunner;
use loom_core::pipeline::Pipeline;
use loom_core::worktree::WorktreeManager;
use loom_core::EngineConfig;
use loom_store::CoordinationStore;
use tokio_util::sync::CancellationToken;

/// Run every outstanding task in `store` to completion.
pub async fn run_pipeline(
    store: &CoordinationStore,
    config: &EngineConfig,
    repo_path: &str,
    base_branch: &str,
    agent_binary: Option<&str>,
) -> Result<()> {
    let worktrees = WorktreeManager::new(repo_path, None)
        .with_context(|| format!("{repo_path} is not a git repository"))?;

    let runner = match agent_binary {
        Some(path) => ProcessAgentRunner::with_binary(path),
        None => ProcessAgentRunner::new(),
    };

    println!("Running pipeline in {repo_path} (base branch: {base_branch})");
    println!("  Max workers: {}", config.max_workers);

    // Set up graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                // Second signal: force exit.
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let pipeline = Pipeline::new(store, &worktrees, &runner, config, base_branch);
    let result = pipeline.run(cancel).await?;

    println!();
    println!(
        "Completed: {}  Failed: {}  Blocked: {}",
        result.completed_task_ids.len(),
        result.failed_task_ids.len(),
        result.blocked_task_ids.len()
    );

    if !result.success() {
        if !result.failed_task_ids.is_empty() {
            println!("Failed tasks:");
            for id in &result.failed_task_ids {
                println!("  - {id}");
            }
        }
        if !result.blocked_task_ids.is_empty() {
            println!("Blocked tasks:");
            for id in &result.blocked_task_ids {
                println!("  - {id}");
            }
        }
        std::process::exit(1);
    }

    println!("All tasks completed successfully.");
    Ok(())
}
