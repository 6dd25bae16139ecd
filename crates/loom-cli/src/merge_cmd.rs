//! `loom merge` command: merge completed task branches into an integration
//! worktree rooted at the base branch.
//!
//! Delegates conflict classification and auto-resolution to
//! [`loom_core::integration::IntegrationEngine`], the same engine the
//! pipeline's Phase D uses -- this command just exposes it standalone, for
//! operators who want to integrate without re-running the whole pipeline.

use anyhow::{Context, Result, bail};
use loom_core::integration::{IntegrationEngine, TaskMergeOutcome};
use loom_core::worktree::WorktreeManager;
use loom_core::EngineConfig;
use loom_store::{CoordinationStore, TaskState};

/// Run the merge command.
pub async fn run_merge(
    store: &CoordinationStore,
    config: &EngineConfig,
    repo_path: &str,
    base_branch: &str,
    dry_run: bool,
) -> Result<()> {
    let worktrees =
        WorktreeManager::new(repo_path, None).context("failed to open worktree manager")?;

    let tasks = store.list_tasks().await?;
    let mut completed: Vec<_> = tasks
        .into_iter()
        .filter(|t| matches!(t.state, TaskState::Done | TaskState::Skipped))
        .collect();
    completed.sort_by(|a, b| a.id.cmp(&b.id));

    if completed.is_empty() {
        println!("No completed tasks to merge.");
        return Ok(());
    }

    println!(
        "Merging {} task branch(es) into {base_branch}",
        completed.len()
    );

    if dry_run {
        for task in &completed {
            println!("  Would merge: {}", task.branch);
        }
        return Ok(());
    }

    let engine = IntegrationEngine::new(&worktrees, &config.integration);
    let integration_branch = format!("loom/integration/{}", CoordinationStore::new_run_id());
    let integration_info = worktrees
        .create_worktree(&integration_branch, base_branch)
        .context("failed to create integration worktree")?;

    let mut merged = 0;
    for task in &completed {
        print!("  Merging {}...", task.branch);
        match engine.merge_task(&integration_info.path, task)? {
            TaskMergeOutcome::Merged { .. } => {
                println!(" ok");
                merged += 1;
            }
            TaskMergeOutcome::Conflicted { files, .. } => {
                println!(" CONFLICT");
                for f in &files {
                    eprintln!("    {} ({:?})", f.path, f.class);
                }
                bail!(
                    "merge conflict on branch {} -- resolve manually in {}",
                    task.branch,
                    integration_info.path.display()
                );
            }
        }
    }

    println!(
        "\nMerge complete: {merged} branch(es) merged into {base_branch} (worktree: {}).",
        integration_info.path.display()
    );

    Ok(())
}
