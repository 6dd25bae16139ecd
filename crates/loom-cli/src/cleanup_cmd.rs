//! `loom cleanup` command: remove worktrees for finished tasks.

use anyhow::{Context, Result};
use loom_core::worktree::WorktreeManager;
use loom_store::{CoordinationStore, TaskState};

/// Run the cleanup command.
pub async fn run_cleanup(store: &CoordinationStore, repo_path: &str, all: bool) -> Result<()> {
    let worktree_manager =
        WorktreeManager::new(repo_path, None).context("failed to open worktree manager")?;

    let tasks = store.list_tasks().await?;

    let mut removed = 0;
    let mut skipped = 0;

    for task in &tasks {
        let eligible = all || matches!(task.state, TaskState::Done | TaskState::Skipped);

        if !eligible {
            skipped += 1;
            continue;
        }

        let branch = WorktreeManager::branch_name(&task.session_id, &task.id);
        let dir_name = branch.replace('/', "--");
        let path = worktree_manager.worktree_base().join(&dir_name);

        if !path.exists() {
            continue;
        }

        match worktree_manager.remove_worktree(&path) {
            Ok(()) => {
                println!("  Removed: {} ({})", task.id, path.display());
                removed += 1;
            }
            Err(e) => {
                eprintln!("  Warning: failed to remove worktree for {}: {e}", task.id);
            }
        }
    }

    let _ = worktree_manager.prune();

    println!("\nCleanup complete: {removed} worktree(s) removed, {skipped} skipped.");

    Ok(())
}
