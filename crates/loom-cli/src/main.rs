mod cleanup_cmd;
mod config;
mod log_cmd;
mod merge_cmd;
mod plan_cmds;
mod run_cmd;
mod status_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};
use loom_store::CoordinationStore;

use config::ResolvedConfig;

#[derive(Parser)]
#[command(name = "loom", about = "Multi-agent coding orchestration engine")]
struct Cli {
    /// Path to the target git repository (overrides LOOM_REPO_PATH and the
    /// current directory)
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter loom.toml in the current directory
    Init {
        /// Overwrite an existing loom.toml
        #[arg(long)]
        force: bool,
    },
    /// Plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Run outstanding tasks to completion
    Run {
        /// Base branch to branch tasks from and integrate into
        #[arg(long, default_value = "main")]
        base: String,
        /// Path to the agent binary to invoke (defaults to `claude` on PATH)
        #[arg(long)]
        agent_binary: Option<String>,
    },
    /// Show task status
    Status {
        /// Task ID to show status for (omit to list all tasks)
        task_id: Option<String>,
    },
    /// Show the run log for a task
    Log {
        /// Task ID to show the run log for
        task_id: String,
    },
    /// Remove worktrees for finished tasks
    Cleanup {
        /// Remove worktrees for all tasks, not just Done/Skipped ones
        #[arg(long)]
        all: bool,
    },
    /// Merge completed task branches into the base branch
    Merge {
        /// Base branch to merge into
        #[arg(long, default_value = "main")]
        base: String,
        /// Show what would be merged without doing it
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Plan tasks from a plaintext instruction file
    Create {
        /// Path to the instruction file
        file: String,
        /// Base branch the Planner should diff against
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// Show task details, or list all tasks
    Show {
        /// Task ID to show (omit to list all)
        task_id: Option<String>,
    },
}

/// Execute `loom init`: write a starter `loom.toml`.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = std::path::Path::new("loom.toml");

    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists.\nUse --force to overwrite.",
            path.display()
        );
    }

    #[derive(serde::Serialize)]
    struct LoomTomlOut {
        engine: loom_core::EngineConfig,
    }
    let contents = toml::to_string_pretty(&LoomTomlOut {
        engine: loom_core::EngineConfig::default(),
    })
    .context("failed to serialize default engine config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("Wrote {}", path.display());
    println!("Next: run `loom plan create <instruction-file>` to generate tasks.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return cmd_init(force);
    }

    let resolved = ResolvedConfig::resolve(cli.repo.as_deref())?;
    let repo_path = resolved
        .repo_path
        .to_str()
        .context("repo path is not valid UTF-8")?
        .to_string();
    let store = CoordinationStore::open(resolved.coordination)
        .await
        .context("failed to open coordination store")?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Plan { command } => {
            plan_cmds::run_plan_command(command, &store, &resolved.engine, &repo_path).await?;
        }
        Commands::Run { base, agent_binary } => {
            run_cmd::run_pipeline(
                &store,
                &resolved.engine,
                &repo_path,
                &base,
                agent_binary.as_deref(),
            )
            .await?;
        }
        Commands::Status { task_id } => {
            status_cmd::run_status(&store, task_id.as_deref()).await?;
        }
        Commands::Log { task_id } => {
            log_cmd::run_log(&store, &task_id).await?;
        }
        Commands::Cleanup { all } => {
            cleanup_cmd::run_cleanup(&store, &repo_path, all).await?;
        }
        Commands::Merge { base, dry_run } => {
            merge_cmd::run_merge(&store, &resolved.engine, &repo_path, &base, dry_run).await?;
        }
    }

    Ok(())
}
