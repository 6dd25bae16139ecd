//! Filesystem-backed coordination store for task, run, and planner-session
//! documents.
//!
//! Collections live under a configurable coordination directory (spec §4.1,
//! §9): each document is a JSON file, written atomically via a temp file plus
//! rename, and task updates use an optimistic `version` field to detect
//! concurrent writers.

mod config;
mod error;
mod models;
mod store;

pub use config::CoordinationConfig;
pub use error::StoreError;
pub use models::{
    BlockReason, FinalJudgement, JudgementFeedback, LastJudgement, PendingConflictResolution,
    PlannerSession, ReplanningInfo, Run, RunStatus, Task, TaskState, TaskType,
};
pub use store::CoordinationStore;
