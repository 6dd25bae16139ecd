//! Core orchestration engine: dependency graph, scheduler, agent runner,
//! git worktree management, Worker/Judge/Planner agent roles, the
//! integration engine, and the execution pipeline that ties them together.

pub mod agent;
pub mod config;
pub mod graph;
pub mod integration;
pub mod judge;
pub mod pipeline;
pub mod planner;
pub mod scheduler;
pub mod worker;
pub mod worktree;

pub use agent::{
    AgentError, AgentRequest, AgentRole, AgentRunResult, AgentRunner, FakeAgentRunner,
    ProcessAgentRunner, RunMetadata,
};
pub use config::EngineConfig;
pub use graph::{DependencyGraph, GraphError};
pub use integration::{ConflictClass, ConflictedFile, IntegrationEngine, IntegrationError, TaskMergeOutcome};
pub use judge::{ImpliedTransition, Judge, JudgeError, JudgeOutcome};
pub use pipeline::{Pipeline, PipelineError, PipelineResult};
pub use planner::{Planner, PlannerError, PlanResult};
pub use scheduler::SchedulerError;
pub use worker::{FailureClass, Worker, WorkerError, WorkerOutcome};
pub use worktree::{MergeOptions, MergeResult, MergeStrategy, WorktreeError, WorktreeInfo, WorktreeManager};
