use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Ready,
    Running,
    NeedsContinuation,
    Done,
    Skipped,
    Blocked,
    Cancelled,
    ReplacedByReplan,
}

impl TaskState {
    /// Whether a task in this state is eligible to be claimed by the scheduler.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Ready | Self::NeedsContinuation)
    }

    /// Whether this state satisfies a dependent's readiness predicate.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    /// Whether this state is terminal (no further transitions expected).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Skipped | Self::Blocked | Self::Cancelled | Self::ReplacedByReplan
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::NeedsContinuation => "needs_continuation",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::ReplacedByReplan => "replaced_by_replan",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "needs_continuation" => Ok(Self::NeedsContinuation),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            "replaced_by_replan" => Ok(Self::ReplacedByReplan),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Implementation,
    Documentation,
    Investigation,
    Integration,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Implementation => "implementation",
            Self::Documentation => "documentation",
            Self::Investigation => "investigation",
            Self::Integration => "integration",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implementation" => Ok(Self::Implementation),
            "documentation" => Ok(Self::Documentation),
            "investigation" => Ok(Self::Investigation),
            "integration" => Ok(Self::Integration),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Discriminator recorded when a task transitions to [`TaskState::Blocked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    SystemErrorTransient,
    Conflict,
    MaxRetries,
    MaxRetriesIntegration,
    Cancelled,
    Cycle,
    Unknown,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SystemErrorTransient => "system_error_transient",
            Self::Conflict => "conflict",
            Self::MaxRetries => "max_retries",
            Self::MaxRetriesIntegration => "max_retries_integration",
            Self::Cancelled => "cancelled",
            Self::Cycle => "cycle",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for BlockReason {
    type Err = BlockReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system_error_transient" => Ok(Self::SystemErrorTransient),
            "conflict" => Ok(Self::Conflict),
            "max_retries" => Ok(Self::MaxRetries),
            "max_retries_integration" => Ok(Self::MaxRetriesIntegration),
            "cancelled" => Ok(Self::Cancelled),
            "cycle" => Ok(Self::Cycle),
            "unknown" => Ok(Self::Unknown),
            other => Err(BlockReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BlockReason`] string.
#[derive(Debug, Clone)]
pub struct BlockReasonParseError(pub String);

impl fmt::Display for BlockReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid block reason: {:?}", self.0)
    }
}

impl std::error::Error for BlockReasonParseError {}

// ---------------------------------------------------------------------------

/// Status of a single execution attempt ([`Run`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// The judgement recorded from the most recent Judge evaluation of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastJudgement {
    pub reason: String,
    pub missing_requirements: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Cumulative continuation state for a task across Judge evaluations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JudgementFeedback {
    /// Number of continuation retries scheduled so far (pre-increment
    /// convention: `iteration=k` means k retries have already been
    /// scheduled; a fresh task starts at 0).
    pub iteration: u32,
    pub max_iterations: u32,
    pub last_judgement: Option<LastJudgement>,
}

impl Default for JudgementFeedback {
    fn default() -> Self {
        Self {
            iteration: 0,
            max_iterations: 3,
            last_judgement: None,
        }
    }
}

/// Replan lineage recorded when a task is replaced by a Planner-generated
/// replacement subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplanningInfo {
    pub iteration: u32,
    pub max_iterations: u32,
    pub original_task_id: String,
    pub replaced_by: Vec<String>,
    pub replan_reason: String,
}

/// Detail attached to a task blocked with [`BlockReason::Conflict`]: which
/// files collided during base resolution, and the git output describing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingConflictResolution {
    pub conflicting_files: Vec<String>,
    pub details: String,
}

/// A unit of work, executed in an isolated worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: String,
    pub state: TaskState,
    /// Monotonically increasing; incremented on every persisted mutation.
    pub version: u64,
    pub owner: Option<String>,
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub scope_paths: Vec<String>,
    pub acceptance: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub root_session_id: String,
    pub latest_run_id: Option<String>,
    #[serde(default)]
    pub judgement_feedback: JudgementFeedback,
    pub block_reason: Option<BlockReason>,
    pub block_message: Option<String>,
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub integration_retried: bool,
    pub base_commit: Option<String>,
    pub replanning_info: Option<ReplanningInfo>,
    #[serde(default)]
    pub pending_conflict_resolution: Option<PendingConflictResolution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Construct a fresh, unscheduled task. `version` starts at 0; the store
    /// assigns 1 on the first persisted write.
    pub fn new(
        id: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        acceptance: impl Into<String>,
        task_type: TaskType,
        session_id: impl Into<String>,
        root_session_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let session_id = session_id.into();
        Self {
            id: id.into(),
            state: TaskState::Ready,
            version: 0,
            owner: None,
            repo: repo.into(),
            branch: branch.into(),
            scope_paths: Vec::new(),
            acceptance: acceptance.into(),
            task_type,
            context: String::new(),
            dependencies: Vec::new(),
            session_id: session_id.clone(),
            parent_session_id: None,
            root_session_id: root_session_id.into(),
            latest_run_id: None,
            judgement_feedback: JudgementFeedback::default(),
            block_reason: None,
            block_message: None,
            skip_reason: None,
            integration_retried: false,
            base_commit: None,
            replanning_info: None,
            pending_conflict_resolution: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One execution attempt of one task by one worker. Immutable after
/// `finished_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub agent_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: String,
    pub session_id: String,
    pub error_message: Option<String>,
}

/// The outcome of the Planner's final-completion judgement for a planning
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalJudgement {
    pub is_complete: bool,
    pub missing_aspects: Vec<String>,
    pub additional_task_suggestions: Vec<String>,
    pub completion_score: Option<f32>,
    pub evaluated_at: DateTime<Utc>,
}

/// One planning lifecycle: created by the Planner, mutated by subsequent
/// additional-task generations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerSession {
    pub session_id: String,
    pub instruction: String,
    #[serde(default)]
    pub conversation_history: Vec<String>,
    #[serde(default)]
    pub generated_tasks: Vec<String>,
    pub planner_log_path: String,
    pub planner_metadata_path: String,
    #[serde(default)]
    pub continue_iteration_count: u32,
    pub final_judgement: Option<FinalJudgement>,
}

impl PlannerSession {
    pub fn new(session_id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            instruction: instruction.into(),
            conversation_history: Vec::new(),
            generated_tasks: Vec::new(),
            planner_log_path: String::new(),
            planner_metadata_path: String::new(),
            continue_iteration_count: 0,
            final_judgement: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_display_roundtrip() {
        let variants = [
            TaskState::Ready,
            TaskState::Running,
            TaskState::NeedsContinuation,
            TaskState::Done,
            TaskState::Skipped,
            TaskState::Blocked,
            TaskState::Cancelled,
            TaskState::ReplacedByReplan,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_state_invalid() {
        assert!("bogus".parse::<TaskState>().is_err());
    }

    #[test]
    fn task_state_claimable_set() {
        assert!(TaskState::Ready.is_claimable());
        assert!(TaskState::NeedsContinuation.is_claimable());
        assert!(!TaskState::Running.is_claimable());
        assert!(!TaskState::Done.is_claimable());
    }

    #[test]
    fn task_state_dependency_satisfaction() {
        assert!(TaskState::Done.satisfies_dependency());
        assert!(TaskState::Skipped.satisfies_dependency());
        assert!(!TaskState::Running.satisfies_dependency());
        assert!(!TaskState::Blocked.satisfies_dependency());
    }

    #[test]
    fn task_type_display_roundtrip() {
        let variants = [
            TaskType::Implementation,
            TaskType::Documentation,
            TaskType::Investigation,
            TaskType::Integration,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn block_reason_display_roundtrip() {
        let variants = [
            BlockReason::SystemErrorTransient,
            BlockReason::Conflict,
            BlockReason::MaxRetries,
            BlockReason::MaxRetriesIntegration,
            BlockReason::Cancelled,
            BlockReason::Cycle,
            BlockReason::Unknown,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BlockReason = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_display_roundtrip() {
        let variants = [RunStatus::Running, RunStatus::Success, RunStatus::Failed];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_roundtrips_through_json() {
        let task = Task::new(
            "sess-abc-t1",
            "/repo",
            "loom/sess-abc/t1",
            "adds a thing",
            TaskType::Implementation,
            "sess-abc",
            "sess-abc",
        );
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task.id, back.id);
        assert_eq!(task.state, back.state);
        assert_eq!(task.judgement_feedback, back.judgement_feedback);
    }

    #[test]
    fn planner_session_roundtrips_through_json() {
        let session = PlannerSession::new("sess-abc", "do the thing");
        let json = serde_json::to_string(&session).unwrap();
        let back: PlannerSession = serde_json::from_str(&json).unwrap();
        assert_eq!(session.session_id, back.session_id);
        assert_eq!(session.continue_iteration_count, back.continue_iteration_count);
    }
}
