//! Planner operations (spec §4.8): `planTasks`, `planAdditionalTasks`,
//! `judgeFinalCompletionWithContext`.
//!
//! The prompt-construction shape (schema reference + guidelines +
//! project context, assembled in a `String::with_capacity` builder) is
//! grounded in the teacher's [`crate::plan::generate::build_system_prompt`];
//! the quality-threshold retry loop and task-document materialization are
//! new, generalizing the teacher's single-pass plan-TOML generation into
//! the spec's self-evaluating loop over `loom_store::Task` documents
//! directly (no intermediate TOML file).

use loom_store::{CoordinationStore, FinalJudgement, StoreError, Task, TaskType};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentError, AgentRequest, AgentRole, AgentRunner};
use crate::config::EngineConfig;
use crate::worktree::WorktreeManager;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("planner reply failed to parse as JSON after {attempts} attempts: {last_error}")]
    ParseExhausted { attempts: u32, last_error: String },

    #[error("planner produced {count} tasks, exceeding max_tasks={max}")]
    TooManyTasks { count: usize, max: u32 },

    #[error("task {task_id} estimated at {hours}h exceeds max_task_duration={max}h")]
    TaskDurationExceeded { task_id: String, hours: f32, max: u32 },

    #[error("task {task_id}'s context does not quote a concrete repository symbol (strict_context_validation)")]
    MissingContextSymbol { task_id: String },

    #[error("unknown task_type {0:?} in planner reply")]
    UnknownTaskType(String),

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}

#[derive(Debug, Clone)]
pub struct PlanResult {
    pub task_ids: Vec<String>,
    pub run_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedTaskJson {
    id: String,
    acceptance: String,
    task_type: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    scope_paths: Vec<String>,
    #[serde(default)]
    estimated_hours: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannerReply {
    tasks: Vec<GeneratedTaskJson>,
    quality_score: u32,
    #[serde(default)]
    quality_reasoning: String,
    /// Ids of prior BLOCKED tasks the Planner chose to rerun against the
    /// integration branch instead of replacing with new tasks (spec §4.8).
    #[serde(default)]
    retry_task_ids: Vec<String>,
}

/// Result of [`Planner::plan_additional_tasks`]: net-new tasks materialized,
/// and prior BLOCKED tasks the Planner selected for retry from the
/// integration branch (`integrationRetried=true`) rather than duplication.
#[derive(Debug, Clone, Default)]
pub struct AdditionalTasksResult {
    pub new_task_ids: Vec<String>,
    pub retried_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalJudgementJson {
    is_complete: bool,
    #[serde(default)]
    missing_aspects: Vec<String>,
    #[serde(default)]
    additional_task_suggestions: Vec<String>,
    #[serde(default)]
    completion_score: Option<f32>,
}

pub struct Planner<'a> {
    store: &'a CoordinationStore,
    agent_runner: &'a dyn AgentRunner,
    config: &'a EngineConfig,
    repo: String,
    base_branch: String,
}

impl<'a> Planner<'a> {
    pub fn new(
        store: &'a CoordinationStore,
        agent_runner: &'a dyn AgentRunner,
        config: &'a EngineConfig,
        repo: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent_runner,
            config,
            repo: repo.into(),
            base_branch: base_branch.into(),
        }
    }

    pub async fn plan_tasks(&self, instruction: &str) -> Result<PlanResult, PlannerError> {
        let session_id = CoordinationStore::new_session_id();
        let prompt = self.build_prompt(instruction, None);

        let (reply, run_id) = self.run_quality_loop(&prompt, &session_id).await?;
        let task_ids = self
            .materialize_tasks(&reply.tasks, &session_id, &session_id, None)
            .await?;

        let mut session = loom_store::PlannerSession::new(session_id.clone(), instruction.to_string());
        session.generated_tasks = task_ids.clone();
        session.planner_log_path = self.store.run_log_path(&run_id).to_string_lossy().to_string();
        self.store.write_planner_session(&session).await?;
        self.store.advance_session_pointer(&session_id).await?;

        info!(session_id = %session_id, tasks = task_ids.len(), "plan generated");

        Ok(PlanResult {
            task_ids,
            run_id,
            session_id,
        })
    }

    pub async fn plan_additional_tasks(
        &self,
        session_id: &str,
        missing_aspects: &[String],
    ) -> Result<AdditionalTasksResult, PlannerError> {
        let mut session = self.store.read_planner_session(session_id).await?;

        let blocked: Vec<Task> = self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.state == loom_store::TaskState::Blocked && session.generated_tasks.contains(&t.id))
            .collect();

        let prompt = self.build_additional_prompt(&session.instruction, missing_aspects, &blocked);
        let (reply, run_id) = self.run_quality_loop(&prompt, session_id).await?;

        let task_ids = self
            .materialize_tasks(&reply.tasks, session_id, session_id, Some(session_id))
            .await?;

        let mut retried_task_ids = Vec::new();
        for id in &reply.retry_task_ids {
            match self.store.read_task(id).await {
                Ok(task) if task.state == loom_store::TaskState::Blocked => {
                    crate::scheduler::retry_task_from_integration(self.store, &task).await?;
                    retried_task_ids.push(id.clone());
                }
                Ok(task) => {
                    warn!(task_id = %id, state = ?task.state, "planner requested retry of a non-blocked task, ignoring");
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "planner requested retry of an unknown task, ignoring");
                }
            }
        }

        session.generated_tasks.extend(task_ids.clone());
        session.continue_iteration_count += 1;
        session.planner_log_path = self.store.run_log_path(&run_id).to_string_lossy().to_string();
        self.store.write_planner_session(&session).await?;

        Ok(AdditionalTasksResult {
            new_task_ids: task_ids,
            retried_task_ids,
        })
    }

    pub async fn judge_final_completion_with_context(
        &self,
        instruction: &str,
        completed_descriptions: &[String],
        failed_descriptions: &[String],
        run_summaries: &[String],
        code_diff: &str,
    ) -> Result<FinalJudgement, PlannerError> {
        let prompt = format!(
            "Instruction:\n{instruction}\n\n\
             Completed tasks:\n{completed}\n\n\
             Failed/blocked tasks:\n{failed}\n\n\
             Run summaries:\n{summaries}\n\n\
             Code diff:\n{diff}\n\n\
             Has the instruction been fully satisfied? Reply with a single JSON object: \
             {{\"isComplete\": bool, \"missingAspects\": [string], \
             \"additionalTaskSuggestions\": [string], \"completionScore\": number|null}}.",
            completed = completed_descriptions.join("\n"),
            failed = failed_descriptions.join("\n"),
            summaries = run_summaries.join("\n"),
            diff = truncate_snippet(code_diff, 8192),
        );

        let agent_cfg = &self.config.agents.planner;
        let run_id = CoordinationStore::new_run_id();
        let request = AgentRequest {
            role: AgentRole::Planner,
            agent_type: agent_cfg.agent_type.clone(),
            model: agent_cfg.model.clone(),
            prompt,
            working_dir: std::path::PathBuf::from(&self.repo),
            session_id: None,
            log_path: self.store.run_log_path(&run_id),
            metadata_path: self.store.config().runs_dir().join(format!("{run_id}.meta.json")),
            timeout: std::time::Duration::from_secs(600),
            env_vars: Default::default(),
        };

        let result = self.agent_runner.run_agent(request).await?;
        let parsed: FinalJudgementJson = parse_json_object(&result.final_response)
            .map_err(|e| PlannerError::ParseExhausted { attempts: 1, last_error: e })?;

        Ok(FinalJudgement {
            is_complete: parsed.is_complete,
            missing_aspects: parsed.missing_aspects,
            additional_task_suggestions: parsed.additional_task_suggestions,
            completion_score: parsed.completion_score,
            evaluated_at: chrono::Utc::now(),
        })
    }

    async fn run_quality_loop(
        &self,
        base_prompt: &str,
        session_id: &str,
    ) -> Result<(PlannerReply, String), PlannerError> {
        let agent_cfg = &self.config.agents.planner;
        let mut prompt = base_prompt.to_string();
        let mut last_error = String::new();
        let max_attempts = self.config.iterations.planner_quality_retries.max(1);

        for attempt in 0..max_attempts {
            let run_id = CoordinationStore::new_run_id();
            let request = AgentRequest {
                role: AgentRole::Planner,
                agent_type: agent_cfg.agent_type.clone(),
                model: agent_cfg.model.clone(),
                prompt: prompt.clone(),
                working_dir: std::path::PathBuf::from(&self.repo),
                session_id: Some(session_id.to_string()),
                log_path: self.store.run_log_path(&run_id),
                metadata_path: self.store.config().runs_dir().join(format!("{run_id}.meta.json")),
                timeout: std::time::Duration::from_secs(1800),
                env_vars: Default::default(),
            };

            let result = self.agent_runner.run_agent(request).await?;
            match parse_json_object::<PlannerReply>(&result.final_response) {
                Ok(reply) => {
                    if reply.quality_score >= self.config.planning.quality_threshold {
                        return Ok((reply, run_id));
                    }
                    warn!(
                        session_id,
                        attempt,
                        score = reply.quality_score,
                        threshold = self.config.planning.quality_threshold,
                        "plan below quality threshold, re-prompting"
                    );
                    prompt = format!(
                        "{base_prompt}\n\n\
                         Your previous attempt scored {score}/100 \
                         (threshold {threshold}): {reasoning}\n\
                         Revise the plan to address this feedback.",
                        score = reply.quality_score,
                        threshold = self.config.planning.quality_threshold,
                        reasoning = reply.quality_reasoning,
                    );
                    if attempt + 1 == max_attempts {
                        return Ok((reply, run_id));
                    }
                }
                Err(e) => {
                    warn!(session_id, attempt, error = %e, "planner reply failed to parse, retrying");
                    last_error = e;
                }
            }
        }

        Err(PlannerError::ParseExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn materialize_tasks(
        &self,
        generated: &[GeneratedTaskJson],
        session_id: &str,
        root_session_id: &str,
        parent_session_id: Option<&str>,
    ) -> Result<Vec<String>, PlannerError> {
        if generated.len() > self.config.planning.max_tasks as usize {
            return Err(PlannerError::TooManyTasks {
                count: generated.len(),
                max: self.config.planning.max_tasks,
            });
        }

        let mut task_ids = Vec::with_capacity(generated.len());
        for g in generated {
            if g.estimated_hours > self.config.planning.max_task_duration as f32 {
                return Err(PlannerError::TaskDurationExceeded {
                    task_id: g.id.clone(),
                    hours: g.estimated_hours,
                    max: self.config.planning.max_task_duration,
                });
            }
            if self.config.planning.strict_context_validation && !quotes_concrete_symbol(&g.context) {
                return Err(PlannerError::MissingContextSymbol {
                    task_id: g.id.clone(),
                });
            }

            let task_type = g
                .task_type
                .parse::<TaskType>()
                .map_err(|_| PlannerError::UnknownTaskType(g.task_type.clone()))?;

            let branch = WorktreeManager::branch_name(session_id, &g.id);
            let mut task = Task::new(
                g.id.clone(),
                self.repo.clone(),
                branch,
                g.acceptance.clone(),
                task_type,
                session_id,
                root_session_id,
            );
            task.context = g.context.clone();
            task.dependencies = g.dependencies.clone();
            task.scope_paths = g.scope_paths.clone();
            task.parent_session_id = parent_session_id.map(str::to_string);

            let created = self.store.create_task(task).await?;
            task_ids.push(created.id);
        }

        Ok(task_ids)
    }

    fn build_prompt(&self, instruction: &str, prior_context: Option<&str>) -> String {
        let mut prompt = String::with_capacity(2048);
        prompt.push_str(
            "You are a task planner for an autonomous coding engine. \
             Decompose the instruction below into a dependency-ordered set of \
             independently executable tasks.\n\n",
        );
        prompt.push_str(&format!("Instruction:\n{instruction}\n\n"));
        if let Some(ctx) = prior_context {
            prompt.push_str(&format!("Prior planning context:\n{ctx}\n\n"));
        }
        prompt.push_str(&format!("Base branch: {}\n\n", self.base_branch));
        prompt.push_str(SCHEMA_REFERENCE);
        prompt.push_str(DECOMPOSITION_GUIDELINES);
        prompt.push_str(&format!(
            "\nConstraints: at most {max_tasks} tasks, each estimated at no more than \
             {max_hours} hours.\n",
            max_tasks = self.config.planning.max_tasks,
            max_hours = self.config.planning.max_task_duration,
        ));
        if self.config.planning.strict_context_validation {
            prompt.push_str(
                "Every task's `context` field must quote a concrete symbol from this \
                 repository (a backtick-quoted file path, function, or type name) -- \
                 no purely external references.\n",
            );
        }
        prompt.push_str(
            "\nSelf-evaluate your plan's quality (0-100) against: clarity of acceptance \
             criteria, correctness of the dependency graph, and whether tasks are narrowly \
             scoped. Reply with a single JSON object: \
             {\"tasks\": [{\"id\": string, \"acceptance\": string, \"taskType\": \
             \"implementation\"|\"documentation\"|\"investigation\"|\"integration\", \
             \"context\": string, \"dependencies\": [string], \"scopePaths\": [string], \
             \"estimatedHours\": number}], \"qualityScore\": number, \"qualityReasoning\": string, \
             \"retryTaskIds\": [string]}. `retryTaskIds` is empty unless you were shown a list \
             of previously blocked tasks to consider rerunning.",
        );
        prompt
    }

    fn build_additional_prompt(&self, instruction: &str, missing_aspects: &[String], blocked: &[Task]) -> String {
        let mut context = format!("Missing aspects from the prior round:\n- {}", missing_aspects.join("\n- "));
        if !blocked.is_empty() {
            let blocked_list = blocked
                .iter()
                .map(|t| format!("{} ({}): {}", t.id, t.block_reason.map(|r| r.to_string()).unwrap_or_default(), t.block_message.clone().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join("\n- ");
            context.push_str(&format!(
                "\n\nPreviously blocked tasks (rerun instead of duplicating if the blocker is \
                 now resolved by setting `retryTaskIds`):\n- {blocked_list}"
            ));
        }
        self.build_prompt(instruction, Some(&context))
    }
}

const SCHEMA_REFERENCE: &str = "## Task Schema\n\nEach task has an `id` (kebab-case), `acceptance` criterion, `taskType`, \
`context` (what the agent needs to know), `dependencies` (other task ids), \
`scopePaths` (files/directories the agent should limit itself to), and an \
`estimatedHours` duration.\n\n";

const DECOMPOSITION_GUIDELINES: &str = "## Decomposition Guidelines\n\n\
1. Prefer narrow tasks touching as few files as possible.\n\
2. Define shared types first; make tasks that use them depend on it.\n\
3. Maximize parallelism -- tasks without dependencies run concurrently.\n\
4. Diamond DAGs are good: one setup task, N parallel tasks, one integration task.\n\
5. Write thorough `context` fields -- the agent sees only this plus the repository.\n\n";

fn quotes_concrete_symbol(context: &str) -> bool {
    let mut chars = context.chars();
    while let Some(c) = chars.by_ref().find(|&c| c == '`') {
        let _ = c;
        let rest: String = chars.clone().take_while(|&c| c != '`').collect();
        if !rest.trim().is_empty() {
            return true;
        }
    }
    false
}

fn parse_json_object<T: serde::de::DeserializeOwned>(response: &str) -> Result<T, String> {
    let start = response.find('{').ok_or("no JSON object found in planner reply")?;
    let end = response.rfind('}').ok_or("no closing brace found in planner reply")?;
    if end < start {
        return Err("malformed JSON object in planner reply".to_string());
    }
    serde_json::from_str(&response[start..=end]).map_err(|e| e.to_string())
}

fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}
