//! Filesystem-backed coordination store.
//!
//! Tasks, Runs and PlannerSessions are each a directory of JSON documents
//! keyed by id. Writes go through a temp file in the same directory, fsynced,
//! then renamed into place, so a reader never observes a half-written
//! document (spec §9, "Filesystem as a database").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::error::StoreError;
use crate::models::{PlannerSession, Run, Task};

/// A document store keyed by id, with three collections: tasks, runs,
/// planner-sessions (spec §4.1).
#[derive(Debug, Clone)]
pub struct CoordinationStore {
    config: CoordinationConfig,
    /// Per-task-id locks serializing `update_task_cas`'s read-check-write
    /// sequence. The teacher enforces CAS via Postgres's row-level atomic
    /// `UPDATE ... WHERE version = $expected`; there is no equivalent for
    /// plain file writes, so the same serialization has to happen
    /// in-process instead.
    task_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CoordinationStore {
    /// Open (creating if necessary) a coordination store at `config`'s
    /// directory.
    pub async fn open(config: CoordinationConfig) -> Result<Self, StoreError> {
        for dir in [
            config.tasks_dir(),
            config.runs_dir(),
            config.planner_sessions_dir(),
            config.sessions_dir(),
        ] {
            ensure_dir(&dir).await?;
        }
        Ok(Self {
            config,
            task_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn task_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        locks.entry(id.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    // -- Tasks ------------------------------------------------------------

    pub async fn create_task(&self, mut task: Task) -> Result<Task, StoreError> {
        let path = self.task_path(&task.id);
        if fs::metadata(&path).await.is_ok() {
            return Err(StoreError::already_exists("tasks", task.id.clone()));
        }
        task.version = 1;
        task.updated_at = Utc::now();
        write_json_atomic(&path, &task).await?;
        tracing::info!(task_id = %task.id, state = ?task.state, "task created");
        Ok(task)
    }

    pub async fn read_task(&self, id: &str) -> Result<Task, StoreError> {
        read_json(&self.task_path(id), "tasks", id).await
    }

    /// Atomic compare-and-swap update: reads the task, checks
    /// `version == expected_version`, applies `f`, writes with
    /// `version + 1` and `updated_at = now`. Fails with
    /// [`StoreError::VersionConflict`] otherwise.
    pub async fn update_task_cas(
        &self,
        id: &str,
        expected_version: u64,
        f: impl FnOnce(&mut Task),
    ) -> Result<Task, StoreError> {
        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let mut task = self.read_task(id).await?;
        if task.version != expected_version {
            tracing::debug!(
                task_id = %id,
                expected = expected_version,
                found = task.version,
                "CAS version conflict"
            );
            return Err(StoreError::VersionConflict {
                collection: "tasks",
                id: id.to_owned(),
                expected: expected_version,
                found: task.version,
            });
        }
        f(&mut task);
        task.version += 1;
        task.updated_at = Utc::now();
        write_json_atomic(&self.task_path(id), &task).await?;
        tracing::info!(task_id = %id, state = ?task.state, version = task.version, "task updated");
        Ok(task)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        list_collection(&self.config.tasks_dir(), "tasks").await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let path = self.task_path(id);
        fs::remove_file(&path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.config.tasks_dir().join(format!("{id}.json"))
    }

    // -- Runs ---------------------------------------------------------------

    pub async fn write_run(&self, run: &Run) -> Result<(), StoreError> {
        write_json_atomic(&self.run_path(&run.id), run).await
    }

    pub async fn read_run(&self, id: &str) -> Result<Run, StoreError> {
        read_json(&self.run_path(id), "runs", id).await
    }

    fn run_path(&self, id: &str) -> PathBuf {
        self.config.runs_dir().join(format!("{id}.json"))
    }

    /// Path the caller should stream the agent's raw output to.
    pub fn run_log_path(&self, id: &str) -> PathBuf {
        self.config.runs_dir().join(format!("{id}.log"))
    }

    // -- Planner sessions -----------------------------------------------

    /// Persist a planner session, retrying transient I/O faults with
    /// exponential backoff (3 attempts, doubling delay) per spec §4.1.
    pub async fn write_planner_session(&self, session: &PlannerSession) -> Result<(), StoreError> {
        let path = self.session_path(&session.session_id);
        let mut delay = Duration::from_millis(50);
        let mut last_err = None;
        for attempt in 0..3 {
            match write_json_atomic(&path, session).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        attempt,
                        error = %e,
                        "planner session write failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    pub async fn read_planner_session(&self, session_id: &str) -> Result<PlannerSession, StoreError> {
        read_json(&self.session_path(session_id), "planner-sessions", session_id).await
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.config
            .planner_sessions_dir()
            .join(format!("{session_id}.json"))
    }

    /// Update the `sessions/{latest,previous}` pointer files: the current
    /// `latest` (if any) is moved to `previous`, and `session_id` becomes the
    /// new `latest`.
    pub async fn advance_session_pointer(&self, session_id: &str) -> Result<(), StoreError> {
        let latest_path = self.config.sessions_dir().join("latest.json");
        let previous_path = self.config.sessions_dir().join("previous.json");

        if let Ok(current_latest) = fs::read_to_string(&latest_path).await {
            write_json_atomic(&previous_path, &serde_json::Value::String(current_latest)).await?;
        }
        write_json_atomic(
            &latest_path,
            &serde_json::Value::String(session_id.to_owned()),
        )
        .await
    }

    pub async fn latest_session_id(&self) -> Result<Option<String>, StoreError> {
        let path = self.config.sessions_dir().join("latest.json");
        match fs::read_to_string(&path).await {
            Ok(raw) => {
                let v: String = serde_json::from_str(&raw)
                    .map_err(|source| StoreError::Serde { path, source })?;
                Ok(Some(v))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Generate a fresh session-prefixed task id, e.g. `sess-<short>-<slug>`.
    pub fn new_session_id() -> String {
        format!("sess-{}", Uuid::new_v4().simple())
    }

    pub fn new_run_id() -> String {
        format!("run-{}", Uuid::new_v4().simple())
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

async fn list_collection<T: DeserializeOwned>(
    dir: &Path,
    collection: &'static str,
) -> Result<Vec<T>, StoreError> {
    let mut entries = fs::read_dir(dir).await.map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        out.push(read_json(&path, collection, &id).await?);
    }
    Ok(out)
}

async fn read_json<T: DeserializeOwned>(
    path: &Path,
    collection: &'static str,
    id: &str,
) -> Result<T, StoreError> {
    let raw = fs::read(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound {
                collection,
                id: id.to_owned(),
            }
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_slice(&raw).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `value` to `path` durably: serialize to a sibling temp file, fsync
/// it, rename over the destination, then fsync the parent directory so the
/// rename itself is durable.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().expect("document paths always have a parent");
    ensure_dir(parent).await?;

    let tmp_path = parent.join(format!(".{}.tmp-{}", file_name(path), Uuid::new_v4().simple()));
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })?;

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        file.write_all(&bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        file.sync_all().await.map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    }

    fs::rename(&tmp_path, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if let Ok(dir) = fs::File::open(parent).await {
        let _ = dir.sync_all().await;
    }

    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("doc")
        .to_owned()
}
