//! Persistent project store
//!
//! Single source of truth. Every public operation acquires an in-process
//! mutex (guarding intra-process concurrency) plus an exclusive advisory
//! file lock on `<path>.lock` (guarding other processes), reads the document
//! from disk, mutates it in memory, writes `<path>.tmp`, fsyncs, and renames
//! over `<path>`. Readers go through the same locks, so every caller sees
//! either the pre- or post-write document, never a torn one.

pub mod document;
pub mod lock;

pub use document::{
    ApprovalAction, ApprovalRecord, CompletedTaskRecord, DocumentMetadata, ProjectDocument,
    WorkflowConfig,
};

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::models::{
    AgentRecord, AgentState, Feature, FeatureRequest, FeatureStatus, ProgressEntry,
    ProgressUpdate, Task, TaskSpec, TaskStatus, TaskType,
};
use crate::resolver;
use crate::{LoomError, Result};

/// Deep-copied view of the document plus the version it was taken at.
///
/// The resolver and scheduler work off snapshots and memoize by version.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub document: ProjectDocument,
    pub version: u64,
}

/// File-backed store for one project document.
pub struct ProjectStore {
    path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    mutex: Mutex<()>,
    version_tx: watch::Sender<u64>,
}

impl ProjectStore {
    /// Opens (or creates) the project file and runs the recovery pass.
    ///
    /// Corrupt JSON or a document without `workflow_config` is a hard error;
    /// the caller must refuse to start on it.
    pub async fn open(
        path: impl Into<PathBuf>,
        project_name: &str,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (version_tx, _) = watch::channel(0u64);
        let store = Self {
            tmp_path: sibling_path(&path, ".tmp"),
            lock_path: sibling_path(&path, ".lock"),
            path,
            lock_timeout,
            mutex: Mutex::new(()),
            version_tx,
        };

        {
            let _guard = store.mutex.lock().await;
            let _flock = lock::FileLock::acquire(&store.lock_path, store.lock_timeout).await?;

            let mut doc = if store.path.exists() {
                store.load().await?
            } else {
                info!("Creating new project file at {:?}", store.path);
                ProjectDocument::new(project_name)
            };

            let recovered = run_recovery(&mut doc);
            if recovered > 0 {
                info!("Recovery pass repaired {} entities", recovered);
            }
            store.persist(&mut doc).await?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Monotonic counter bumped on every successful mutation.
    pub fn version(&self) -> u64 {
        *self.version_tx.borrow()
    }

    /// Receiver that wakes whenever the document changes.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    // Feature lifecycle

    /// Validates required fields, assigns an id, and appends the feature
    /// with status `suggested`.
    pub async fn suggest_feature(&self, req: FeatureRequest) -> Result<String> {
        self.with_document(|doc| {
            validate_required_fields(&doc.workflow_config, &req)?;
            let feature = Feature::from_request(req);
            let id = feature.id.clone();
            doc.features.push(feature);
            doc.metadata.total_features += 1;
            info!("Feature {} suggested", id);
            Ok((id, true))
        })
        .await
    }

    pub async fn approve_feature(&self, feature_id: &str, approver: &str) -> Result<()> {
        self.with_document(|doc| {
            let feature = doc
                .find_feature_mut(feature_id)
                .ok_or_else(|| LoomError::NotFound(format!("feature {feature_id}")))?;
            transition_feature(feature, FeatureStatus::Approved)?;
            feature.approved_by = Some(approver.to_string());
            feature.approval_date = Some(Utc::now());

            doc.metadata.approval_history.push(ApprovalRecord {
                feature_id: feature_id.to_string(),
                action: ApprovalAction::Approved,
                timestamp: Utc::now(),
                approved_by: Some(approver.to_string()),
                rejected_by: None,
                notes: None,
                reason: None,
            });
            info!("Feature {} approved by {}", feature_id, approver);
            Ok(((), true))
        })
        .await
    }

    pub async fn reject_feature(&self, feature_id: &str, rejector: &str, reason: &str) -> Result<()> {
        self.with_document(|doc| {
            let feature = doc
                .find_feature_mut(feature_id)
                .ok_or_else(|| LoomError::NotFound(format!("feature {feature_id}")))?;
            transition_feature(feature, FeatureStatus::Rejected)?;
            feature.rejected_by = Some(rejector.to_string());
            feature.rejection_date = Some(Utc::now());
            feature.rejection_reason = Some(reason.to_string());

            doc.metadata.approval_history.push(ApprovalRecord {
                feature_id: feature_id.to_string(),
                action: ApprovalAction::Rejected,
                timestamp: Utc::now(),
                approved_by: None,
                rejected_by: Some(rejector.to_string()),
                notes: None,
                reason: Some(reason.to_string()),
            });
            info!("Feature {} rejected by {}: {}", feature_id, rejector, reason);
            Ok(((), true))
        })
        .await
    }

    pub async fn mark_implemented(&self, feature_id: &str) -> Result<()> {
        self.with_document(|doc| {
            let feature = doc
                .find_feature_mut(feature_id)
                .ok_or_else(|| LoomError::NotFound(format!("feature {feature_id}")))?;
            transition_feature(feature, FeatureStatus::Implemented)?;
            feature.implemented_date = Some(Utc::now());

            doc.metadata.approval_history.push(ApprovalRecord {
                feature_id: feature_id.to_string(),
                action: ApprovalAction::Implemented,
                timestamp: Utc::now(),
                approved_by: None,
                rejected_by: None,
                notes: None,
                reason: None,
            });
            info!("Feature {} marked implemented", feature_id);
            Ok(((), true))
        })
        .await
    }

    // Task lifecycle

    /// Inserts a task derived from an approved feature, status `queued`.
    pub async fn create_task_from_feature(
        &self,
        feature_id: &str,
        spec: TaskSpec,
    ) -> Result<String> {
        self.with_document(|doc| {
            let feature = doc
                .find_feature(feature_id)
                .ok_or_else(|| LoomError::NotFound(format!("feature {feature_id}")))?;
            let approved = feature.status == FeatureStatus::Approved
                || (!doc.workflow_config.require_approval
                    && feature.status == FeatureStatus::Suggested);
            if !approved {
                return Err(LoomError::FeatureNotApproved(feature_id.to_string()));
            }
            let id = insert_task(doc, feature_id, spec)?;
            Ok((id, true))
        })
        .await
    }

    /// Inserts an orphan task with no feature linkage.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<String> {
        self.with_document(|doc| {
            let id = insert_task(doc, "", spec)?;
            Ok((id, true))
        })
        .await
    }

    /// Adds a dependency edge to an existing task, refusing cycles.
    pub async fn add_task_dependency(&self, task_id: &str, dep_id: &str) -> Result<()> {
        self.with_document(|doc| {
            if doc.find_task(task_id).is_none() {
                return Err(LoomError::NotFound(format!("task {task_id}")));
            }
            if doc.find_task(dep_id).is_none() {
                return Err(LoomError::NotFound(format!("task {dep_id}")));
            }
            if task_id == dep_id
                || resolver::would_create_cycle(&doc.tasks, task_id, &[dep_id.to_string()])
            {
                return Err(LoomError::DependencyCycle(format!(
                    "{task_id} -> {dep_id} would close a cycle"
                )));
            }

            let task = doc.find_task_mut(task_id).expect("existence checked above");
            if task.dependencies.iter().any(|d| d == dep_id) {
                return Ok(((), false));
            }
            task.dependencies.push(dep_id.to_string());
            task.updated_at = Utc::now();
            Ok(((), true))
        })
        .await
    }

    /// Binds a queued task to an agent. Every precondition (dependencies
    /// satisfied, agent live, capacity, capabilities) is checked under the
    /// same lock that performs the transition.
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        self.with_document(|doc| {
            let task = doc
                .find_task(task_id)
                .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?;
            if task.status != TaskStatus::Queued {
                return Err(LoomError::NotAssignable {
                    task_id: task_id.to_string(),
                    reason: format!("task is {}", task.status),
                });
            }
            for dep in &task.dependencies {
                match doc.find_task(dep) {
                    Some(d) if d.status.satisfies_dependency() => {}
                    Some(d) => {
                        return Err(LoomError::NotAssignable {
                            task_id: task_id.to_string(),
                            reason: format!("dependency {} is {}", dep, d.status),
                        })
                    }
                    None => {
                        return Err(LoomError::NotAssignable {
                            task_id: task_id.to_string(),
                            reason: format!("dependency {dep} does not exist"),
                        })
                    }
                }
            }

            let required = task.required_capabilities.clone();
            let agent = doc
                .agents
                .get(agent_id)
                .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))?;
            if !matches!(agent.status, AgentState::Active | AgentState::Idle) {
                return Err(LoomError::NotAssignable {
                    task_id: task_id.to_string(),
                    reason: format!("agent {agent_id} is not active"),
                });
            }
            if !agent.has_capacity() {
                return Err(LoomError::NotAssignable {
                    task_id: task_id.to_string(),
                    reason: format!("agent {agent_id} is at capacity"),
                });
            }
            if !agent.covers(&required) {
                return Err(LoomError::NotAssignable {
                    task_id: task_id.to_string(),
                    reason: format!("agent {agent_id} lacks required capabilities"),
                });
            }

            apply_transition(
                doc,
                task_id,
                TaskStatus::Assigned,
                &format!("assigned to {agent_id}"),
                "scheduler",
                None,
            )?;
            {
                let task = doc.find_task_mut(task_id).expect("existence checked above");
                task.assigned_to = Some(agent_id.to_string());
                task.assigned_at = Some(Utc::now());
            }
            let agent = doc.agents.get_mut(agent_id).expect("existence checked above");
            agent.current_load += 1;
            agent.status = AgentState::Active;

            let updated = doc.find_task(task_id).expect("existence checked above").clone();
            debug!("Task {} assigned to {}", task_id, agent_id);
            Ok((updated, true))
        })
        .await
    }

    /// Appends a progress entry and, when `update.status` is set, performs
    /// the corresponding state transition with all its side effects.
    ///
    /// Percentages are monotonic: a report lower than the last recorded one
    /// is clamped up (last-writer-wins on everything else).
    pub async fn update_task_progress(
        &self,
        task_id: &str,
        update: ProgressUpdate,
    ) -> Result<Task> {
        self.with_document(|doc| {
            match update.status {
                Some(status) => {
                    apply_transition(
                        doc,
                        task_id,
                        status,
                        &update.notes,
                        &update.updated_by,
                        update.progress_percentage,
                    )?;
                }
                None => {
                    let task = doc
                        .find_task_mut(task_id)
                        .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?;
                    let now = Utc::now();
                    let last = task.progress_percentage();
                    let pct = update.progress_percentage.unwrap_or(last).max(last).min(100);
                    task.progress_history.push(ProgressEntry {
                        timestamp: now,
                        status: task.status,
                        progress_percentage: pct,
                        notes: update.notes.clone(),
                        updated_by: update.updated_by.clone(),
                    });
                    task.updated_at = now;
                }
            }
            let updated = doc
                .find_task(task_id)
                .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?
                .clone();
            Ok((updated, true))
        })
        .await
    }

    /// Free cancellation for tasks not currently executing. In-progress
    /// tasks must be cancelled through the execution engine instead.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        self.update_task_progress(
            task_id,
            ProgressUpdate {
                status: Some(TaskStatus::Cancelled),
                progress_percentage: None,
                notes: "cancelled".to_string(),
                updated_by: "supervisor".to_string(),
            },
        )
        .await
    }

    /// Manual retry: `failed -> queued` with counters reset.
    pub async fn retry_task(&self, task_id: &str) -> Result<Task> {
        self.with_document(|doc| {
            apply_transition(doc, task_id, TaskStatus::Queued, "manual retry", "supervisor", None)?;
            let task = doc.find_task_mut(task_id).expect("transition found the task");
            task.retry_count = 0;
            task.last_error = None;
            let updated = task.clone();
            Ok((updated, true))
        })
        .await
    }

    /// Requeue after a retryable failure; holds the incremented retry count.
    pub async fn requeue_for_retry(&self, task_id: &str, error: &str) -> Result<Task> {
        self.with_document(|doc| {
            {
                let task = doc
                    .find_task_mut(task_id)
                    .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?;
                task.last_error = Some(error.to_string());
                task.retry_count += 1;
            }
            let (retries, max) = {
                let task = doc.find_task(task_id).expect("existence checked above");
                (task.retry_count, task.max_retries)
            };
            apply_transition(
                doc,
                task_id,
                TaskStatus::Queued,
                &format!("retrying after failure ({retries}/{max}): {error}"),
                "engine",
                None,
            )?;
            let updated = doc.find_task(task_id).expect("existence checked above").clone();
            Ok((updated, true))
        })
        .await
    }

    /// Terminal failure; records the error and transitions to `failed`.
    pub async fn fail_task(&self, task_id: &str, error: &str, updated_by: &str) -> Result<Task> {
        self.with_document(|doc| {
            {
                let task = doc
                    .find_task_mut(task_id)
                    .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?;
                task.last_error = Some(error.to_string());
            }
            apply_transition(doc, task_id, TaskStatus::Failed, error, updated_by, None)?;
            let updated = doc.find_task(task_id).expect("existence checked above").clone();
            Ok((updated, true))
        })
        .await
    }

    /// Successful completion. When the task is a recovery task, the original
    /// failed task is promoted to `recovered`; its id is returned.
    pub async fn complete_task(&self, task_id: &str, updated_by: &str) -> Result<Option<String>> {
        self.with_document(|doc| {
            apply_transition(doc, task_id, TaskStatus::Completed, "completed", updated_by, None)?;

            let original = {
                let task = doc.find_task(task_id).expect("transition found the task");
                if task.task_type == TaskType::Recovery {
                    task.original_task_id.clone()
                } else {
                    None
                }
            };

            let mut promoted = None;
            if let Some(original_id) = original {
                let eligible = doc
                    .find_task(&original_id)
                    .map(|t| t.status == TaskStatus::Failed)
                    .unwrap_or(false);
                if eligible {
                    apply_transition(
                        doc,
                        &original_id,
                        TaskStatus::Recovered,
                        &format!("recovered by {task_id}"),
                        updated_by,
                        None,
                    )?;
                    info!("Task {} recovered via {}", original_id, task_id);
                    promoted = Some(original_id);
                }
            }
            Ok((promoted, true))
        })
        .await
    }

    /// Creates the auxiliary recovery task for a failed one. At most one
    /// recovery task ever exists per original; returns `None` when one is
    /// already there or the original is itself a recovery task.
    pub async fn create_recovery_task(&self, original_id: &str) -> Result<Option<Task>> {
        self.with_document(|doc| {
            let original = doc
                .find_task(original_id)
                .ok_or_else(|| LoomError::NotFound(format!("task {original_id}")))?;
            if original.task_type == TaskType::Recovery {
                return Ok((None, false));
            }
            if doc
                .tasks
                .iter()
                .any(|t| t.original_task_id.as_deref() == Some(original_id))
            {
                return Ok((None, false));
            }

            let spec = TaskSpec {
                title: format!("Recover: {}", original.title),
                description: format!(
                    "Recovery for task {} which failed with: {}",
                    original_id,
                    original.last_error.as_deref().unwrap_or("unknown error")
                ),
                task_type: TaskType::Recovery,
                priority: original.priority.saturating_sub(10).max(20),
                required_capabilities: original.required_capabilities.clone(),
                resource_requirements: original.resource_requirements.clone(),
                timeout_ms: original.timeout_ms,
                context: original.context.clone(),
                ..TaskSpec::default()
            };
            let feature_id = original.feature_id.clone();
            let mut task = Task::from_spec(&feature_id, spec);
            task.original_task_id = Some(original_id.to_string());
            let created = task.clone();
            doc.tasks.push(task);
            info!("Created recovery task {} for {}", created.id, original_id);
            Ok((Some(created), true))
        })
        .await
    }

    /// Shallow-merges hook-modified input into the task context.
    pub async fn merge_task_context(&self, task_id: &str, patch: Map<String, Value>) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.with_document(|doc| {
            let task = doc
                .find_task_mut(task_id)
                .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?;
            for (key, value) in patch {
                task.context.insert(key, value);
            }
            task.updated_at = Utc::now();
            Ok(((), true))
        })
        .await
    }

    /// Reconciles `blocked` markers with the resolver's cycle report: tasks
    /// on a cycle are parked, tasks no longer on one return to the queue.
    pub async fn sync_blocked(
        &self,
        cyclic: &HashSet<String>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        self.with_document(|doc| {
            let mut newly_blocked = Vec::new();
            let mut unblocked = Vec::new();

            let ids: Vec<String> = doc.tasks.iter().map(|t| t.id.clone()).collect();
            for id in ids {
                let status = doc.find_task(&id).expect("iterating known ids").status;
                if cyclic.contains(&id) && status == TaskStatus::Queued {
                    apply_transition(
                        doc,
                        &id,
                        TaskStatus::Blocked,
                        "cyclic_dependency",
                        "resolver",
                        None,
                    )?;
                    doc.find_task_mut(&id).expect("iterating known ids").last_error =
                        Some("cyclic_dependency".to_string());
                    newly_blocked.push(id);
                } else if !cyclic.contains(&id) && status == TaskStatus::Blocked {
                    apply_transition(doc, &id, TaskStatus::Queued, "cycle resolved", "resolver", None)?;
                    doc.find_task_mut(&id).expect("iterating known ids").last_error = None;
                    unblocked.push(id);
                }
            }

            let dirty = !newly_blocked.is_empty() || !unblocked.is_empty();
            Ok(((newly_blocked, unblocked), dirty))
        })
        .await
    }

    // Agent lifecycle

    /// Inserts or refreshes an agent record. Re-registering an id mints a
    /// fresh session id and resets live counters.
    pub async fn register_agent(&self, record: AgentRecord) -> Result<()> {
        self.with_document(|doc| {
            info!("Registering agent {}", record.id);
            doc.agents.insert(record.id.clone(), record);
            Ok(((), true))
        })
        .await
    }

    /// Marks the agent `shutdown` and requeues everything it held.
    pub async fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        self.with_document(|doc| {
            if !doc.agents.contains_key(agent_id) {
                return Err(LoomError::NotFound(format!("agent {agent_id}")));
            }
            requeue_agent_tasks(doc, agent_id, "agent deregistered")?;
            let agent = doc.agents.get_mut(agent_id).expect("existence checked above");
            agent.status = AgentState::Shutdown;
            agent.current_load = 0;
            info!("Agent {} deregistered", agent_id);
            Ok(((), true))
        })
        .await
    }

    /// Refreshes the heartbeat; revives an agent previously marked failed.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.with_document(|doc| {
            let agent = doc
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))?;
            agent.last_heartbeat = Utc::now();
            if agent.status == AgentState::Failed {
                agent.status = AgentState::Active;
                info!("Agent {} revived by heartbeat", agent_id);
            }
            Ok(((), true))
        })
        .await
    }

    /// Marks agents silent for longer than `timeout` as failed and requeues
    /// their tasks. Returns the ids that expired.
    pub async fn expire_agents(&self, timeout: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(30));
        self.with_document(|doc| {
            let expired: Vec<String> = doc
                .agents
                .values()
                .filter(|a| {
                    matches!(a.status, AgentState::Active | AgentState::Idle)
                        && a.last_heartbeat < cutoff
                })
                .map(|a| a.id.clone())
                .collect();

            for agent_id in &expired {
                warn!("Agent {} missed heartbeat, marking failed", agent_id);
                requeue_agent_tasks(doc, agent_id, "agent heartbeat expired")?;
                let agent = doc.agents.get_mut(agent_id).expect("iterating known ids");
                agent.status = AgentState::Failed;
                agent.current_load = 0;
            }

            let dirty = !expired.is_empty();
            Ok((expired, dirty))
        })
        .await
    }

    // Reads

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.read_document(|doc| {
            doc.find_task(task_id)
                .cloned()
                .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))
        })
        .await
    }

    pub async fn get_feature(&self, feature_id: &str) -> Result<Feature> {
        self.read_document(|doc| {
            doc.find_feature(feature_id)
                .cloned()
                .ok_or_else(|| LoomError::NotFound(format!("feature {feature_id}")))
        })
        .await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        self.read_document(|doc| {
            doc.agents
                .get(agent_id)
                .cloned()
                .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))
        })
        .await
    }

    /// Deep-copied view used by the resolver and external observers.
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        let version = self.version();
        self.read_document(move |doc| {
            Ok(StoreSnapshot {
                document: doc.clone(),
                version,
            })
        })
        .await
    }

    // Internals

    async fn with_document<T, F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut ProjectDocument) -> Result<(T, bool)>,
    {
        let _guard = self.mutex.lock().await;
        let _flock = lock::FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let mut doc = self.load().await?;
        let (value, dirty) = mutator(&mut doc)?;
        if dirty {
            self.persist(&mut doc).await?;
            self.version_tx.send_modify(|v| *v += 1);
        }
        Ok(value)
    }

    async fn read_document<T, F>(&self, reader: F) -> Result<T>
    where
        F: FnOnce(&ProjectDocument) -> Result<T>,
    {
        let _guard = self.mutex.lock().await;
        let _flock = lock::FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let doc = self.load().await?;
        reader(&doc)
    }

    async fn load(&self) -> Result<ProjectDocument> {
        let bytes = tokio::fs::read(&self.path).await?;
        let doc = serde_json::from_slice(&bytes)?;
        Ok(doc)
    }

    /// Atomic replace: serialize, write `<path>.tmp`, fsync, rename.
    async fn persist(&self, doc: &mut ProjectDocument) -> Result<()> {
        doc.metadata.updated = Utc::now();
        let text = serde_json::to_string_pretty(doc)?;

        let mut file = tokio::fs::File::create(&self.tmp_path).await?;
        file.write_all(text.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn transition_feature(feature: &mut Feature, to: FeatureStatus) -> Result<()> {
    if !feature.status.can_transition(to) {
        return Err(LoomError::InvalidTransition {
            entity: format!("feature {}", feature.id),
            from: feature.status.to_string(),
            to: to.to_string(),
        });
    }
    feature.status = to;
    feature.updated_at = Utc::now();
    Ok(())
}

fn validate_required_fields(config: &WorkflowConfig, req: &FeatureRequest) -> Result<()> {
    for field in &config.required_fields {
        let present = match field.as_str() {
            "title" => !req.title.trim().is_empty(),
            "description" => !req.description.trim().is_empty(),
            "business_value" => !req.business_value.trim().is_empty(),
            "category" => req.category.is_some(),
            other => req
                .metadata
                .get(other)
                .and_then(Value::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false),
        };
        if !present {
            return Err(LoomError::InvalidField(field.clone()));
        }
    }
    Ok(())
}

fn insert_task(doc: &mut ProjectDocument, feature_id: &str, spec: TaskSpec) -> Result<String> {
    if spec.title.trim().is_empty() {
        return Err(LoomError::InvalidField("title".to_string()));
    }
    for dep in &spec.dependencies {
        if doc.find_task(dep).is_none() {
            return Err(LoomError::NotFound(format!("dependency task {dep}")));
        }
    }

    let task = Task::from_spec(feature_id, spec);
    // A fresh node only adds outgoing edges, but guard against a nonce
    // collision putting its own id in the dependency list.
    if task.dependencies.iter().any(|d| *d == task.id)
        || resolver::would_create_cycle(&doc.tasks, &task.id, &task.dependencies)
    {
        return Err(LoomError::DependencyCycle(format!(
            "task {} dependencies close a cycle",
            task.id
        )));
    }

    let id = task.id.clone();
    doc.tasks.push(task);
    info!("Task {} created (feature: {:?})", id, feature_id);
    Ok(id)
}

/// Performs one validated state transition with all of its side effects:
/// timestamps, agent load and stats, the completed-task ledger, and the
/// progress-history entry.
fn apply_transition(
    doc: &mut ProjectDocument,
    task_id: &str,
    to: TaskStatus,
    notes: &str,
    updated_by: &str,
    pct: Option<u8>,
) -> Result<()> {
    let idx = doc
        .tasks
        .iter()
        .position(|t| t.id == task_id)
        .ok_or_else(|| LoomError::NotFound(format!("task {task_id}")))?;
    let from = doc.tasks[idx].status;
    if !from.can_transition(to) {
        return Err(LoomError::InvalidTransition {
            entity: format!("task {task_id}"),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    let was_held = matches!(from, TaskStatus::Assigned | TaskStatus::InProgress);
    let still_held = matches!(to, TaskStatus::Assigned | TaskStatus::InProgress);
    let agent_id = doc.tasks[idx].assigned_to.clone();
    let feature_id = doc.tasks[idx].feature_id.clone();
    let execution_secs = doc.tasks[idx]
        .started_at
        .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0);

    {
        let task = &mut doc.tasks[idx];
        task.status = to;
        match to {
            TaskStatus::InProgress => task.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Recovered => task.completed_at = Some(now),
            _ => {}
        }
        if !still_held {
            task.assigned_to = None;
            task.assigned_at = None;
        }

        let last = task.progress_percentage();
        let effective = match to {
            TaskStatus::Completed | TaskStatus::Recovered => 100,
            _ => pct.unwrap_or(last).max(last).min(100),
        };
        task.progress_history.push(ProgressEntry {
            timestamp: now,
            status: to,
            progress_percentage: effective,
            notes: notes.to_string(),
            updated_by: updated_by.to_string(),
        });
        task.updated_at = now;
    }

    if was_held && !still_held {
        if let Some(agent_id) = &agent_id {
            if let Some(agent) = doc.agents.get_mut(agent_id) {
                agent.current_load = agent.current_load.saturating_sub(1);
                match to {
                    TaskStatus::Completed | TaskStatus::Recovered => {
                        agent.record_completion(execution_secs.unwrap_or(0.0));
                    }
                    TaskStatus::Failed => agent.record_failure(),
                    _ => {}
                }
            }
        }
    }

    if matches!(to, TaskStatus::Completed | TaskStatus::Recovered) {
        doc.completed_tasks.push(CompletedTaskRecord {
            task_id: task_id.to_string(),
            completed_at: now,
            assigned_to: agent_id,
            feature_id,
        });
    }

    debug!("Task {} transitioned {} -> {}", task_id, from, to);
    Ok(())
}

fn requeue_agent_tasks(doc: &mut ProjectDocument, agent_id: &str, note: &str) -> Result<()> {
    let held: Vec<String> = doc
        .tasks
        .iter()
        .filter(|t| t.assigned_to.as_deref() == Some(agent_id) && !t.status.is_terminal())
        .map(|t| t.id.clone())
        .collect();
    for task_id in held {
        apply_transition(&mut *doc, &task_id, TaskStatus::Queued, note, "store", None)?;
        info!("Task {} requeued: {}", task_id, note);
    }
    Ok(())
}

/// Idempotent invariant repair run on every open:
/// - `in_progress` past its deadline is failed with `timeout_recovered`
/// - `assigned` to a missing agent returns to the queue
/// - `suggested` features past the auto-reject window are rejected
fn run_recovery(doc: &mut ProjectDocument) -> usize {
    let now = Utc::now();
    let mut repaired = 0;

    let stalled: Vec<String> = doc
        .tasks
        .iter()
        .filter(|t| {
            t.status == TaskStatus::InProgress
                && t.started_at
                    .map(|s| s + ChronoDuration::milliseconds(t.timeout_ms as i64) < now)
                    .unwrap_or(true)
        })
        .map(|t| t.id.clone())
        .collect();
    for task_id in stalled {
        if let Some(task) = doc.find_task_mut(&task_id) {
            task.last_error = Some("timeout_recovered".to_string());
        }
        if apply_transition(doc, &task_id, TaskStatus::Failed, "timeout_recovered", "recovery", None)
            .is_ok()
        {
            warn!("Recovered stalled task {} as failed", task_id);
            repaired += 1;
        }
    }

    let orphaned: Vec<String> = doc
        .tasks
        .iter()
        .filter(|t| {
            t.status == TaskStatus::Assigned
                && t.assigned_to
                    .as_ref()
                    .map(|a| !doc.agents.contains_key(a))
                    .unwrap_or(true)
        })
        .map(|t| t.id.clone())
        .collect();
    for task_id in orphaned {
        if apply_transition(doc, &task_id, TaskStatus::Queued, "assigned agent absent", "recovery", None)
            .is_ok()
        {
            warn!("Requeued task {} whose agent is gone", task_id);
            repaired += 1;
        }
    }

    let reject_after = ChronoDuration::hours(doc.workflow_config.auto_reject_timeout_hours);
    let expired: Vec<String> = doc
        .features
        .iter()
        .filter(|f| f.status == FeatureStatus::Suggested && f.created_at + reject_after < now)
        .map(|f| f.id.clone())
        .collect();
    for feature_id in expired {
        let feature = doc.find_feature_mut(&feature_id).expect("iterating known ids");
        if transition_feature(feature, FeatureStatus::Rejected).is_ok() {
            feature.rejected_by = Some("system".to_string());
            feature.rejection_date = Some(now);
            feature.rejection_reason = Some("auto_reject_timeout".to_string());
            doc.metadata.approval_history.push(ApprovalRecord {
                feature_id: feature_id.clone(),
                action: ApprovalAction::Rejected,
                timestamp: now,
                approved_by: None,
                rejected_by: Some("system".to_string()),
                notes: None,
                reason: Some("auto_reject_timeout".to_string()),
            });
            warn!("Feature {} auto-rejected after timeout", feature_id);
            repaired += 1;
        }
    }

    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureCategory, Priority};
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> ProjectStore {
        ProjectStore::open(
            dir.path().join("project.json"),
            "test-project",
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    fn feature_request(title: &str) -> FeatureRequest {
        FeatureRequest {
            title: title.to_string(),
            description: "a description".to_string(),
            business_value: "some value".to_string(),
            category: Some(FeatureCategory::Enhancement),
            metadata: Map::new(),
        }
    }

    async fn approved_feature(store: &ProjectStore) -> String {
        let id = store.suggest_feature(feature_request("Dark mode")).await.unwrap();
        store.approve_feature(&id, "tester").await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_suggest_requires_fields() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut req = feature_request("ok");
        req.description = String::new();
        let err = store.suggest_feature(req).await.unwrap_err();
        assert!(matches!(err, LoomError::InvalidField(field) if field == "description"));
    }

    #[tokio::test]
    async fn test_feature_lifecycle_and_history() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let id = store.suggest_feature(feature_request("Dark mode")).await.unwrap();
        assert!(id.starts_with("feature_"));

        store.approve_feature(&id, "tester").await.unwrap();
        let err = store.approve_feature(&id, "tester").await.unwrap_err();
        assert!(matches!(err, LoomError::InvalidTransition { .. }));

        store.mark_implemented(&id).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.document.metadata.total_features, 1);
        assert_eq!(snapshot.document.metadata.approval_history.len(), 2);
        let feature = snapshot.document.find_feature(&id).unwrap();
        assert_eq!(feature.status, FeatureStatus::Implemented);
    }

    #[tokio::test]
    async fn test_task_requires_approved_feature() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let id = store.suggest_feature(feature_request("Dark mode")).await.unwrap();
        let err = store
            .create_task_from_feature(&id, TaskSpec::new("implement"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::FeatureNotApproved(_)));

        store.approve_feature(&id, "tester").await.unwrap();
        let task_id = store
            .create_task_from_feature(&id, TaskSpec::new("implement"))
            .await
            .unwrap();
        assert!(task_id.starts_with("task_"));
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected_and_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let t1 = store.create_task(TaskSpec::new("t1")).await.unwrap();
        let t2 = store
            .create_task(TaskSpec::new("t2").with_dependencies(vec![t1.clone()]))
            .await
            .unwrap();

        let before = store.version();
        let err = store.add_task_dependency(&t1, &t2).await.unwrap_err();
        assert!(matches!(err, LoomError::DependencyCycle(_)));
        assert_eq!(store.version(), before);

        let task = store.get_task(&t1).await.unwrap();
        assert!(task.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_assignment_preconditions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let feature = approved_feature(&store).await;
        let t1 = store
            .create_task_from_feature(&feature, TaskSpec::new("t1"))
            .await
            .unwrap();
        let t2 = store
            .create_task_from_feature(
                &feature,
                TaskSpec::new("t2")
                    .with_dependencies(vec![t1.clone()])
                    .with_capabilities(vec!["rust".to_string()]),
            )
            .await
            .unwrap();

        store
            .register_agent(AgentRecord::new("A1", vec!["general".to_string()], 1))
            .await
            .unwrap();

        // Unmet dependency.
        let err = store.assign_task(&t2, "A1").await.unwrap_err();
        assert!(matches!(err, LoomError::NotAssignable { .. }));

        // Happy path for the root task.
        let task = store.assign_task(&t1, "A1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_to.as_deref(), Some("A1"));
        let agent = store.get_agent("A1").await.unwrap();
        assert_eq!(agent.current_load, 1);

        // Capacity is exhausted now.
        let t3 = store.create_task(TaskSpec::new("t3")).await.unwrap();
        let err = store.assign_task(&t3, "A1").await.unwrap_err();
        assert!(matches!(err, LoomError::NotAssignable { .. }));
    }

    #[tokio::test]
    async fn test_completion_updates_ledger_and_agent_stats() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let feature = approved_feature(&store).await;
        let task_id = store
            .create_task_from_feature(&feature, TaskSpec::new("t1"))
            .await
            .unwrap();
        store
            .register_agent(AgentRecord::new("A1", vec![], 1))
            .await
            .unwrap();
        store.assign_task(&task_id, "A1").await.unwrap();
        store
            .update_task_progress(
                &task_id,
                ProgressUpdate {
                    status: Some(TaskStatus::InProgress),
                    progress_percentage: None,
                    notes: "started".to_string(),
                    updated_by: "A1".to_string(),
                },
            )
            .await
            .unwrap();
        store.complete_task(&task_id, "A1").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.document.completed_tasks.len(), 1);
        assert_eq!(snapshot.document.completed_tasks[0].task_id, task_id);
        assert_eq!(
            snapshot.document.completed_tasks[0].assigned_to.as_deref(),
            Some("A1")
        );

        let task = snapshot.document.find_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.assigned_to.is_none());
        assert_eq!(task.progress_percentage(), 100);

        let agent = &snapshot.document.agents["A1"];
        assert_eq!(agent.current_load, 0);
        assert_eq!(agent.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let task_id = store.create_task(TaskSpec::new("t1")).await.unwrap();
        for pct in [40u8, 20u8, 70u8] {
            store
                .update_task_progress(
                    &task_id,
                    ProgressUpdate {
                        status: None,
                        progress_percentage: Some(pct),
                        notes: String::new(),
                        updated_by: "A1".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let task = store.get_task(&task_id).await.unwrap();
        let history: Vec<u8> = task
            .progress_history
            .iter()
            .map(|e| e.progress_percentage)
            .collect();
        assert_eq!(history, vec![40, 40, 70]);
    }

    #[tokio::test]
    async fn test_deregister_requeues_tasks() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let task_id = store.create_task(TaskSpec::new("t1")).await.unwrap();
        store
            .register_agent(AgentRecord::new("A1", vec![], 1))
            .await
            .unwrap();
        store.assign_task(&task_id, "A1").await.unwrap();

        store.deregister_agent("A1").await.unwrap();

        let task = store.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_to.is_none());
        let agent = store.get_agent("A1").await.unwrap();
        assert_eq!(agent.status, AgentState::Shutdown);
        assert_eq!(agent.current_load, 0);
    }

    #[tokio::test]
    async fn test_recovery_pass_repairs_stalled_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("project.json");

        // Build a document with a stalled in-progress task and an assigned
        // task whose agent no longer exists, then reopen.
        {
            let store =
                ProjectStore::open(&path, "test-project", Duration::from_secs(5)).await.unwrap();
            let stalled = store
                .create_task(TaskSpec::new("stalled").with_timeout_ms(10))
                .await
                .unwrap();
            let orphan = store.create_task(TaskSpec::new("orphan")).await.unwrap();
            store
                .register_agent(AgentRecord::new("A1", vec![], 2))
                .await
                .unwrap();
            store.assign_task(&stalled, "A1").await.unwrap();
            store.assign_task(&orphan, "A1").await.unwrap();
            store
                .update_task_progress(
                    &stalled,
                    ProgressUpdate {
                        status: Some(TaskStatus::InProgress),
                        progress_percentage: None,
                        notes: "started".to_string(),
                        updated_by: "A1".to_string(),
                    },
                )
                .await
                .unwrap();

            // Drop the agent record behind the store's back by rewriting the
            // document the way a crashed foreign process would leave it.
            let mut snapshot = store.snapshot().await.unwrap().document;
            snapshot.agents.remove("A1");
            let text = serde_json::to_string_pretty(&snapshot).unwrap();
            std::fs::write(&path, text).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let store = ProjectStore::open(&path, "test-project", Duration::from_secs(5)).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();

        let stalled = snapshot
            .document
            .tasks
            .iter()
            .find(|t| t.title == "stalled")
            .unwrap();
        assert_eq!(stalled.status, TaskStatus::Failed);
        assert_eq!(stalled.last_error.as_deref(), Some("timeout_recovered"));

        let orphan = snapshot
            .document
            .tasks
            .iter()
            .find(|t| t.title == "orphan")
            .unwrap();
        assert_eq!(orphan.status, TaskStatus::Queued);
        assert!(orphan.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_auto_reject_stale_suggestions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("project.json");

        {
            let store =
                ProjectStore::open(&path, "test-project", Duration::from_secs(5)).await.unwrap();
            let id = store.suggest_feature(feature_request("stale")).await.unwrap();

            let mut doc = store.snapshot().await.unwrap().document;
            doc.find_feature_mut(&id).unwrap().created_at = Utc::now() - ChronoDuration::hours(100);
            std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
        }

        let store = ProjectStore::open(&path, "test-project", Duration::from_secs(5)).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        let feature = &snapshot.document.features[0];
        assert_eq!(feature.status, FeatureStatus::Rejected);
        assert_eq!(feature.rejection_reason.as_deref(), Some("auto_reject_timeout"));
    }

    #[tokio::test]
    async fn test_recovery_task_created_once_and_promotes_original() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let original = store
            .create_task(TaskSpec::new("t1").with_priority(Priority::High))
            .await
            .unwrap();
        store
            .register_agent(AgentRecord::new("A1", vec![], 1))
            .await
            .unwrap();
        store.assign_task(&original, "A1").await.unwrap();
        store
            .update_task_progress(
                &original,
                ProgressUpdate {
                    status: Some(TaskStatus::InProgress),
                    progress_percentage: None,
                    notes: "started".to_string(),
                    updated_by: "A1".to_string(),
                },
            )
            .await
            .unwrap();
        store.fail_task(&original, "boom", "A1").await.unwrap();

        let recovery = store.create_recovery_task(&original).await.unwrap().unwrap();
        assert_eq!(recovery.task_type, TaskType::Recovery);
        assert_eq!(recovery.priority, Priority::High.value() - 10);
        assert_eq!(recovery.original_task_id.as_deref(), Some(original.as_str()));

        // Second request is a no-op.
        assert!(store.create_recovery_task(&original).await.unwrap().is_none());

        // Drive the recovery task to completion; the original is promoted.
        store.assign_task(&recovery.id, "A1").await.unwrap();
        store
            .update_task_progress(
                &recovery.id,
                ProgressUpdate {
                    status: Some(TaskStatus::InProgress),
                    progress_percentage: None,
                    notes: "started".to_string(),
                    updated_by: "A1".to_string(),
                },
            )
            .await
            .unwrap();
        let promoted = store.complete_task(&recovery.id, "A1").await.unwrap();
        assert_eq!(promoted.as_deref(), Some(original.as_str()));

        let task = store.get_task(&original).await.unwrap();
        assert_eq!(task.status, TaskStatus::Recovered);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_mutations_serialize() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open_store(&dir).await);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .suggest_feature(feature_request(&format!("feature {i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut ids: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.document.features.len(), 8);
        assert_eq!(snapshot.document.metadata.total_features, 8);
    }

    #[tokio::test]
    async fn test_on_disk_round_trip_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let _ = store.suggest_feature(feature_request("one")).await.unwrap();

        let first = std::fs::read_to_string(store.path()).unwrap();
        let parsed: ProjectDocument = serde_json::from_str(&first).unwrap();
        let second = format!("{}\n", serde_json::to_string_pretty(&parsed).unwrap());
        assert_eq!(first, second);
    }
}
