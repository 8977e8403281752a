use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

use crate::constants;

/// Generates a persisted entity id: `<prefix>_<millis>_<base36 nonce>`.
///
/// The millisecond timestamp keeps ids roughly sortable by creation time;
/// the nonce disambiguates ids minted within the same millisecond.
pub fn generate_id(prefix: &str) -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let nonce: String = (0..constants::ID_NONCE_LENGTH)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), nonce)
}

/// Generates a per-process agent session id.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Category of user intent a feature belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureCategory {
    Enhancement,
    NewFeature,
    BugFix,
    Security,
    Performance,
    Test,
}

/// Feature lifecycle status
///
/// Transitions form a DAG: `suggested -> {approved, rejected}`,
/// `approved -> implemented`. Nothing else is permitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Suggested,
    Approved,
    Rejected,
    Implemented,
}

impl FeatureStatus {
    pub fn can_transition(self, to: FeatureStatus) -> bool {
        use FeatureStatus::*;
        matches!(
            (self, to),
            (Suggested, Approved) | (Suggested, Rejected) | (Approved, Implemented)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureStatus::Suggested => "suggested",
            FeatureStatus::Approved => "approved",
            FeatureStatus::Rejected => "rejected",
            FeatureStatus::Implemented => "implemented",
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of user intent awaiting decomposition into tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub title: String,
    pub description: String,
    pub business_value: String,
    pub category: FeatureCategory,
    pub status: FeatureStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implemented_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Unknown keys from older or newer writers, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Request payload for `SuggestFeature`
#[derive(Debug, Clone, Default)]
pub struct FeatureRequest {
    pub title: String,
    pub description: String,
    pub business_value: String,
    pub category: Option<FeatureCategory>,
    pub metadata: Map<String, Value>,
}

impl Feature {
    pub fn from_request(req: FeatureRequest) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("feature"),
            title: req.title,
            description: req.description,
            business_value: req.business_value,
            category: req.category.unwrap_or(FeatureCategory::Enhancement),
            status: FeatureStatus::Suggested,
            created_at: now,
            updated_at: now,
            approved_by: None,
            approval_date: None,
            rejected_by: None,
            rejection_date: None,
            rejection_reason: None,
            implemented_date: None,
            metadata: req.metadata,
            extra: Map::new(),
        }
    }
}

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Implementation,
    Testing,
    Documentation,
    Analysis,
    Review,
    Recovery,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Implementation
    }
}

/// Current position of a task in its state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Recovered,
    Blocked,
}

impl TaskStatus {
    /// Whether the edge `self -> to` exists in the task state machine.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Queued, Blocked)
                | (Assigned, InProgress)
                | (Assigned, Queued)
                | (Assigned, Cancelled)
                | (Assigned, Blocked)
                | (Assigned, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Queued)
                | (InProgress, Cancelled)
                | (InProgress, Blocked)
                | (Failed, Queued)
                | (Failed, Recovered)
                | (Blocked, Queued)
                | (Blocked, Cancelled)
        )
    }

    /// Terminal states release resources and agent load.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Recovered
        )
    }

    /// States in which a dependency counts as satisfied.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Recovered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Recovered => "recovered",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbolic priority names mapped onto the 0-100 integer scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    pub fn value(self) -> u8 {
        match self {
            Priority::Critical => constants::PRIORITY_CRITICAL,
            Priority::High => constants::PRIORITY_HIGH,
            Priority::Normal => constants::PRIORITY_NORMAL,
            Priority::Low => constants::PRIORITY_LOW,
            Priority::Background => constants::PRIORITY_BACKGROUND,
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.value()
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Immutable audit record appended on every status change or progress report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub notes: String,
    pub updated_by: String,
}

/// A schedulable unit derived from an approved feature
///
/// Tasks are the fundamental unit of work. Each task carries its dependency
/// edges, scheduling constraints, and a full progress history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Empty for orphan tasks created directly rather than from a feature.
    #[serde(default)]
    pub feature_id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_requirements: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Critical-path weight; the resolver assumes 1 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    /// Set on `recovery` tasks: the failed task this one exists to redeem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_task_id: Option<String>,
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Free-form execution context, handed to hooks as `tool_input`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Unknown keys from older or newer writers, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_retries() -> u32 {
    constants::DEFAULT_MAX_RETRIES
}

fn default_timeout_ms() -> u64 {
    constants::DEFAULT_TASK_TIMEOUT_MS
}

/// Request payload for `CreateTask` / `CreateTaskFromFeature`
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: u8,
    pub dependencies: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub resource_requirements: BTreeMap<String, u32>,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub estimated_duration_ms: Option<u64>,
    pub context: Map<String, Value>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            task_type: TaskType::Implementation,
            priority: Priority::Normal.value(),
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            resource_requirements: BTreeMap::new(),
            max_retries: constants::DEFAULT_MAX_RETRIES,
            timeout_ms: constants::DEFAULT_TASK_TIMEOUT_MS,
            estimated_duration_ms: None,
            context: Map::new(),
        }
    }
}

impl TaskSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: impl Into<u8>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_resources(mut self, resources: BTreeMap<String, u32>) -> Self {
        self.resource_requirements = resources;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

impl Task {
    /// Builds a queued task from a spec. Dependency validation happens in the
    /// store, where the rest of the graph is visible.
    pub fn from_spec(feature_id: &str, spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("task"),
            feature_id: feature_id.to_string(),
            title: spec.title,
            description: spec.description,
            task_type: spec.task_type,
            priority: spec.priority.min(100),
            status: TaskStatus::Queued,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            resource_requirements: spec.resource_requirements,
            assigned_to: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            timeout_ms: spec.timeout_ms,
            estimated_duration_ms: spec.estimated_duration_ms,
            original_task_id: None,
            progress_history: Vec::new(),
            last_error: None,
            context: spec.context,
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    /// Latest reported progress percentage, 0 when nothing is recorded.
    pub fn progress_percentage(&self) -> u8 {
        self.progress_history
            .last()
            .map(|e| e.progress_percentage)
            .unwrap_or(0)
    }
}

/// Liveness of a registered agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Active,
    Idle,
    Failed,
    Shutdown,
}

/// Persisted record of an execution worker
///
/// The executor itself lives in the in-process registry; this record carries
/// everything schedulers and observers need to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    /// Regenerated every process lifetime.
    pub session_id: String,
    pub status: AgentState,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub initialized: bool,
    /// Non-terminal tasks currently held; maintained by the store.
    #[serde(default)]
    pub current_load: usize,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    #[serde(default)]
    pub average_execution_time: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_concurrent() -> usize {
    constants::DEFAULT_MAX_CONCURRENT_TASKS
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, max_concurrent_tasks: usize) -> Self {
        Self {
            id: id.into(),
            session_id: generate_session_id(),
            status: AgentState::Active,
            capabilities,
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            last_heartbeat: Utc::now(),
            initialized: true,
            current_load: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            average_execution_time: 0.0,
            extra: Map::new(),
        }
    }

    /// Capability check used at assignment time.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_tasks
    }

    /// Folds one finished execution into the running average.
    pub fn record_completion(&mut self, execution_secs: f64) {
        self.tasks_completed += 1;
        self.average_execution_time = (self.average_execution_time
            * (self.tasks_completed - 1) as f64
            + execution_secs)
            / self.tasks_completed as f64;
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
    }
}

/// Progress report accepted by `UpdateTaskProgress`
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// When set, the store performs the corresponding state transition.
    pub status: Option<TaskStatus>,
    pub progress_percentage: Option<u8>,
    pub notes: String,
    pub updated_by: String,
}
