//! Agent executor seam
//!
//! The persisted side of an agent (capabilities, load, heartbeat) lives in
//! the store as an `AgentRecord`. The executable side, the function the
//! execution engine invokes, lives here, registered in-process and keyed by
//! agent id. Agents are ephemeral relative to tasks: their records survive
//! restarts, their executors do not.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::constants;
use crate::models::Task;
use crate::Result;

/// The agent's execute function, invoked once per leased task.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Runs the task to completion, returning the tool output handed to
    /// `PostToolUse` hooks. Errors become the task's `last_error`.
    async fn execute(&self, task: Task) -> Result<Value>;
}

/// Adapter turning an async closure into an executor. Used heavily by tests
/// and by embedders whose agents are plain functions.
pub struct FnAgent<F>(pub F);

#[async_trait]
impl<F, Fut> AgentExecutor for FnAgent<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, task: Task) -> Result<Value> {
        (self.0)(task).await
    }
}

/// Registration request for a new agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: String,
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: usize,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            max_concurrent_tasks: constants::DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }
}

/// In-process table of executors plus a short failure history per agent,
/// consulted by the scheduler's tie-breaking.
pub struct AgentRegistry {
    executors: RwLock<HashMap<String, Arc<dyn AgentExecutor>>>,
    failures: RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, agent_id: &str, executor: Arc<dyn AgentExecutor>) {
        let mut executors = self.executors.write().await;
        executors.insert(agent_id.to_string(), executor);
        debug!("Registered executor for agent {}", agent_id);
    }

    pub async fn remove(&self, agent_id: &str) {
        let mut executors = self.executors.write().await;
        executors.remove(agent_id);
        let mut failures = self.failures.write().await;
        failures.remove(agent_id);
        debug!("Removed executor for agent {}", agent_id);
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<dyn AgentExecutor>> {
        let executors = self.executors.read().await;
        executors.get(agent_id).cloned()
    }

    pub async fn has(&self, agent_id: &str) -> bool {
        let executors = self.executors.read().await;
        executors.contains_key(agent_id)
    }

    /// Remembers one failure, keeping only the last N per agent.
    pub async fn record_failure(&self, agent_id: &str) {
        let mut failures = self.failures.write().await;
        let history = failures.entry(agent_id.to_string()).or_default();
        history.push_back(Utc::now());
        while history.len() > constants::AGENT_FAILURE_HISTORY {
            history.pop_front();
        }
    }

    pub async fn recent_failures(&self, agent_id: &str) -> usize {
        let failures = self.failures.read().await;
        failures.get(agent_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Ids with a live executor; the scheduler never binds without one.
    pub async fn executor_ids(&self) -> std::collections::HashSet<String> {
        let executors = self.executors.read().await;
        executors.keys().cloned().collect()
    }

    /// Failure counts for every agent with history, for tie-breaking.
    pub async fn failure_counts(&self) -> HashMap<String, usize> {
        let failures = self.failures.read().await;
        failures.iter().map(|(id, h)| (id.clone(), h.len())).collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
