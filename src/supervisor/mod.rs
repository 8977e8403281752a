//! Supervisor façade
//!
//! Owns every collaborator (store, hook manager, resource pools, scheduler,
//! execution engine, event bus) and exposes the public API. All mutations
//! funnel through the store; the supervisor's own job is wiring, event
//! publication, and lifecycle (`start` / `stop`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agents::{AgentExecutor, AgentRegistry, AgentSpec};
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::events::{Event, EventBus, EventKind};
use crate::hooks::{self, HookConfig, HookEvent, HookManager};
use crate::models::{
    generate_session_id, AgentRecord, AgentState, FeatureRequest, ProgressUpdate, TaskSpec,
    TaskStatus,
};
use crate::scheduler::{ResourcePool, Scheduler};
use crate::store::{ProjectStore, StoreSnapshot};
use crate::{LoomError, Result};

/// Point-in-time view of agents, queues, and resources for monitoring
/// front-ends (which are themselves out of scope).
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub agents: BTreeMap<String, AgentStatusSummary>,
    pub resource_capacity: BTreeMap<String, u32>,
    pub resource_available: BTreeMap<String, u32>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct AgentStatusSummary {
    pub status: AgentState,
    pub current_load: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_execution_time: f64,
}

/// Builder for a supervisor bound to one project file.
pub struct SupervisorBuilder {
    path: PathBuf,
    project_name: String,
    config: Option<EngineConfig>,
    hooks: Vec<HookConfig>,
    resources: BTreeMap<String, u32>,
}

impl SupervisorBuilder {
    pub fn new(path: impl Into<PathBuf>, project_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            project_name: project_name.into(),
            config: None,
            hooks: Vec::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_hook(mut self, hook: HookConfig) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Registers a named resource pool capacity. Call once per resource.
    pub fn with_resource(mut self, name: impl Into<String>, capacity: u32) -> Self {
        self.resources.insert(name.into(), capacity);
        self
    }

    /// Opens the store (running its recovery pass) and wires everything up.
    /// The loops do not run until `start`.
    pub async fn build(self) -> Result<Supervisor> {
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => EngineConfig::load()?,
        };

        let store = Arc::new(
            ProjectStore::open(self.path, &self.project_name, config.lock_timeout).await?,
        );
        let session_id = generate_session_id();
        let hooks = Arc::new(
            HookManager::new(self.hooks, session_id.clone(), config.workspace_dir.clone())
                .with_timeout(config.hook_timeout),
        );
        let registry = Arc::new(AgentRegistry::new());
        let pool = Arc::new(ResourcePool::new(self.resources));
        let events = EventBus::new();

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry.clone(),
            pool.clone(),
            events.clone(),
            config.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            registry.clone(),
            hooks.clone(),
            pool.clone(),
            events.clone(),
            config.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Supervisor {
            store,
            registry,
            pool,
            hooks,
            events,
            scheduler,
            engine,
            config,
            session_id,
            shutdown_tx,
            handles: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }
}

pub struct Supervisor {
    store: Arc<ProjectStore>,
    registry: Arc<AgentRegistry>,
    pool: Arc<ResourcePool>,
    hooks: Arc<HookManager>,
    events: EventBus,
    scheduler: Arc<Scheduler>,
    engine: Arc<ExecutionEngine>,
    config: EngineConfig,
    session_id: String,
    shutdown_tx: watch::Sender<bool>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    start_time: Instant,
}

impl Supervisor {
    pub fn builder(path: impl Into<PathBuf>, project_name: impl Into<String>) -> SupervisorBuilder {
        SupervisorBuilder::new(path, project_name)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Spawns the scheduler and execution-engine loops. Idempotent.
    pub async fn start(&self) -> Result<()> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Supervisor starting");

        // 🔒 STARTUP ORDERING DECISION: Subscribe the engine before spawning
        // the scheduler
        // Why: Broadcast channels drop events published before a receiver
        // exists; an assignment emitted into the void would strand its task
        // in `assigned` until recovery
        // Alternative: Let the engine subscribe inside its own loop
        // (rejected: races the scheduler's first tick)
        let assignments = self.events.subscribe();
        let mut handles = self.handles.lock().expect("handle list poisoned");
        handles.push(tokio::spawn(
            self.engine.clone().run(assignments, self.shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(
            self.scheduler.clone().run(self.shutdown_tx.subscribe()),
        ));
        Ok(())
    }

    /// Graceful shutdown: fire `Stop` hooks (advisory), stop dispatching,
    /// wait up to `grace` for in-flight tasks, then force-cancel stragglers.
    pub async fn stop(&self, grace: Option<Duration>) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Ok(());
        }
        info!("Supervisor stopping");

        let results = self.hooks.fire(HookEvent::Stop, None, None, None, None).await;
        let (blocked, message) = hooks::is_blocked(&results);
        if blocked {
            // 🛑 STOP HOOK DECISION: block:true is advisory only
            // Why: Honoring a veto here means a buggy hook can pin the
            // process alive forever; logging the objection is the most a
            // shutdown path can safely owe it
            // Alternative: Abort the shutdown (rejected: hung processes)
            warn!(
                "Stop hook requested block ({:?}); proceeding with shutdown anyway",
                message
            );
        }

        self.events.publish(Event::ShutdownStarted);
        let _ = self.shutdown_tx.send(true);

        let grace = grace.unwrap_or(self.config.shutdown_grace);
        let deadline = Instant::now() + grace;
        while self.engine.in_flight_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let stragglers = self.engine.in_flight_count();
        if stragglers > 0 {
            warn!("Force-cancelling {} in-flight task(s)", stragglers);
            self.engine.cancel_all();
            let hard_deadline = Instant::now() + Duration::from_secs(2);
            while self.engine.in_flight_count() > 0 && Instant::now() < hard_deadline {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handle list poisoned");
            guard.drain(..).collect()
        };
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                warn!("Supervisor loop did not stop in time, aborting");
                handle.abort();
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }

    // Feature API

    pub async fn suggest_feature(&self, req: FeatureRequest) -> Result<String> {
        self.ensure_running()?;
        let feature_id = self.store.suggest_feature(req).await?;
        self.events.publish(Event::FeatureSuggested {
            feature_id: feature_id.clone(),
        });
        Ok(feature_id)
    }

    pub async fn approve_feature(&self, feature_id: &str, approver: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.approve_feature(feature_id, approver).await?;
        self.events.publish(Event::FeatureApproved {
            feature_id: feature_id.to_string(),
            approved_by: approver.to_string(),
        });
        Ok(())
    }

    pub async fn reject_feature(&self, feature_id: &str, rejector: &str, reason: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.reject_feature(feature_id, rejector, reason).await?;
        self.events.publish(Event::FeatureRejected {
            feature_id: feature_id.to_string(),
            rejected_by: rejector.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub async fn mark_implemented(&self, feature_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.mark_implemented(feature_id).await?;
        self.events.publish(Event::FeatureImplemented {
            feature_id: feature_id.to_string(),
        });
        Ok(())
    }

    // Task API

    pub async fn create_task_from_feature(
        &self,
        feature_id: &str,
        spec: TaskSpec,
    ) -> Result<String> {
        self.ensure_running()?;
        let task_id = self.store.create_task_from_feature(feature_id, spec).await?;
        self.events.publish(Event::TaskCreated {
            task_id: task_id.clone(),
            feature_id: feature_id.to_string(),
        });
        Ok(task_id)
    }

    /// Creates an orphan task not linked to any feature.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<String> {
        self.ensure_running()?;
        let task_id = self.store.create_task(spec).await?;
        self.events.publish(Event::TaskCreated {
            task_id: task_id.clone(),
            feature_id: String::new(),
        });
        Ok(task_id)
    }

    pub async fn add_task_dependency(&self, task_id: &str, dep_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.add_task_dependency(task_id, dep_id).await
    }

    /// Cancels a task. Queued and assigned tasks cancel immediately;
    /// in-progress tasks are signalled through the engine and finish
    /// cancelling asynchronously.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.ensure_running()?;
        let task = self.store.get_task(task_id).await?;
        if task.status == TaskStatus::InProgress {
            if self.engine.cancel(task_id) {
                return Ok(());
            }
            // In progress on paper but not in flight here (e.g. recovered
            // from another process); cancel through the store directly.
        }
        self.store.cancel_task(task_id).await?;
        self.events.publish(Event::TaskCancelled {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Manual retry of a failed task.
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.retry_task(task_id).await?;
        self.events.publish(Event::TaskRequeued {
            task_id: task_id.to_string(),
            retry_count: 0,
        });
        Ok(())
    }

    pub async fn update_task_progress(&self, task_id: &str, update: ProgressUpdate) -> Result<()> {
        self.ensure_running()?;
        let task = self.store.update_task_progress(task_id, update).await?;
        self.events.publish(Event::TaskProgress {
            task_id: task_id.to_string(),
            progress_percentage: task.progress_percentage(),
        });
        Ok(())
    }

    // Agent API

    pub async fn register_agent(
        &self,
        spec: AgentSpec,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<()> {
        self.ensure_running()?;
        let record = AgentRecord::new(
            spec.id.clone(),
            spec.capabilities,
            spec.max_concurrent_tasks,
        );
        self.store.register_agent(record).await?;
        self.registry.insert(&spec.id, executor).await;
        self.events.publish(Event::AgentRegistered { agent_id: spec.id });
        Ok(())
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.deregister_agent(agent_id).await?;
        self.registry.remove(agent_id).await;
        self.events.publish(Event::AgentDeregistered {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.store.heartbeat(agent_id).await
    }

    /// Routes a notification through any configured `Notification` hooks and
    /// returns their collected messages.
    pub async fn notify(&self, source: &str, payload: serde_json::Value) -> Result<Vec<String>> {
        self.ensure_running()?;
        let results = self
            .hooks
            .fire(HookEvent::Notification, Some(source), Some(payload), None, None)
            .await;
        Ok(hooks::messages(&results))
    }

    // Observation

    /// Filtered event subscription; an empty kind list receives everything.
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        self.events.subscribe_filtered(kinds)
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        self.store.snapshot().await
    }

    pub async fn system_status(&self) -> Result<SystemStatus> {
        let snapshot = self.store.snapshot().await?;
        let doc = &snapshot.document;

        let agents = doc
            .agents
            .iter()
            .map(|(id, agent)| {
                (
                    id.clone(),
                    AgentStatusSummary {
                        status: agent.status,
                        current_load: agent.current_load,
                        tasks_completed: agent.tasks_completed,
                        tasks_failed: agent.tasks_failed,
                        average_execution_time: agent.average_execution_time,
                    },
                )
            })
            .collect();

        Ok(SystemStatus {
            queue_depth: doc
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .count(),
            in_flight: self.engine.in_flight_count(),
            agents,
            resource_capacity: self.pool.capacity().clone(),
            resource_available: self.pool.available(),
            uptime_seconds: self.start_time.elapsed().as_secs_f64(),
        })
    }

    /// One immediate scheduling pass, useful for embedders driving the
    /// engine manually instead of via `start`.
    pub async fn tick_now(&self) -> Result<usize> {
        self.ensure_running()?;
        self.scheduler.tick().await
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(LoomError::ShuttingDown);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::FnAgent;
    use crate::models::{FeatureCategory, Task};
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    fn test_config() -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    async fn build(dir: &TempDir) -> Supervisor {
        Supervisor::builder(dir.path().join("project.json"), "test")
            .with_config(test_config())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_without_work() {
        let dir = TempDir::new().unwrap();
        let supervisor = build(&dir).await;
        supervisor.start().await.unwrap();
        supervisor.stop(Some(Duration::from_millis(200))).await.unwrap();
    }

    #[tokio::test]
    async fn test_api_refuses_after_stop() {
        let dir = TempDir::new().unwrap();
        let supervisor = build(&dir).await;
        supervisor.start().await.unwrap();
        supervisor.stop(Some(Duration::from_millis(200))).await.unwrap();

        let err = supervisor.create_task(TaskSpec::new("late")).await.unwrap_err();
        assert!(matches!(err, LoomError::ShuttingDown));
        // Stop is idempotent.
        supervisor.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_feature_to_completed_task() {
        let dir = TempDir::new().unwrap();
        let supervisor = build(&dir).await;

        supervisor
            .register_agent(
                AgentSpec::new("A1").with_capabilities(vec!["general".to_string()]),
                Arc::new(FnAgent(|_t: Task| async { Ok(Value::String("done".into())) })),
            )
            .await
            .unwrap();

        let feature_id = supervisor
            .suggest_feature(FeatureRequest {
                title: "Dark mode".to_string(),
                description: "Add a dark theme".to_string(),
                business_value: "Users want it".to_string(),
                category: Some(FeatureCategory::Enhancement),
                metadata: Map::new(),
            })
            .await
            .unwrap();
        supervisor.approve_feature(&feature_id, "tester").await.unwrap();
        let task_id = supervisor
            .create_task_from_feature(
                &feature_id,
                TaskSpec::new("implement dark mode")
                    .with_capabilities(vec!["general".to_string()]),
            )
            .await
            .unwrap();

        let mut done = supervisor.subscribe(&[EventKind::TaskCompleted]);
        supervisor.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), done.recv())
            .await
            .expect("task should complete")
            .unwrap();
        match event {
            Event::TaskCompleted { task_id: completed, .. } => assert_eq!(completed, task_id),
            other => panic!("unexpected event: {other:?}"),
        }

        let status = supervisor.system_status().await.unwrap();
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.agents["A1"].tasks_completed, 1);

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    }
}
