//! Priority scheduler
//!
//! Binds ready tasks to agents. A tick fires on every store mutation and on
//! a steady interval; each tick walks the ready set in composite priority
//! order, picks the best-fit agent, takes resources non-blockingly, and asks
//! the store for the atomic `queued -> assigned` transition. The scheduler
//! never executes tasks itself.

pub mod resource_pool;

pub use resource_pool::ResourcePool;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::agents::AgentRegistry;
use crate::config::EngineConfig;
use crate::events::{Event, EventBus};
use crate::models::{AgentRecord, AgentState, Task, TaskStatus};
use crate::resolver::{self, DependencyAnalysis};
use crate::store::{ProjectStore, StoreSnapshot};
use crate::Result;

/// 🏗️ ARCHITECTURE DECISION: Scheduler binds, the engine executes
/// Why: Single Responsibility - selection/allocation logic stays testable
/// without spawning a single agent future
/// Alternative: Schedule-and-execute in one loop (rejected: god-loop
/// anti-pattern; cancellation and retries would tangle with selection)
/// Audit: Verify the engine is the only component transitioning past `assigned`
pub struct Scheduler {
    store: Arc<ProjectStore>,
    registry: Arc<AgentRegistry>,
    pool: Arc<ResourcePool>,
    events: EventBus,
    config: EngineConfig,
    /// Resolver output memoized by store version.
    analysis_cache: Mutex<Option<(u64, Arc<DependencyAnalysis>)>>,
    /// Store version whose cycle report was already published.
    cycles_reported_at: Mutex<Option<u64>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<ProjectStore>,
        registry: Arc<AgentRegistry>,
        pool: Arc<ResourcePool>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pool,
            events,
            config,
            analysis_cache: Mutex::new(None),
            cycles_reported_at: Mutex::new(None),
        }
    }

    /// Drives ticks until shutdown. Mutation-triggered ticks piggyback on
    /// the store's version channel; the interval covers retries after
    /// resource contention and the heartbeat sweep.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started");
        let mut version_rx = self.store.watch_version();
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat_sweep().await {
                        error!("Heartbeat sweep failed: {}", e);
                    }
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// One scheduling pass. Returns the number of assignments made.
    pub async fn tick(&self) -> Result<usize> {
        let snapshot = self.store.snapshot().await?;
        let analysis = self.analysis_for(&snapshot).await;

        if analysis.has_cycles {
            self.report_cycles(&snapshot, &analysis).await?;
        }

        let doc = &snapshot.document;
        let dependents = resolver::dependent_counts(&doc.tasks);

        let ready: HashSet<&str> = analysis.ready_tasks.iter().map(String::as_str).collect();
        let mut candidates: Vec<&Task> = doc
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && ready.contains(t.id.as_str()))
            .collect();
        // 🎯 COMPOSITE PRIORITY ORDER: priority desc, dependents desc, age asc, id asc
        // Why: Dependent count is critical-path weight - unblocking the task the
        // most others wait on shortens the whole run; the id tail makes the order
        // total so two ticks over the same snapshot agree
        // Alternative: Priority alone (rejected: starves bottleneck tasks behind
        // equal-priority leaf work)
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    dependents
                        .get(&b.id)
                        .unwrap_or(&0)
                        .cmp(dependents.get(&a.id).unwrap_or(&0))
                })
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let executors = self.registry.executor_ids().await;
        let failures = self.registry.failure_counts().await;
        let mut local_load: HashMap<String, usize> = doc
            .agents
            .values()
            .map(|a| (a.id.clone(), a.current_load))
            .collect();

        let mut assigned = 0usize;
        for task in candidates {
            if assigned >= self.config.assignment_budget {
                debug!("Assignment budget exhausted for this tick");
                break;
            }

            let Some(agent_id) =
                best_fit_agent(doc.agents.values(), task, &executors, &failures, &local_load)
            else {
                continue;
            };

            // 🚦 NON-BLOCKING ALLOCATION: Take the units or skip the task
            // Why: A tick must never park waiting on resources; a deferred
            // task stays ready and the next tick retries for free
            // Alternative: Block until available (rejected: one greedy task
            // stalls every assignment behind it)
            if !self.pool.try_acquire(&task.resource_requirements) {
                debug!("Task {} deferred, resources unavailable", task.id);
                continue;
            }

            // 💾 ATOMIC BINDING: The store re-validates every precondition
            // under its lock before transitioning queued -> assigned
            // Why: Our snapshot is stale the moment we took it; the store is
            // the only judge of assignability
            // Audit: On failure the acquired units MUST go back or the pool leaks
            match self.store.assign_task(&task.id, &agent_id).await {
                Ok(_) => {
                    *local_load.entry(agent_id.clone()).or_default() += 1;
                    assigned += 1;
                    self.events.publish(Event::TaskAssigned {
                        task_id: task.id.clone(),
                        agent_id,
                    });
                }
                Err(e) => {
                    // Lost a race with another mutation; put the units back.
                    self.pool.release(&task.resource_requirements);
                    debug!("Assignment of {} fell through: {}", task.id, e);
                }
            }
        }

        if assigned > 0 {
            debug!("Tick assigned {} task(s)", assigned);
        }
        Ok(assigned)
    }

    /// Marks agents silent past the heartbeat timeout as failed; the store
    /// requeues whatever they held.
    pub async fn heartbeat_sweep(&self) -> Result<()> {
        let expired = self.store.expire_agents(self.config.heartbeat_timeout).await?;
        for agent_id in expired {
            self.events.publish(Event::AgentFailed { agent_id });
        }
        Ok(())
    }

    async fn analysis_for(&self, snapshot: &StoreSnapshot) -> Arc<DependencyAnalysis> {
        let mut cache = self.analysis_cache.lock().await;
        if let Some((version, analysis)) = cache.as_ref() {
            if *version == snapshot.version {
                return analysis.clone();
            }
        }
        let analysis = Arc::new(resolver::analyze(
            &snapshot.document.tasks,
            self.pool.capacity(),
        ));
        *cache = Some((snapshot.version, analysis.clone()));
        analysis
    }

    /// Cycles surviving creation-time checks are an integrity violation, not
    /// a crash: park the members as blocked and tell the observers, once per
    /// document version.
    async fn report_cycles(
        &self,
        snapshot: &StoreSnapshot,
        analysis: &DependencyAnalysis,
    ) -> Result<()> {
        {
            let mut reported = self.cycles_reported_at.lock().await;
            if *reported == Some(snapshot.version) {
                return Ok(());
            }
            *reported = Some(snapshot.version);
        }

        let cyclic = analysis.cyclic_task_ids();
        warn!("Dependency cycles detected across {} task(s)", cyclic.len());
        let (newly_blocked, unblocked) = self.store.sync_blocked(&cyclic).await?;

        for task_id in &newly_blocked {
            self.events.publish(Event::TaskBlocked {
                task_id: task_id.clone(),
                reason: "cyclic_dependency".to_string(),
            });
        }
        for task_id in unblocked {
            self.events.publish(Event::TaskRequeued {
                task_id,
                retry_count: 0,
            });
        }
        if !newly_blocked.is_empty() {
            self.events.publish(Event::IntegrityViolation {
                task_ids: newly_blocked,
                detail: "cyclic_dependency".to_string(),
            });
        }
        Ok(())
    }
}

/// 🔍 BEST-FIT SELECTION: The agent must be live, under its cap, capable,
/// and have an executor; ties go to the least loaded, then fewest recent
/// failures, then the stalest heartbeat
/// Why: Load first spreads work, failure history steers around flaky agents,
/// and the heartbeat tail keeps the order deterministic
/// Alternative: Round-robin (rejected: ignores capability mismatch and load skew)
fn best_fit_agent<'a>(
    agents: impl Iterator<Item = &'a AgentRecord>,
    task: &Task,
    executors: &HashSet<String>,
    failures: &HashMap<String, usize>,
    local_load: &HashMap<String, usize>,
) -> Option<String> {
    agents
        .filter(|a| matches!(a.status, AgentState::Active | AgentState::Idle))
        .filter(|a| executors.contains(&a.id))
        .filter(|a| {
            local_load.get(&a.id).copied().unwrap_or(a.current_load) < a.max_concurrent_tasks
        })
        .filter(|a| a.covers(&task.required_capabilities))
        .min_by_key(|a| {
            (
                local_load.get(&a.id).copied().unwrap_or(a.current_load),
                failures.get(&a.id).copied().unwrap_or(0),
                a.last_heartbeat,
                a.id.clone(),
            )
        })
        .map(|a| a.id.clone())
}
