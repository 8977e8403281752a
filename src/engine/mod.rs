//! Execution engine
//!
//! Consumes `TaskAssigned` events and drives each task through its state
//! machine: PreToolUse gate, execution under the task's wall-clock timeout,
//! PostToolUse observation, then a terminal transition or a backoff requeue.
//! Each in-flight task owns a cancellation channel; supervisor shutdown and
//! explicit `CancelTask` calls signal through it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::agents::AgentRegistry;
use crate::config::EngineConfig;
use crate::constants;
use crate::events::{Event, EventBus};
use crate::hooks::{self, HookEvent, HookManager};
use crate::models::{ProgressUpdate, Task, TaskStatus};
use crate::scheduler::ResourcePool;
use crate::store::ProjectStore;
use crate::Result;

enum Outcome {
    Success(Value),
    Failed(String),
    Timeout,
    Cancelled,
}

pub struct ExecutionEngine {
    store: Arc<ProjectStore>,
    registry: Arc<AgentRegistry>,
    hooks: Arc<HookManager>,
    pool: Arc<ResourcePool>,
    events: EventBus,
    config: EngineConfig,
    cancellations: StdMutex<HashMap<String, watch::Sender<bool>>>,
    in_flight: AtomicUsize,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<ProjectStore>,
        registry: Arc<AgentRegistry>,
        hooks: Arc<HookManager>,
        pool: Arc<ResourcePool>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            hooks,
            pool,
            events,
            config,
            cancellations: StdMutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Tasks currently being driven by a worker.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Signals cancellation to an in-flight task. Returns false when the
    /// task is not currently executing here.
    pub fn cancel(&self, task_id: &str) -> bool {
        let cancellations = self.cancellations.lock().expect("cancellation map poisoned");
        match cancellations.get(task_id) {
            Some(token) => {
                info!("Cancellation signalled for task {}", task_id);
                token.send(true).is_ok()
            }
            None => false,
        }
    }

    /// Signals cancellation to everything in flight (forced shutdown).
    pub fn cancel_all(&self) {
        let cancellations = self.cancellations.lock().expect("cancellation map poisoned");
        for (task_id, token) in cancellations.iter() {
            debug!("Force-cancelling task {}", task_id);
            let _ = token.send(true);
        }
    }

    /// 📬 WORKER DISPATCH LOOP: One spawned worker per assignment event
    /// Why: Tasks are independent; a wedged execution must not delay the
    /// dispatch of the next one
    /// Alternative: Fixed worker pool pulling from a queue (rejected: the
    /// agent concurrency caps already bound parallelism, a second cap here
    /// would just add idle workers)
    /// AUDIT CHECKPOINT: The caller hands in an already-live subscription so
    /// no assignment published before startup is missed
    pub async fn run(
        self: Arc<Self>,
        mut assignments: broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Execution engine started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = assignments.recv() => match event {
                    Ok(Event::TaskAssigned { task_id, agent_id }) => {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.handle_assignment(task_id, agent_id).await;
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Engine lagged on event bus, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Execution engine stopped");
    }

    async fn handle_assignment(self: Arc<Self>, task_id: String, agent_id: String) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let task = match self.store.get_task(&task_id).await {
            Ok(task) => task,
            Err(e) => {
                error!("Assigned task {} vanished: {}", task_id, e);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };
        // 📊 RESOURCE ACCOUNTING: The scheduler acquired these units for this
        // assignment; they are released exactly once, whatever path the task
        // takes below
        // Why: Pairing acquire (scheduler) with release (this wrapper) at the
        // assignment boundary is the only spot every exit path flows through
        // Audit: Releasing anywhere inside drive would double-release on error
        let requirements = task.resource_requirements.clone();
        let cancel_rx = self.register_cancellation(&task_id);

        if let Err(e) = self.drive(task, &agent_id, cancel_rx.clone()).await {
            error!("Task {} execution errored: {}", task_id, e);
        }

        self.pool.release(&requirements);
        {
            // A requeued task may already be on its next attempt with a
            // fresh token; only remove the entry if it is still ours.
            let mut cancellations =
                self.cancellations.lock().expect("cancellation map poisoned");
            let ours = cancellations
                .get(&task_id)
                .map(|tx| cancel_rx.same_channel(&tx.subscribe()))
                .unwrap_or(false);
            if ours {
                cancellations.remove(&task_id);
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// 🎬 TASK EXECUTION ORCHESTRATION: Where an assignment becomes work
    /// This is the critical path for every task: hook gate, state
    /// transitions, timed execution, and the success/failure/cancel exits
    /// AUDIT CHECKPOINT: Every exit from this method must leave the task in
    /// a state the scheduler or a human can act on
    async fn drive(
        &self,
        mut task: Task,
        agent_id: &str,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        if task.status != TaskStatus::Assigned {
            debug!("Task {} no longer assigned ({}), skipping", task.id, task.status);
            return Ok(());
        }
        let task_id = task.id.clone();

        // 🛡️ PRE-EXECUTION GATE: Hooks may veto or rewrite the input
        // Why: Vetoing before `in_progress` means a blocked task never
        // consumed an execution attempt and never touched the agent
        // Alternative: Gate inside the agent call (rejected: retries would
        // re-fire a veto that is already final)
        let results = self
            .hooks
            .fire(
                HookEvent::PreToolUse,
                Some(&task.title),
                Some(Value::Object(task.context.clone())),
                None,
                None,
            )
            .await;
        let (blocked, message) = hooks::is_blocked(&results);
        if blocked {
            let error = format!("blocked_by_hook: {}", message.unwrap_or_default());
            warn!("Task {} blocked before start: {}", task_id, error);
            self.store.fail_task(&task_id, &error, "engine").await?;
            self.events.publish(Event::TaskFailed { task_id, error });
            return Ok(());
        }
        if let Some(Value::Object(patch)) = hooks::modified_input(&results) {
            debug!("Task {} input modified by hook", task_id);
            for (key, value) in &patch {
                task.context.insert(key.clone(), value.clone());
            }
            self.store.merge_task_context(&task_id, patch).await?;
        }

        self.store
            .update_task_progress(
                &task_id,
                ProgressUpdate {
                    status: Some(TaskStatus::InProgress),
                    progress_percentage: None,
                    notes: "execution started".to_string(),
                    updated_by: agent_id.to_string(),
                },
            )
            .await?;
        self.events.publish(Event::TaskStarted {
            task_id: task_id.clone(),
            agent_id: agent_id.to_string(),
        });
        let outcome = self.execute(&task, agent_id, cancel_rx.clone()).await;

        match outcome {
            Outcome::Success(result) => {
                // PostToolUse hooks observe the output; they cannot undo a
                // completed execution.
                let post = self
                    .hooks
                    .fire(
                        HookEvent::PostToolUse,
                        Some(&task.title),
                        Some(Value::Object(task.context.clone())),
                        Some(result.clone()),
                        None,
                    )
                    .await;
                for message in hooks::messages(&post) {
                    debug!("PostToolUse for {}: {}", task_id, message);
                }

                let promoted = self.store.complete_task(&task_id, agent_id).await?;
                info!("Task {} completed", task_id);
                self.events.publish(Event::TaskCompleted {
                    task_id: task_id.clone(),
                    result,
                });
                if let Some(original_id) = promoted {
                    self.events.publish(Event::TaskRecovered {
                        task_id: original_id,
                        recovery_task_id: task_id,
                    });
                }
            }
            Outcome::Cancelled => {
                self.store
                    .update_task_progress(
                        &task_id,
                        ProgressUpdate {
                            status: Some(TaskStatus::Cancelled),
                            progress_percentage: None,
                            notes: "cancelled during execution".to_string(),
                            updated_by: "engine".to_string(),
                        },
                    )
                    .await?;
                info!("Task {} cancelled", task_id);
                self.events.publish(Event::TaskCancelled { task_id });
            }
            Outcome::Failed(_) | Outcome::Timeout => {
                let error = match &outcome {
                    Outcome::Timeout => "timeout".to_string(),
                    Outcome::Failed(message) => message.clone(),
                    _ => unreachable!(),
                };
                self.registry.record_failure(agent_id).await;
                self.handle_failure(&task, &error, cancel_rx).await?;
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        task: &Task,
        agent_id: &str,
        cancel_rx: watch::Receiver<bool>,
    ) -> Outcome {
        let executor = match self.registry.get(agent_id).await {
            Some(executor) => executor,
            None => {
                warn!("Agent {} has no executor for task {}", agent_id, task.id);
                return Outcome::Failed("agent executor missing".to_string());
            }
        };

        let timeout = Duration::from_millis(task.timeout_ms);
        tokio::select! {
            _ = wait_cancelled(cancel_rx) => Outcome::Cancelled,
            result = tokio::time::timeout(timeout, executor.execute(task.clone())) => {
                match result {
                    Ok(Ok(value)) => Outcome::Success(value),
                    Ok(Err(e)) => Outcome::Failed(e.short()),
                    Err(_) => {
                        warn!("Task {} hit its {}ms timeout", task.id, task.timeout_ms);
                        Outcome::Timeout
                    }
                }
            }
        }
    }

    /// ❌ FAILURE PATH: Requeue with exponential backoff while retries
    /// remain, otherwise fail terminally and optionally spawn a recovery task
    ///
    /// ⏳ BACKOFF PLACEMENT DECISION: Sleep before the `in_progress -> queued`
    /// transition, not after
    /// Why: A task that is already `queued` is fair game for the very next
    /// tick; holding it `in_progress` is the only ordering the scheduler
    /// cannot defeat
    /// Alternative: A not-before timestamp on the task (rejected: leaks
    /// scheduling policy into the persisted document)
    async fn handle_failure(
        &self,
        task: &Task,
        error: &str,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let task_id = &task.id;

        if task.retry_count < task.max_retries {
            let attempt = task.retry_count + 1;
            let backoff = retry_backoff(attempt);
            info!(
                "Task {} failed ({}), retry {}/{} after {:?}",
                task_id, error, attempt, task.max_retries, backoff
            );

            tokio::select! {
                _ = wait_cancelled(cancel_rx) => {
                    self.store
                        .update_task_progress(
                            task_id,
                            ProgressUpdate {
                                status: Some(TaskStatus::Cancelled),
                                progress_percentage: None,
                                notes: "cancelled while awaiting retry".to_string(),
                                updated_by: "engine".to_string(),
                            },
                        )
                        .await?;
                    self.events.publish(Event::TaskCancelled { task_id: task_id.clone() });
                    return Ok(());
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            let updated = self.store.requeue_for_retry(task_id, error).await?;
            self.events.publish(Event::TaskRequeued {
                task_id: task_id.clone(),
                retry_count: updated.retry_count,
            });
            return Ok(());
        }

        self.store.fail_task(task_id, error, "engine").await?;
        error!("Task {} failed terminally: {}", task_id, error);
        self.events.publish(Event::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
        });

        if self.config.create_recovery_tasks {
            if let Some(recovery) = self.store.create_recovery_task(task_id).await? {
                self.events.publish(Event::TaskCreated {
                    task_id: recovery.id,
                    feature_id: recovery.feature_id,
                });
            }
        }
        Ok(())
    }

    fn register_cancellation(&self, task_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancellations
            .lock()
            .expect("cancellation map poisoned")
            .insert(task_id.to_string(), tx);
        rx
    }
}

/// `min(2^attempt * base, cap)`
fn retry_backoff(attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(16));
    let millis = exp
        .saturating_mul(constants::RETRY_BACKOFF_BASE_MS)
        .min(constants::RETRY_BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// Resolves when cancellation is signalled; pends forever if the sender is
/// gone without ever signalling.
async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_curve() {
        assert_eq!(retry_backoff(1), Duration::from_millis(1_000));
        assert_eq!(retry_backoff(2), Duration::from_millis(2_000));
        assert_eq!(retry_backoff(3), Duration::from_millis(4_000));
        // Capped at 30s no matter the attempt.
        assert_eq!(retry_backoff(10), Duration::from_millis(30_000));
        assert_eq!(retry_backoff(u32::MAX), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_wait_cancelled_resolves_on_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_cancelled(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
