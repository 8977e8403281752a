//! End-to-end scenarios
//!
//! Each test drives the supervisor the way an embedding application would:
//! registered agents, real hook sub-processes, and the scheduler/engine
//! loops running against a temp project file.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::test_helpers::*;
use crate::agents::{AgentSpec, FnAgent};
use crate::events::{Event, EventKind};
use crate::hooks::{HookConfig, HookEvent};
use crate::models::{Priority, Task, TaskSpec, TaskStatus};
use crate::store::ProjectStore;
use crate::LoomError;

/// S1: feature -> approval -> task -> queued/assigned/in_progress/completed,
/// one progress entry per transition, one ledger record.
#[tokio::test]
async fn happy_path_feature_to_completion() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_builder(&dir).build().await.unwrap();
        register_stub_agent(&supervisor, "A1", &["general"], Duration::from_millis(10)).await;

        let feature_id = supervisor.suggest_feature(feature_request("Dark mode")).await.unwrap();
        assert!(feature_id.starts_with("feature_"));
        supervisor.approve_feature(&feature_id, "tester").await.unwrap();

        let task_id = supervisor
            .create_task_from_feature(
                &feature_id,
                TaskSpec::new("Dark mode implementation")
                    .with_capabilities(vec!["general".to_string()]),
            )
            .await
            .unwrap();
        assert!(task_id.starts_with("task_"));

        let mut completed = supervisor.subscribe(&[EventKind::TaskCompleted]);
        supervisor.start().await.unwrap();
        completed.recv().await.unwrap();

        let doc = supervisor.snapshot().await.unwrap().document;
        let task = doc.find_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let transitions: Vec<TaskStatus> =
            task.progress_history.iter().map(|e| e.status).collect();
        assert_eq!(
            transitions,
            vec![TaskStatus::Assigned, TaskStatus::InProgress, TaskStatus::Completed]
        );

        assert_eq!(doc.completed_tasks.len(), 1);
        assert_eq!(doc.completed_tasks[0].task_id, task_id);
        assert_eq!(doc.completed_tasks[0].feature_id, feature_id);

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    })
    .await;
}

/// S2: a dependent task is never assigned before its dependency completes.
#[tokio::test]
async fn dependency_ordering_is_respected() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_builder(&dir).build().await.unwrap();
        register_stub_agent(&supervisor, "A1", &[], Duration::from_millis(10)).await;

        let t1 = supervisor.create_task(TaskSpec::new("t1")).await.unwrap();
        let t2 = supervisor
            .create_task(TaskSpec::new("t2").with_dependencies(vec![t1.clone()]))
            .await
            .unwrap();

        let mut events =
            supervisor.subscribe(&[EventKind::TaskAssigned, EventKind::TaskCompleted]);
        supervisor.start().await.unwrap();

        let mut sequence = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(&event, Event::TaskCompleted { task_id, .. } if *task_id == t2);
            sequence.push(event);
            if done {
                break;
            }
        }

        let t1_completed = sequence
            .iter()
            .position(|e| matches!(e, Event::TaskCompleted { task_id, .. } if *task_id == t1))
            .expect("t1 must complete");
        let t2_assigned = sequence
            .iter()
            .position(|e| matches!(e, Event::TaskAssigned { task_id, .. } if *task_id == t2))
            .expect("t2 must be assigned");
        assert!(
            t1_completed < t2_assigned,
            "t2 was assigned before t1 completed"
        );

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    })
    .await;
}

/// S3: closing a dependency cycle is rejected and leaves the store untouched.
#[tokio::test]
async fn cycle_rejected_at_mutation_time() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_builder(&dir).build().await.unwrap();

        let t1 = supervisor.create_task(TaskSpec::new("t1")).await.unwrap();
        let t2 = supervisor
            .create_task(TaskSpec::new("t2").with_dependencies(vec![t1.clone()]))
            .await
            .unwrap();

        let before = supervisor.snapshot().await.unwrap();
        let err = supervisor.add_task_dependency(&t1, &t2).await.unwrap_err();
        assert!(matches!(err, LoomError::DependencyCycle(_)));

        let after = supervisor.snapshot().await.unwrap();
        assert_eq!(after.version, before.version);
        assert!(after.document.find_task(&t1).unwrap().dependencies.is_empty());
    })
    .await;
}

/// S4: a PreToolUse hook answering block:true fails the task before it ever
/// reaches in_progress.
#[tokio::test]
async fn pre_tool_use_block_fails_task() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_builder(&dir)
            .with_hook(
                HookConfig::new(
                    HookEvent::PreToolUse,
                    r#"echo '{"block":true,"message":"no"}'"#,
                )
                .with_matcher("Bash"),
            )
            .build()
            .await
            .unwrap();
        register_stub_agent(&supervisor, "A1", &[], Duration::from_millis(5)).await;

        let task_id = supervisor.create_task(TaskSpec::new("Bash")).await.unwrap();

        let mut failed = supervisor.subscribe(&[EventKind::TaskFailed]);
        supervisor.start().await.unwrap();
        failed.recv().await.unwrap();

        let task = supervisor.snapshot().await.unwrap().document.find_task(&task_id).unwrap().clone();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.as_deref().unwrap().contains("no"));
        assert!(
            !task
                .progress_history
                .iter()
                .any(|e| e.status == TaskStatus::InProgress),
            "task must never start executing"
        );

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    })
    .await;
}

/// S5: a sleeping agent hits the task timeout on every attempt; the task is
/// retried `max_retries` times and ends failed with last_error "timeout".
#[tokio::test]
async fn timeout_retries_then_fails() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_builder(&dir).build().await.unwrap();
        register_stub_agent(&supervisor, "A1", &[], Duration::from_millis(200)).await;

        let task_id = supervisor
            .create_task(
                TaskSpec::new("slow")
                    .with_timeout_ms(50)
                    .with_max_retries(2),
            )
            .await
            .unwrap();

        let mut failed = supervisor.subscribe(&[EventKind::TaskFailed]);
        supervisor.start().await.unwrap();
        failed.recv().await.unwrap();

        let task = supervisor.snapshot().await.unwrap().document.find_task(&task_id).unwrap().clone();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
        assert_eq!(task.retry_count, 2);

        let attempts = task
            .progress_history
            .iter()
            .filter(|e| e.status == TaskStatus::InProgress)
            .count();
        assert_eq!(attempts, 3, "expected three distinct execution starts");

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    })
    .await;
}

/// S6: two independent store handles (standing in for two processes) mutate
/// the same project file concurrently; both writes land.
#[tokio::test]
async fn concurrent_clients_serialize_on_the_file() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("project.json");

        let store_a = Arc::new(
            ProjectStore::open(&path, "shared", Duration::from_secs(5)).await.unwrap(),
        );
        let store_b = Arc::new(
            ProjectStore::open(&path, "shared", Duration::from_secs(5)).await.unwrap(),
        );

        let a = {
            let store = store_a.clone();
            tokio::spawn(async move { store.suggest_feature(feature_request("from A")).await })
        };
        let b = {
            let store = store_b.clone();
            tokio::spawn(async move { store.suggest_feature(feature_request("from B")).await })
        };
        let id_a = a.await.unwrap().unwrap();
        let id_b = b.await.unwrap().unwrap();
        assert_ne!(id_a, id_b);

        let doc = store_a.snapshot().await.unwrap().document;
        assert_eq!(doc.features.len(), 2);
        assert_eq!(doc.metadata.total_features, 2);
    })
    .await;
}

/// Cancelling an in-progress task interrupts the agent and settles the task
/// as cancelled with its resources returned.
#[tokio::test]
async fn cancel_in_progress_task() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_builder(&dir)
            .with_resource("cpu", 1)
            .build()
            .await
            .unwrap();

        supervisor
            .register_agent(
                AgentSpec::new("A1"),
                Arc::new(FnAgent(|_t: Task| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                })),
            )
            .await
            .unwrap();

        let mut resources = std::collections::BTreeMap::new();
        resources.insert("cpu".to_string(), 1u32);
        let task_id = supervisor
            .create_task(TaskSpec::new("long haul").with_resources(resources))
            .await
            .unwrap();

        let mut started = supervisor.subscribe(&[EventKind::TaskStarted]);
        let mut cancelled = supervisor.subscribe(&[EventKind::TaskCancelled]);
        supervisor.start().await.unwrap();

        started.recv().await.unwrap();
        supervisor.cancel_task(&task_id).await.unwrap();
        cancelled.recv().await.unwrap();

        let task = supervisor.snapshot().await.unwrap().document.find_task(&task_id).unwrap().clone();
        assert_eq!(task.status, TaskStatus::Cancelled);

        let status = supervisor.system_status().await.unwrap();
        assert_eq!(status.resource_available["cpu"], 1);
        assert_eq!(status.agents["A1"].current_load, 0);

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    })
    .await;
}

/// A failed task with recovery enabled spawns exactly one recovery task;
/// its completion promotes the original to recovered.
#[tokio::test]
async fn recovery_task_promotes_original() {
    with_test_timeout(async {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config();
        config.create_recovery_tasks = true;
        let supervisor = supervisor_builder(&dir).with_config(config).build().await.unwrap();

        // Fails on ordinary tasks, succeeds on recovery ones.
        supervisor
            .register_agent(
                AgentSpec::new("A1"),
                Arc::new(FnAgent(|task: Task| async move {
                    if task.title.starts_with("Recover:") {
                        Ok(Value::String("repaired".to_string()))
                    } else {
                        Err(LoomError::ExecutionFailed {
                            task_id: task.id.clone(),
                            message: "deliberate failure".to_string(),
                        })
                    }
                })),
            )
            .await
            .unwrap();

        let task_id = supervisor
            .create_task(
                TaskSpec::new("fragile")
                    .with_priority(Priority::High)
                    .with_max_retries(0),
            )
            .await
            .unwrap();

        let mut recovered = supervisor.subscribe(&[EventKind::TaskRecovered]);
        supervisor.start().await.unwrap();

        let event = recovered.recv().await.unwrap();
        match event {
            Event::TaskRecovered { task_id: original, .. } => assert_eq!(original, task_id),
            other => panic!("unexpected event: {other:?}"),
        }

        let doc = supervisor.snapshot().await.unwrap().document;
        let original = doc.find_task(&task_id).unwrap();
        assert_eq!(original.status, TaskStatus::Recovered);
        assert!(original.completed_at.is_some());

        let recoveries: Vec<_> = doc
            .tasks
            .iter()
            .filter(|t| t.original_task_id.as_deref() == Some(task_id.as_str()))
            .collect();
        assert_eq!(recoveries.len(), 1);
        assert_eq!(recoveries[0].priority, Priority::High.value() - 10);

        supervisor.stop(Some(Duration::from_secs(1))).await.unwrap();
    })
    .await;
}
