//! Shared fixtures for the scenario and property suites

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

use crate::agents::{AgentSpec, FnAgent};
use crate::config::EngineConfig;
use crate::models::{FeatureCategory, FeatureRequest, Task};
use crate::supervisor::{Supervisor, SupervisorBuilder};

/// Upper bound for any single integration test.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a future under the suite-wide timeout so a wedged engine fails the
/// test instead of hanging the run.
pub async fn with_test_timeout<F, T>(future: F) -> T
where
    F: Future<Output = T>,
{
    timeout(DEFAULT_TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}

/// Engine config tuned for fast test turnaround.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        tick_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

/// Installs a log subscriber honoring `RUST_LOG`; repeated calls are no-ops.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder over a fresh temp project file with the fast config applied.
pub fn supervisor_builder(dir: &TempDir) -> SupervisorBuilder {
    init_test_logging();
    Supervisor::builder(dir.path().join("project.json"), "test-project")
        .with_config(fast_config())
}

pub fn feature_request(title: &str) -> FeatureRequest {
    FeatureRequest {
        title: title.to_string(),
        description: "generated by the test suite".to_string(),
        business_value: "keeps the tests honest".to_string(),
        category: Some(FeatureCategory::Enhancement),
        metadata: Map::new(),
    }
}

/// Registers a stub agent whose executor succeeds after `delay`.
pub async fn register_stub_agent(
    supervisor: &Supervisor,
    id: &str,
    capabilities: &[&str],
    delay: Duration,
) {
    supervisor
        .register_agent(
            AgentSpec::new(id)
                .with_capabilities(capabilities.iter().map(|s| s.to_string()).collect()),
            Arc::new(FnAgent(move |_task: Task| async move {
                tokio::time::sleep(delay).await;
                Ok(Value::String("ok".to_string()))
            })),
        )
        .await
        .expect("agent registration should succeed");
}
