use crate::{constants, LoomError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime tunables for the engine
///
/// Everything here has a default from `constants`; `load` reads `TASKLOOM_*`
/// environment overrides on top. The persisted counterpart governing feature
/// approval lives in the project document as `workflow_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler heartbeat interval; ticks also fire on store mutations.
    pub tick_interval: Duration,
    /// Max assignments per scheduler tick.
    pub assignment_budget: usize,
    /// Wall-clock limit per hook sub-process.
    pub hook_timeout: Duration,
    /// Deadline for acquiring the project-file lock.
    pub lock_timeout: Duration,
    /// Silence after which an agent is considered dead.
    pub heartbeat_timeout: Duration,
    /// How long `stop` waits for in-flight tasks before force-cancelling.
    pub shutdown_grace: Duration,
    /// Create a `recovery` task when a task exhausts its retries.
    pub create_recovery_tasks: bool,
    /// Working directory handed to hook processes.
    pub workspace_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(constants::SCHEDULER_TICK_MS),
            assignment_budget: constants::ASSIGNMENT_BUDGET_PER_TICK,
            hook_timeout: Duration::from_millis(constants::HOOK_TIMEOUT_MS),
            lock_timeout: Duration::from_millis(constants::FILE_LOCK_TIMEOUT_MS),
            heartbeat_timeout: Duration::from_secs(constants::HEARTBEAT_TIMEOUT_SECS as u64),
            shutdown_grace: Duration::from_millis(constants::SHUTDOWN_GRACE_MS),
            create_recovery_tasks: false,
            workspace_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment, falling back to defaults.
    ///
    /// A `.env` file is honored when present. Invalid values are a hard error
    /// rather than a silent fallback.
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let defaults = Self::default();
        let config = Self {
            tick_interval: Duration::from_millis(env_u64(
                "TASKLOOM_TICK_INTERVAL_MS",
                defaults.tick_interval.as_millis() as u64,
            )?),
            assignment_budget: env_u64(
                "TASKLOOM_ASSIGNMENT_BUDGET",
                defaults.assignment_budget as u64,
            )? as usize,
            hook_timeout: Duration::from_millis(env_u64(
                "TASKLOOM_HOOK_TIMEOUT_MS",
                defaults.hook_timeout.as_millis() as u64,
            )?),
            lock_timeout: Duration::from_millis(env_u64(
                "TASKLOOM_LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            )?),
            heartbeat_timeout: Duration::from_secs(env_u64(
                "TASKLOOM_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout.as_secs(),
            )?),
            shutdown_grace: Duration::from_millis(env_u64(
                "TASKLOOM_SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace.as_millis() as u64,
            )?),
            create_recovery_tasks: env_bool(
                "TASKLOOM_CREATE_RECOVERY_TASKS",
                defaults.create_recovery_tasks,
            )?,
            workspace_dir: env::var("TASKLOOM_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(LoomError::Configuration(
                "tick interval must be non-zero".to_string(),
            ));
        }
        if self.assignment_budget == 0 {
            return Err(LoomError::Configuration(
                "assignment budget must be non-zero".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(LoomError::Configuration(
                "lock timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| LoomError::Configuration(format!("{key} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(LoomError::Configuration(format!(
                "{key} must be a boolean, got {raw:?}"
            ))),
        },
        Err(_) => Ok(default),
    }
}
