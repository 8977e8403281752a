//! 🎯 TASKLOOM CONSTANTS: System-wide configuration values
//! DECISION ARCHAEOLOGY: Each constant includes reasoning for its specific value
//! AUDIT: Verify these values align with deployment constraints and embedder expectations

// 💾 PERSISTENCE CONFIGURATION
/// 📅 DOCUMENT SCHEMA VERSION: Stamped into `metadata.version` on every write
/// Why: Readers can detect format drift without parsing the whole document
/// Alternative: No version field (rejected: silent incompatibility across releases)
pub const DOCUMENT_VERSION: &str = "1.0.0";

/// 🔒 FILE LOCK TIMEOUT: Hard deadline for acquiring the project-file lock
/// Why: 5s tolerates a slow foreign writer without hanging callers forever
/// Calculation: Largest observed write (~100KB pretty JSON) + fsync ≈ tens of ms, 5s = 50x margin
/// Alternative: Infinite wait (rejected: a wedged process deadlocks every client)
pub const FILE_LOCK_TIMEOUT_MS: u64 = 5_000;

/// ⏱️ LOCK RETRY INTERVAL: Poll cadence while the file lock is contended
/// Why: 50ms keeps contention latency low without hammering the filesystem
/// Calculation: Worst case 100 polls before the 5s deadline fires
/// Alternative: 10ms (rejected: 5x syscall churn), 250ms (rejected: sluggish handoff)
pub const LOCK_RETRY_INTERVAL_MS: u64 = 50;

/// 📅 AUTO-REJECT WINDOW: Hours a feature may sit `suggested` before rejection
/// Why: 72h covers a weekend of reviewer absence before the backlog self-cleans
/// Alternative: 24h (rejected: punishes weekend suggestions), never (rejected: zombie backlog)
pub const DEFAULT_AUTO_REJECT_TIMEOUT_HOURS: i64 = 72;

// ⚙️ TASK EXECUTION CONFIGURATION
/// ⏱️ DEFAULT TASK TIMEOUT: Wall-clock limit for one agent execution
/// Why: 300s fits long compile/test style work while still catching hangs
/// Alternative: 60s (rejected: kills legitimate long tasks), per-task only (rejected: unset tasks hang)
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;

/// 🔁 DEFAULT MAX RETRIES: Attempts before a task is left `failed`
/// Why: 3 retries absorbs transient agent flakiness without masking real bugs
/// Alternative: 0 (rejected: one blip fails the task), 10 (rejected: hides systematic failure)
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 📈 RETRY BACKOFF BASE: Multiplier base for `2^retry_count * base`
/// Why: 500ms start doubles through 1s/2s/4s, spacing retries past transient faults
/// Alternative: 100ms (rejected: retry storm on a down dependency)
pub const RETRY_BACKOFF_BASE_MS: u64 = 500;

/// 🧢 RETRY BACKOFF CAP: Ceiling on the exponential backoff
/// Why: 30s bounds worst-case idle time so a retried task is never parked for minutes
/// Alternative: Uncapped (rejected: 2^n grows past any useful delay by attempt 7)
pub const RETRY_BACKOFF_CAP_MS: u64 = 30_000;

// 🪝 HOOK CONFIGURATION
/// ⏱️ HOOK TIMEOUT: Wall clock for one hook sub-process, stdin write to stdout close
/// Why: 30s allows real work (linters, validators) while bounding a gated task's wait
/// Alternative: 5s (rejected: kills legitimate validators), unbounded (rejected: one hung
/// hook stalls its task forever)
pub const HOOK_TIMEOUT_MS: u64 = 30_000;

// 🗓️ SCHEDULING CONFIGURATION
/// ⏱️ SCHEDULER TICK: Heartbeat interval between full scheduling passes
/// Why: Mutations already trigger immediate ticks; 1s only covers resource-deferred
/// tasks and the heartbeat sweep, so near-idle CPU cost stays negligible
/// Alternative: 100ms (rejected: 10x wakeups for nothing), 10s (rejected: sluggish
/// pickup after resource contention clears)
pub const SCHEDULER_TICK_MS: u64 = 1_000;

/// 🚦 ASSIGNMENT BUDGET: Max bindings performed in a single tick
/// Why: 64 keeps one tick's lock traffic bounded so readers interleave fairly
/// Calculation: 64 assignments × ~1 write each ≈ tens of ms of store time per tick
/// Alternative: Unbounded (rejected: a huge ready set starves other store clients)
pub const ASSIGNMENT_BUDGET_PER_TICK: usize = 64;

/// 👷 DEFAULT AGENT CONCURRENCY: Tasks an agent holds unless its registration says otherwise
/// Why: 1 is the safe default for agents that never declared themselves parallel
/// Alternative: CPU count (rejected: agents are external workers, not our threads)
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 1;

/// 💓 HEARTBEAT TIMEOUT: Silence after which an agent is marked failed
/// Why: 30s = several missed beats, tolerating GC pauses and brief network blips
/// Alternative: 5s (rejected: flappy agents churn their tasks), 5min (rejected: work
/// sits assigned to a corpse)
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 30;

/// 📊 AGENT FAILURE HISTORY: Recent failures remembered per agent for tie-breaks
/// Why: Last 10 is enough signal to prefer the steadier of two otherwise-equal agents
/// Alternative: Full history (rejected: unbounded memory, stale data dominates)
pub const AGENT_FAILURE_HISTORY: usize = 10;

// 🛑 SUPERVISOR CONFIGURATION
/// ⏳ SHUTDOWN GRACE: Wait for in-flight tasks to settle during `stop`
/// Why: 30s matches the hook timeout, the longest single wait a task can be inside
/// Alternative: 0 (rejected: always force-cancels), 5min (rejected: "stop" should stop)
pub const SHUTDOWN_GRACE_MS: u64 = 30_000;

/// 📢 EVENT BUS CAPACITY: Buffered events per subscriber before the slowest one lags
/// Why: 256 rides out bursts (a 64-assignment tick emits well under half that)
/// Alternative: 16 (rejected: observers lag under load), 64K (rejected: memory for nothing)
pub const EVENT_BUS_CAPACITY: usize = 256;

// 🏷️ IDENTIFIER CONFIGURATION
/// 🎲 ID NONCE LENGTH: Base36 characters appended to generated entity ids
/// Why: 9 chars = 36^9 ≈ 10^14 combinations, collision-safe within one millisecond bucket
/// Alternative: 4 (rejected: collision risk under burst creation), 16 (rejected: unwieldy ids)
pub const ID_NONCE_LENGTH: usize = 9;

// 🎚️ SYMBOLIC PRIORITY VALUES: Named points on the 0-100 scale
/// Why: Spread of 20 leaves room for manual fine-tuning between named levels
pub const PRIORITY_CRITICAL: u8 = 100;
pub const PRIORITY_HIGH: u8 = 80;
pub const PRIORITY_NORMAL: u8 = 60;
pub const PRIORITY_LOW: u8 = 40;
pub const PRIORITY_BACKGROUND: u8 = 20;
