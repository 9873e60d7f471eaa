//! System-wide constants.

/// Default TCP port for the command center API.
pub const DEFAULT_SERVER_PORT: u16 = 8420;

/// Orchestrator poll interval in seconds.
pub const ORCHESTRATOR_POLL_INTERVAL_SECS: u64 = 5;

/// Seconds without agent activity before a working agent is flagged as stuck.
pub const STUCK_TIMEOUT_SECS: i64 = 300;

/// Maximum agents in {working, spawning} across all projects.
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 3;

/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Captured task output is truncated beyond this many bytes.
pub const OUTPUT_CAPTURE_CAP_BYTES: usize = 1024 * 1024;

/// Marker appended to captured output that hit the cap.
pub const OUTPUT_TRUNCATED_MARKER: &str = "\n...[output truncated]";

/// Log tailer poll interval in milliseconds.
pub const TAILER_POLL_INTERVAL_MS: u64 = 500;

/// Bounded event-bus history length.
pub const EVENT_HISTORY_SIZE: usize = 100;

/// Per-client request budget within any one-second window.
pub const RATE_LIMIT_PER_SECOND: u32 = 10;

/// Per-client request budget within any one-minute window.
pub const RATE_LIMIT_PER_MINUTE: u32 = 60;

/// Idle WebSocket sessions are pinged after this many seconds.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Default port scan range for the port registry.
pub const PORT_RANGE_START: u16 = 3000;
pub const PORT_RANGE_END: u16 = 9000;

/// Ports never handed out by the registry: common databases plus our own.
pub const RESERVED_PORTS: &[u16] = &[
    5432,  // PostgreSQL
    5433,  // PostgreSQL alt
    6379,  // Redis
    8420,  // adt-core server
    27017, // MongoDB
];

/// Grace period between SIGTERM and SIGKILL during shutdown.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Prefix on every issued bearer token.
pub const TOKEN_PREFIX: &str = "adt_";

/// Replacement string for scrubbed secrets.
pub const REDACTED: &str = "[REDACTED]";

/// Default log-read window in lines.
pub const DEFAULT_LOG_LINES: usize = 100;
