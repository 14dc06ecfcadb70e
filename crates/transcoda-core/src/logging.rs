//! Structured logging field names for transcoda.
//!
//! The shared vocabulary of `tracing` field keys, so log aggregation can
//! query the same keys across the submission path, the queue, and workers.
//! Call sites spell the key as a literal identifier (`request_id = %id`);
//! these constants are the reference list that code review and log queries
//! check those literals against. Every name here is emitted somewhere.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | A job failed, or a compensation step itself failed |
//! | WARN  | Recoverable issue (redelivery, malformed message, exhausted pool, clamped config) |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Pipeline step boundaries, claimed/acked messages |
//! | TRACE | Per-poll queue activity |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "queue", "storage", "jobs", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "converter", "worker", "limiter", "encoder"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "create_request", "claim", "ack", "encode", "compensate"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Conversion request UUID.
pub const REQUEST_ID: &str = "request_id";

/// Source file id (object key stem of the uploaded source).
pub const FILE_ID: &str = "file_id";

/// Generated target file id.
pub const TARGET_ID: &str = "target_id";

/// Queue message id.
pub const MESSAGE_ID: &str = "message_id";

/// Queue consumer tag.
pub const CONSUMER: &str = "consumer";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Bytes moved to or from the object store.
pub const BYTES: &str = "bytes";

/// Limiter permits currently available.
pub const PERMITS_AVAILABLE: &str = "permits_available";

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Every key above, in declaration order.
pub const ALL_FIELDS: &[&str] = &[
    SUBSYSTEM,
    COMPONENT,
    OPERATION,
    REQUEST_ID,
    FILE_ID,
    TARGET_ID,
    MESSAGE_ID,
    CONSUMER,
    DURATION_MS,
    BYTES,
    PERMITS_AVAILABLE,
    POOL_SIZE,
    POOL_IDLE,
    ERROR_MSG,
];
