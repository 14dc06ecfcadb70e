//! Centralized default constants for transcoda.
//!
//! Every crate and the CLI reference these instead of defining their own
//! magic numbers. Environment variables documented on the `from_env()`
//! constructors override them.

// =============================================================================
// QUEUE
// =============================================================================

/// Name of the durable queue shared by producers and consumers.
pub const QUEUE_NAME: &str = "conversion_requests";

/// Unacknowledged deliveries a single consumer may hold.
pub const QUEUE_PREFETCH: usize = 1;

/// Seconds a claimed message stays invisible before it is redelivered.
///
/// Must exceed `CONVERSION_TIMEOUT_SECS` so a live job is never redelivered.
pub const QUEUE_LEASE_SECS: u64 = 1800;

/// Safety-net poll interval for the PostgreSQL queue in milliseconds.
pub const QUEUE_POLL_INTERVAL_MS: u64 = 500;

// =============================================================================
// CONVERSION
// =============================================================================

/// Maximum encoder invocations running at once within a process.
pub const CONVERSION_MAX_CONCURRENT: usize = 10;

/// Deadline for one job's download → encode → upload → record pipeline.
pub const CONVERSION_TIMEOUT_SECS: u64 = 600;

/// Encoder executable.
pub const ENCODER_PROGRAM: &str = "ffmpeg";

/// Encoder argument template; `{input}` and `{output}` are substituted.
pub const ENCODER_ARGS: &[&str] = &["-nostdin", "-y", "-i", "{input}", "{output}"];

/// Subdirectory of the system temp dir used for local scratch files.
pub const SCRATCH_SUBDIR: &str = "transcoda";

// =============================================================================
// STORAGE
// =============================================================================

/// Presigned download URL lifetime in seconds (15 minutes).
pub const PRESIGN_TTL_SECS: u64 = 900;

/// Default object storage root directory.
pub const STORAGE_PATH: &str = "/var/lib/transcoda/objects";

/// Default public base URL used when building presigned URLs.
pub const STORAGE_PUBLIC_URL: &str = "http://localhost:8000/objects";

// =============================================================================
// EVENTS
// =============================================================================

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;
