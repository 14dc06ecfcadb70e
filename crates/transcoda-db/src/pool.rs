//! PostgreSQL pool sized for the conversion worker.
//!
//! A worker holds connections from two places at once: every running
//! conversion touches the request store when it starts and finishes, and
//! every consumer claims and acks queue messages on its own connection. A
//! pool smaller than both together makes jobs wait on `acquire` inside their
//! deadline, so [`PoolConfig::for_worker`] grows it to fit.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use transcoda_core::{Error, Result};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// How long a query waits for a free connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Load from environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DB_MAX_CONNECTIONS` | `10` | Pool size, raised by workers to fit their concurrency |
    /// | `DB_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free connection |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let positive = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|n| *n > 0)
        };
        Self {
            max_connections: positive("DB_MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: positive("DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        }
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Grow the pool to cover `conversions` concurrent jobs and `consumers`
    /// queue consumers. A larger configured size is kept.
    pub fn for_worker(mut self, conversions: usize, consumers: usize) -> Self {
        let needed = u32::try_from(conversions.saturating_add(consumers)).unwrap_or(u32::MAX);
        if self.max_connections < needed {
            warn!(
                subsystem = "db",
                component = "pool",
                op = "configure",
                configured = self.max_connections,
                needed,
                conversions,
                consumers,
                "DB_MAX_CONNECTIONS below worker concurrency, raising pool size"
            );
            self.max_connections = needed;
        }
        self
    }
}

/// Open a pool and verify the database is reachable.
pub async fn create_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}

/// Snapshot of how many pool connections are open and idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub size: u32,
    pub idle: usize,
}

impl PoolUsage {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle(),
        }
    }

    /// Every open connection is checked out.
    pub fn is_exhausted(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Sample and log pool usage, warning when no connection is idle.
pub fn log_pool_usage(pool: &PgPool) -> PoolUsage {
    let usage = PoolUsage::of(pool);
    if usage.is_exhausted() {
        warn!(
            subsystem = "db",
            component = "pool",
            op = "usage",
            pool_size = usage.size,
            "No idle database connections; jobs are waiting on the pool"
        );
    } else {
        debug!(
            subsystem = "db",
            component = "pool",
            op = "usage",
            pool_size = usage.size,
            pool_idle = usage.idle,
            "Pool usage"
        );
    }
    usage
}
