//! # transcoda-db
//!
//! PostgreSQL and filesystem adapters for transcoda.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgJobStore`]: audio and request records with checked status transitions
//! - [`PgUserStore`]: user accounts
//! - [`PgJobQueue`]: durable at-least-once job queue with lease-based redelivery
//! - [`FilesystemObjectStore`]: object storage with HMAC-signed download URLs
//!
//! ## Example
//!
//! ```rust,ignore
//! use transcoda_db::{Database, JobStore, QueueConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/transcoda").await?;
//!     let queue = db.queue(QueueConfig::default());
//!     let history = db.requests.get_request_history(user_id).await?;
//!     Ok(())
//! }
//! ```
pub mod object_store;
pub mod pool;
pub mod queue;
pub mod requests;
pub mod users;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use transcoda_core::*;

pub use object_store::{FilesystemObjectStore, ObjectStoreConfig};
pub use pool::{create_pool, log_pool_usage, PoolConfig, PoolUsage};
pub use queue::{PgJobQueue, QueueConfig};
pub use requests::PgJobStore;
pub use users::PgUserStore;

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub requests: PgJobStore,
    pub users: PgUserStore,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            requests: PgJobStore::new(pool.clone()),
            users: PgUserStore::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the default pool configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Queue handle sharing this database's pool.
    pub fn queue(&self, config: QueueConfig) -> PgJobQueue {
        PgJobQueue::new(self.pool.clone(), config)
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Sample and log connection pool usage.
    pub fn log_pool_usage(&self) -> PoolUsage {
        log_pool_usage(&self.pool)
    }
}
