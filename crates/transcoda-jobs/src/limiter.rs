//! Concurrency limiter for encoder invocations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use transcoda_core::defaults::CONVERSION_MAX_CONCURRENT;
use transcoda_core::{Error, Result};

/// RAII guard for one conversion slot. Dropping it frees the slot.
pub struct ConversionPermit {
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ConversionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPermit").finish()
    }
}

/// Counting semaphore bounding how many conversions run at once.
///
/// Built once at startup and handed to the worker; clones share the same
/// slots.
#[derive(Debug, Clone)]
pub struct ConversionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConversionLimiter {
    /// Create a limiter with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Capacity from `CONVERSION_MAX_CONCURRENT` (default 10).
    pub fn from_env() -> Self {
        let capacity = std::env::var("CONVERSION_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(CONVERSION_MAX_CONCURRENT);
        Self::new(capacity)
    }

    /// Wait until a slot is free.
    pub async fn acquire(&self) -> Result<ConversionPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("conversion limiter closed".into()))?;
        debug!(
            subsystem = "jobs",
            component = "limiter",
            op = "acquire",
            permits_available = self.available(),
            "Conversion permit acquired"
        );
        Ok(ConversionPermit { _permit: permit })
    }

    /// Take a slot without waiting, or fail with `ConcurrencyExhausted`.
    pub fn try_acquire(&self) -> Result<ConversionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(|permit| ConversionPermit { _permit: permit })
            .map_err(|_| Error::ConcurrencyExhausted)
    }

    /// Wait at most `timeout` for a slot.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<ConversionPermit> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(permit) => permit,
            Err(_) => Err(Error::ConcurrencyExhausted),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

impl Default for ConversionLimiter {
    fn default() -> Self {
        Self::new(CONVERSION_MAX_CONCURRENT)
    }
}
