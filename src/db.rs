use std::future::Future;
use std::time::Duration;

use async_std::task;
use log::*;
use sqlx::any::{AnyPool, AnyPoolOptions};

use crate::config::Settings;
use crate::errors::Result;

/**
 * Bounded retry for transient storage faults
 */
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /**
     * Delay before retry number `attempt` (1-based), doubling each time
     */
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.checked_mul(factor).unwrap_or(self.base_delay)
    }
}

/**
 * Handle on the survey storage
 *
 * The database is the only synchronization point: every mutating operation runs in its own
 * transaction, and nothing authoritative is cached in process.
 */
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) pool: AnyPool,
    pub(crate) retry: RetryPolicy,
}

impl Store {
    pub fn new(pool: AnyPool, retry: RetryPolicy) -> Self {
        Store { pool, retry }
    }

    /**
     * Connect using the configured url and create the schema if it is missing
     */
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.database_url)
            .await?;
        info!("Connected to {:?} database", pool.any_kind());

        crate::schema::migrate(&pool).await?;
        Ok(Store::new(pool, settings.retry.clone()))
    }

    /**
     * Run `op` until it succeeds, fails with a non-retryable error, or the policy runs out of
     * attempts. The closure receives the 0-based attempt number so callers can reconcile state
     * left behind by an earlier, ambiguous attempt.
     */
    pub async fn with_retry<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.attempts => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        name,
                        err,
                        attempt,
                        self.retry.attempts - 1,
                        delay
                    );
                    task::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        error!("{} failed after {} attempts: {}", name, attempt + 1, err);
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

/**
 * A migrated, in-memory SQLite store for tests
 *
 * A single connection that never expires, since each SQLite memory connection is its own
 * database.
 */
#[cfg(test)]
pub async fn test_store() -> Store {
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    crate::schema::migrate(&pool).await.expect("Failed to migrate");
    Store::new(
        pool,
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    )
}

/**
 * A migrated SQLite store in a file under `dir`, with several connections
 *
 * Unlike `test_store()`, concurrent requests against this one overlap inside the database.
 */
#[cfg(test)]
pub async fn pooled_test_store(dir: &tempfile::TempDir) -> Store {
    let settings = Settings {
        database_url: format!("sqlite://{}?mode=rwc", dir.path().join("survey.db").display()),
        listen_addr: "127.0.0.1:0".into(),
        max_connections: 4,
        admin_ids: vec![],
        retry: RetryPolicy {
            attempts: 6,
            base_delay: Duration::from_millis(2),
        },
    };
    Store::connect(&settings)
        .await
        .expect("Failed to open database file")
}
