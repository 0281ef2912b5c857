use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::LtiError;

/// Strategy for producing nonce values.
///
/// Production uses random ULIDs; tests inject a fixed source so launch
/// messages are deterministic.
pub trait NonceSource: Send + Sync {
    fn generate(&self) -> String;
}

/// Random nonce source used in production
#[derive(Debug, Default)]
pub struct UlidNonceSource;

impl NonceSource for UlidNonceSource {
    fn generate(&self) -> String {
        Ulid::new().to_string()
    }
}

/// Fixed nonce source for deterministic tests
#[derive(Debug)]
pub struct FixedNonceSource(pub String);

impl NonceSource for FixedNonceSource {
    fn generate(&self) -> String {
        self.0.clone()
    }
}

/// SQLite-backed store tracking nonces seen during login exchanges.
///
/// A nonce may be consumed once; seeing it again means a replayed message.
/// No TTL is assumed, callers bound the lifetime with [`cleanup_older_than`].
///
/// [`cleanup_older_than`]: NonceStore::cleanup_older_than
#[derive(Debug, Clone)]
pub struct NonceStore {
    pool: Arc<SqlitePool>,
}

impl NonceStore {
    pub async fn new(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(db_url).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests and local experiments
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS used_nonces (
                nonce TEXT PRIMARY KEY,
                used_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Consume a nonce, rejecting values that were seen before
    pub async fn mark_used(&self, nonce: &str) -> Result<(), LtiError> {
        let result = sqlx::query("INSERT OR IGNORE INTO used_nonces (nonce) VALUES (?)")
            .bind(nonce)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!("Rejected replayed nonce: {}", nonce);
            return Err(LtiError::NonceReused);
        }

        debug!("Marked nonce as used: {}", nonce);
        Ok(())
    }

    /// Whether a nonce has been consumed
    pub async fn find(&self, nonce: &str) -> Result<bool, LtiError> {
        let row = sqlx::query("SELECT nonce FROM used_nonces WHERE nonce = ?")
            .bind(nonce)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// Forget a single nonce
    pub async fn delete(&self, nonce: &str) -> Result<(), LtiError> {
        sqlx::query("DELETE FROM used_nonces WHERE nonce = ?")
            .bind(nonce)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Forget every nonce
    pub async fn clear(&self) -> Result<(), LtiError> {
        sqlx::query("DELETE FROM used_nonces")
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Delete nonces older than the given number of hours
    pub async fn cleanup_older_than(&self, hours: i64) -> Result<u64, LtiError> {
        let result = sqlx::query("DELETE FROM used_nonces WHERE used_at < datetime('now', ?)")
            .bind(format!("-{} hours", hours))
            .execute(&*self.pool)
            .await?;

        let rows_affected = result.rows_affected();
        info!("Cleaned up {} old nonces", rows_affected);

        Ok(rows_affected)
    }
}
