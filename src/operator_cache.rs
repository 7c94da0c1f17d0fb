//! Durable per-destination memory of the last operator that worked.
//!
//! Backed by an embedded SQLite store under the cache directory, one
//! row per phone with an expiry stamp. Reads never fail the caller:
//! any storage error degrades to a cache miss with a warning. A
//! disabled cache is a no-op receiver so call sites need no
//! conditionals.

use crate::domain::operator::{CachedOperator, Operator};
use crate::domain_types::PhoneNumber;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default cache location when the config leaves the path unset.
pub const DEFAULT_CACHE_DIR: &str = "~/.modem-test/operator_cache";
const CACHE_FILE: &str = "cache.db";

/// Errors from opening or maintaining the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot resolve cache path {path:?}: {reason}")]
    Path { path: String, reason: String },

    #[error("cache directory {0}: {1}")]
    Directory(PathBuf, std::io::Error),

    #[error("cache store: {0}")]
    Store(#[from] sqlx::Error),
}

/// Cache open settings.
#[derive(Debug, Clone)]
pub struct OperatorCacheConfig {
    /// Cache directory; `~` expands against `$HOME`, relative paths
    /// resolve against the working directory.
    pub path: Option<String>,
    /// Entry lifetime; default 360 days.
    pub ttl: Duration,
    /// Interval between compaction sweeps; default 15 minutes.
    pub sweep_interval: Duration,
}

impl Default for OperatorCacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl: Duration::from_secs(360 * 24 * 3600),
            sweep_interval: Duration::from_secs(15 * 60),
        }
    }
}

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS operator_cache (
            phone TEXT PRIMARY KEY,
            operator_name TEXT NOT NULL,
            operator_prefix TEXT NOT NULL,
            last_success_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )"
    }

    pub(super) fn upsert() -> &'static str {
        "INSERT OR REPLACE INTO operator_cache
            (phone, operator_name, operator_prefix, last_success_at, expires_at)
         VALUES (?, ?, ?, ?, ?)"
    }

    pub(super) fn select_live() -> &'static str {
        "SELECT operator_name, operator_prefix, last_success_at
         FROM operator_cache WHERE phone = ? AND expires_at > ?"
    }

    pub(super) fn delete() -> &'static str {
        "DELETE FROM operator_cache WHERE phone = ?"
    }

    pub(super) fn delete_expired() -> &'static str {
        "DELETE FROM operator_cache WHERE expires_at <= ?"
    }
}

/// Expands a `~`-prefixed path against the current user's home
/// directory; other paths pass through unchanged.
pub fn expand_path(path: &str) -> Result<PathBuf, CacheError> {
    if let Some(rest) = path.strip_prefix("~/").or(if path == "~" { Some("") } else { None }) {
        let home = std::env::var_os("HOME").ok_or_else(|| CacheError::Path {
            path: path.to_string(),
            reason: "HOME is not set".to_string(),
        })?;
        Ok(PathBuf::from(home).join(rest))
    } else {
        Ok(PathBuf::from(path))
    }
}

fn create_private_dir(dir: &Path) -> Result<(), CacheError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| CacheError::Directory(dir.to_path_buf(), e))
}

struct CacheInner {
    pool: SqlitePool,
    ttl: ChronoDuration,
}

/// Last-working-operator store. Construct with [`OperatorCache::open`]
/// or [`OperatorCache::disabled`].
pub struct OperatorCache {
    inner: Option<CacheInner>,
}

impl OperatorCache {
    /// No-op cache used when caching is switched off; all operations
    /// succeed without touching storage.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Opens (creating if needed) the store under the configured
    /// directory.
    pub async fn open(config: &OperatorCacheConfig) -> Result<Self, CacheError> {
        let configured = config.path.as_deref().unwrap_or(DEFAULT_CACHE_DIR);
        let dir = expand_path(configured)?;
        create_private_dir(&dir)?;

        let db_path = dir.join(CACHE_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query(sql::create_table()).execute(&pool).await?;

        let ttl = ChronoDuration::from_std(config.ttl).unwrap_or(ChronoDuration::days(360));
        info!(path = %db_path.display(), ttl_days = ttl.num_days(), "operator cache opened");
        Ok(Self {
            inner: Some(CacheInner { pool, ttl }),
        })
    }

    /// Whether this cache actually persists anything.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Last cached operator for `phone`, if present and unexpired.
    /// Storage errors degrade to `None` with a warning.
    pub async fn get(&self, phone: &PhoneNumber) -> Option<CachedOperator> {
        let inner = self.inner.as_ref()?;
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(sql::select_live())
            .bind(phone.as_ref())
            .bind(&now)
            .fetch_optional(&inner.pool)
            .await;
        match row {
            Ok(Some(row)) => {
                let last_success_at: String = row.get("last_success_at");
                let last_success_at = DateTime::parse_from_rfc3339(&last_success_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Some(CachedOperator {
                    operator_name: row.get("operator_name"),
                    operator_prefix: row.get("operator_prefix"),
                    last_success_at,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%phone, error = %e, "operator cache read failed, treating as miss");
                None
            }
        }
    }

    /// Records `operator` as the last success for `phone`,
    /// overwriting any existing entry and refreshing the TTL.
    pub async fn set(&self, phone: &PhoneNumber, operator: &Operator) -> Result<(), CacheError> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        let now = Utc::now();
        let expires_at = now + inner.ttl;
        sqlx::query(sql::upsert())
            .bind(phone.as_ref())
            .bind(&operator.name)
            .bind(&operator.prefix)
            .bind(now.to_rfc3339())
            .bind(expires_at.to_rfc3339())
            .execute(&inner.pool)
            .await?;
        debug!(%phone, operator = %operator.name, "operator cached");
        Ok(())
    }

    /// Removes the entry for `phone`. Absence is not an error.
    pub async fn delete(&self, phone: &PhoneNumber) -> Result<(), CacheError> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        sqlx::query(sql::delete())
            .bind(phone.as_ref())
            .execute(&inner.pool)
            .await?;
        debug!(%phone, "operator cache entry deleted");
        Ok(())
    }

    /// Deletes expired rows; returns how many were removed.
    pub async fn sweep(&self) -> Result<u64, CacheError> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(0);
        };
        let result = sqlx::query(sql::delete_expired())
            .bind(Utc::now().to_rfc3339())
            .execute(&inner.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Flushes and releases the backing store.
    pub async fn close(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.pool.close().await;
        }
    }
}

/// Periodic compaction loop; runs until cancellation. Sweep errors
/// are logged and do not stop the loop.
pub async fn run_sweeper(
    cache: std::sync::Arc<OperatorCache>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // consume the immediate first tick
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => match cache.sweep().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "operator cache sweep"),
                Err(e) => warn!(error = %e, "operator cache sweep failed"),
            },
            () = token.cancelled() => break,
        }
    }
}
