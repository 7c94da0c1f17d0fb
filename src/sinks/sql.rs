//! SQL sinks for PostgreSQL, MySQL, and SQLite.
//!
//! The schema is auto-created on open with a superset of the columns
//! any record can carry; inserts run under a 10 second timeout so a
//! stalled database cannot wedge the collector.

use super::{FlatRecord, ResultSink, SinkError};
use crate::domain::job::ResultEnvelope;
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::time::Duration;
use tracing::info;

const TABLE: &str = "test_results";
const INSERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which SQL flavor backs the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBackend {
    Postgres,
    Mysql,
    Sqlite,
}

impl SqlBackend {
    fn sink_name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

mod schema {
    use super::TABLE;

    fn columns(id_type: &str, float_type: &str) -> String {
        format!(
            "id {id_type} PRIMARY KEY,
             timestamp TEXT NOT NULL,
             modem TEXT NOT NULL,
             phone TEXT NOT NULL,
             address TEXT,
             test_num BIGINT NOT NULL,
             intermediate BOOLEAN NOT NULL,
             operator_name TEXT,
             operator_prefix TEXT,
             success BOOLEAN NOT NULL,
             window_closed BOOLEAN NOT NULL,
             message TEXT,
             dial_ms BIGINT,
             handshake_ms BIGINT,
             connect_speed TEXT,
             peer_address TEXT,
             peer_system TEXT,
             peer_mailer TEXT,
             rx_speed_bps BIGINT,
             tx_speed_bps BIGINT,
             snr_db {float_type},
             cdr_disposition TEXT,
             cdr_hangup_cause BIGINT,
             cdr_billsec BIGINT,
             cdr_duration BIGINT,
             cdr_trunk TEXT,
             voip_status TEXT"
        )
    }

    pub(super) fn create_table(backend: super::SqlBackend) -> String {
        let body = match backend {
            super::SqlBackend::Mysql => columns("VARCHAR(36)", "DOUBLE"),
            _ => columns("TEXT", "DOUBLE PRECISION"),
        };
        format!("CREATE TABLE IF NOT EXISTS {TABLE} ({body})")
    }

    pub(super) fn insert(backend: super::SqlBackend) -> String {
        let placeholders: Vec<String> = match backend {
            super::SqlBackend::Postgres => (1..=27).map(|i| format!("${i}")).collect(),
            _ => std::iter::repeat_n("?".to_string(), 27).collect(),
        };
        format!(
            "INSERT INTO {TABLE} (id, timestamp, modem, phone, address, test_num, intermediate, \
             operator_name, operator_prefix, success, window_closed, message, dial_ms, \
             handshake_ms, connect_speed, peer_address, peer_system, peer_mailer, rx_speed_bps, \
             tx_speed_bps, snr_db, cdr_disposition, cdr_hangup_cause, cdr_billsec, cdr_duration, \
             cdr_trunk, voip_status) VALUES ({})",
            placeholders.join(", ")
        )
    }
}

enum SinkPool {
    Postgres(PgPool),
    Mysql(MySqlPool),
    Sqlite(SqlitePool),
}

/// One SQL-backed sink.
pub struct SqlSink {
    backend: SqlBackend,
    pool: SinkPool,
    insert_sql: String,
}

impl SqlSink {
    /// Connects and ensures the table exists. `target` is a DSN for
    /// the server backends and a file path for SQLite.
    pub async fn connect(backend: SqlBackend, target: &str) -> Result<Self, SinkError> {
        let pool = match backend {
            SqlBackend::Postgres => SinkPool::Postgres(
                PgPoolOptions::new().max_connections(4).connect(target).await?,
            ),
            SqlBackend::Mysql => SinkPool::Mysql(
                MySqlPoolOptions::new().max_connections(4).connect(target).await?,
            ),
            SqlBackend::Sqlite => {
                let options = SqliteConnectOptions::new()
                    .filename(target)
                    .create_if_missing(true);
                SinkPool::Sqlite(
                    SqlitePoolOptions::new()
                        .max_connections(4)
                        .connect_with(options)
                        .await?,
                )
            }
        };

        let create = schema::create_table(backend);
        match &pool {
            SinkPool::Postgres(p) => {
                sqlx::query(&create).execute(p).await?;
            }
            SinkPool::Mysql(p) => {
                sqlx::query(&create).execute(p).await?;
            }
            SinkPool::Sqlite(p) => {
                sqlx::query(&create).execute(p).await?;
            }
        }
        info!(backend = backend.sink_name(), "sql sink opened");

        Ok(Self {
            backend,
            pool,
            insert_sql: schema::insert(backend),
        })
    }

    async fn insert(&self, id: &str, rec: &FlatRecord) -> Result<(), SinkError> {
        macro_rules! bind_all {
            ($query:expr) => {
                $query
                    .bind(id)
                    .bind(&rec.timestamp)
                    .bind(&rec.modem)
                    .bind(&rec.phone)
                    .bind(&rec.address)
                    .bind(rec.test_num)
                    .bind(rec.intermediate)
                    .bind(&rec.operator_name)
                    .bind(&rec.operator_prefix)
                    .bind(rec.success)
                    .bind(rec.window_closed)
                    .bind(&rec.message)
                    .bind(rec.dial_ms)
                    .bind(rec.handshake_ms)
                    .bind(&rec.connect_speed)
                    .bind(&rec.peer_address)
                    .bind(&rec.peer_system)
                    .bind(&rec.peer_mailer)
                    .bind(rec.rx_speed_bps)
                    .bind(rec.tx_speed_bps)
                    .bind(rec.snr_db)
                    .bind(&rec.cdr_disposition)
                    .bind(rec.cdr_hangup_cause)
                    .bind(rec.cdr_billsec)
                    .bind(rec.cdr_duration)
                    .bind(&rec.cdr_trunk)
                    .bind(&rec.voip_status)
            };
        }

        match &self.pool {
            SinkPool::Postgres(pool) => {
                bind_all!(sqlx::query(&self.insert_sql)).execute(pool).await?;
            }
            SinkPool::Mysql(pool) => {
                bind_all!(sqlx::query(&self.insert_sql)).execute(pool).await?;
            }
            SinkPool::Sqlite(pool) => {
                bind_all!(sqlx::query(&self.insert_sql)).execute(pool).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSink for SqlSink {
    fn name(&self) -> &str {
        self.backend.sink_name()
    }

    async fn write_record(&self, record: &ResultEnvelope) -> Result<(), SinkError> {
        let flat = FlatRecord::from(record);
        let id = record.id.to_string();
        tokio::time::timeout(INSERT_TIMEOUT, self.insert(&id, &flat))
            .await
            .map_err(|_| SinkError::Timeout)?
    }

    async fn close(&self) -> Result<(), SinkError> {
        match &self.pool {
            SinkPool::Postgres(pool) => pool.close().await,
            SinkPool::Mysql(pool) => pool.close().await,
            SinkPool::Sqlite(pool) => pool.close().await,
        }
        Ok(())
    }
}
