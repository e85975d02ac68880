use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{ensure, Context as _, Result};
use chrono::{DateTime, Utc};
use common::req::{ReadingResponse, SystemStatus};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use log::info;
use uuid::Uuid;

use crate::schema::readings;
use crate::utils::{from_ms, MonotonicClock};

const CREATE_READINGS: &str = "
    CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        gas_value DOUBLE NOT NULL,
        system_status INTEGER NOT NULL CHECK (system_status IN (0, 1, 2)),
        timestamp BIGINT NOT NULL,
        accept_key TEXT NOT NULL UNIQUE
    );
    CREATE INDEX IF NOT EXISTS readings_timestamp_idx ON readings (timestamp, id);
";

pub type RecordId = i32;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The call was abandoned, not cancelled: the write may still commit.
    #[error("store did not answer in time: {0}")]
    Timeout(String),
    #[error("invalid reading: {0}")]
    Invalid(String),
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(
                DatabaseErrorKind::CheckViolation | DatabaseErrorKind::NotNullViolation,
                _,
            ) => StoreError::Invalid(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// A validated reading on its way into the store. `timestamp` and `key` are
/// filled in by the store when the caller did not assign them.
///
/// Appending the same `key` twice stores one row, so an append whose outcome
/// is unknown can be repeated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub gas_value: f64,
    pub system_status: SystemStatus,
    pub timestamp: Option<DateTime<Utc>>,
    pub key: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: RecordId,
    pub gas_value: f64,
    pub system_status: SystemStatus,
    pub timestamp: DateTime<Utc>,
}

impl From<Reading> for ReadingResponse {
    fn from(reading: Reading) -> Self {
        ReadingResponse {
            gas_value: reading.gas_value,
            system_status: reading.system_status,
            timestamp: reading.timestamp,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name=readings)]
struct NewReadingRow {
    gas_value: f64,
    system_status: i32,
    timestamp: i64,
    accept_key: String,
}

#[derive(Debug, Queryable)]
struct ReadingRow {
    id: i32,
    gas_value: f64,
    system_status: i32,
    timestamp: i64,
    #[allow(unused)]
    accept_key: String,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        let system_status = SystemStatus::try_from(row.system_status as i64)
            .map_err(|e| StoreError::Invalid(format!("row {}: {e}", row.id)))?;
        let timestamp = from_ms(row.timestamp).ok_or_else(|| {
            StoreError::Invalid(format!("row {}: timestamp {} out of range", row.id, row.timestamp))
        })?;

        Ok(Reading {
            id: row.id,
            gas_value: row.gas_value,
            system_status,
            timestamp,
        })
    }
}

/// Append-only history of readings.
///
/// Implementations must allow `append` to run concurrently with `latest` and
/// `range`; any locking stays inside the implementation.
pub trait RecordStore: Send + Sync + 'static {
    fn append(
        &self,
        reading: NewReading,
    ) -> impl Future<Output = Result<RecordId, StoreError>> + Send;

    /// Reading with the greatest timestamp, the most recently inserted one on ties.
    fn latest(&self) -> impl Future<Output = Result<Option<Reading>, StoreError>> + Send;

    /// Readings with `start <= timestamp` (and `<= end` if given), ascending.
    /// Every call re-reads the store.
    fn range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<Reading>, StoreError>> + Send;
}

#[derive(Debug)]
struct SqlitePragmas {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        // WAL lets readers proceed while a write is in flight
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL;",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// SQLite-backed [`RecordStore`]. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool<ConnectionManager<SqliteConnection>>,
    clock: Arc<MonotonicClock>,
    timeout: Duration,
}

impl Db {
    pub fn connect(database_url: &str, timeout: Duration) -> Result<Self> {
        ensure!(!timeout.is_zero(), "store timeout must be greater than zero");

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .connection_timeout(timeout)
            .connection_customizer(Box::new(SqlitePragmas {
                busy_timeout: timeout,
            }))
            .build(manager)
            .with_context(|| format!("failed to open database {database_url}"))?;

        let mut conn = pool.get().context("failed to get database connection")?;
        conn.batch_execute(CREATE_READINGS)
            .context("failed to create readings table")?;

        info!("Database ready: {database_url}");

        Ok(Self {
            pool,
            clock: Arc::new(MonotonicClock::new()),
            timeout,
        })
    }

    /// Runs `op` on a pooled connection off the async executor, bounded by
    /// the store timeout.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            op(&mut *conn)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(res)) => res,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
                "database task failed: {join_err}"
            ))),
            Err(_) => Err(StoreError::Timeout(format!(
                "no answer after {:?}",
                self.timeout
            ))),
        }
    }

    fn prepare(&self, reading: &NewReading) -> Result<NewReadingRow, StoreError> {
        if !reading.gas_value.is_finite() {
            return Err(StoreError::Invalid(format!(
                "gas_value must be a finite number, got {}",
                reading.gas_value
            )));
        }

        let timestamp = match reading.timestamp {
            Some(ts) => ts.timestamp_millis(),
            None => self.clock.now_ms(),
        };

        Ok(NewReadingRow {
            gas_value: reading.gas_value,
            system_status: i64::from(reading.system_status) as i32,
            timestamp,
            accept_key: reading.key.unwrap_or_else(Uuid::new_v4).to_string(),
        })
    }
}

impl RecordStore for Db {
    async fn append(&self, reading: NewReading) -> Result<RecordId, StoreError> {
        let row = self.prepare(&reading)?;

        self.run(move |conn| {
            let inserted = diesel::insert_into(readings::table)
                .values(&row)
                .on_conflict(readings::accept_key)
                .do_nothing()
                .returning(readings::id)
                .get_result::<i32>(conn)
                .optional()?;

            match inserted {
                Some(id) => Ok(id),
                // stored by an earlier attempt
                None => Ok(readings::table
                    .filter(readings::accept_key.eq(&row.accept_key))
                    .select(readings::id)
                    .first::<i32>(conn)?),
            }
        })
        .await
    }

    async fn latest(&self) -> Result<Option<Reading>, StoreError> {
        self.run(|conn| {
            let row = readings::table
                .order((readings::timestamp.desc(), readings::id.desc()))
                .first::<ReadingRow>(conn)
                .optional()?;
            row.map(Reading::try_from).transpose()
        })
        .await
    }

    async fn range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Reading>, StoreError> {
        let start_ms = start.timestamp_millis();
        let end_ms = end.map(|t| t.timestamp_millis());

        self.run(move |conn| {
            let mut query = readings::table
                .filter(readings::timestamp.ge(start_ms))
                .into_boxed();
            if let Some(end_ms) = end_ms {
                query = query.filter(readings::timestamp.le(end_ms));
            }

            query
                .order((readings::timestamp.asc(), readings::id.asc()))
                .load::<ReadingRow>(conn)?
                .into_iter()
                .map(Reading::try_from)
                .collect()
        })
        .await
    }
}
