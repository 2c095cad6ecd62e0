use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Account, Device, DeviceFilter, Reading, ReadingFilter, RegistrationState};
use crate::store::{AccountStore, DeviceStore, ReadingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn make_pool(database_url: &str, timeout: Duration) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(timeout)
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed store. Every call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        bounded(self.timeout, op, fut).await
    }
}

/// Runs one storage call under `timeout`. Expiry becomes `StorageTimeout`;
/// losing the pool or the connection becomes `StorageUnavailable`.
pub(crate) async fn bounded<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            let e = match e {
                Error::Database(
                    db_err @ (sqlx::Error::PoolClosed
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::Io(_)),
                ) => Error::StorageUnavailable(db_err.to_string()),
                other => other,
            };
            if e.is_transient() {
                DB_FAILURES_TOTAL.inc();
                warn!("Transient database failure during {}: {}", op, e);
            }
            Err(e)
        }
        Err(_) => {
            DB_FAILURES_TOTAL.inc();
            warn!("Database {} timed out after {:?}", op, timeout);
            Err(Error::StorageTimeout(timeout))
        }
    }
}

/// `LIMIT`/`OFFSET` are `BIGINT` in Postgres.
fn sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    owner_id: Option<String>,
    registration_state: String,
    display_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let registration_state = row
            .registration_state
            .parse::<RegistrationState>()
            .map_err(|e| Error::Database(sqlx::Error::Decode(e.into())))?;

        let device = Device {
            device_id: row.device_id,
            owner_id: row.owner_id,
            registration_state,
            display_name: row.display_name,
            created_at: row.created_at,
        };

        if !device.is_consistent() {
            return Err(Error::Database(sqlx::Error::Decode(
                format!(
                    "device {} is {} but owner is {:?}",
                    device.device_id, device.registration_state, device.owner_id
                )
                .into(),
            )));
        }

        Ok(device)
    }
}

const DEVICE_COLUMNS: &str = "device_id, owner_id, registration_state, display_name, created_at";

#[async_trait]
impl DeviceStore for PgStore {
    async fn insert_device_if_absent(&self, device: &Device) -> Result<bool> {
        self.timed("insert_device", async {
            let result = sqlx::query(
                r#"
                INSERT INTO devices (device_id, owner_id, registration_state, display_name, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (device_id) DO NOTHING
                "#,
            )
            .bind(&device.device_id)
            .bind(&device.owner_id)
            .bind(device.registration_state.as_str())
            .bind(&device.display_name)
            .bind(device.created_at)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        self.timed("find_device", async {
            let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
            let row = sqlx::query_as::<_, DeviceRow>(&query)
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;

            row.map(Device::try_from).transpose()
        })
        .await
    }

    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        self.timed("find_devices", async {
            let mut conditions = Vec::new();
            let mut binds: Vec<&str> = Vec::new();

            if let Some(user_id) = &filter.user_id {
                binds.push(user_id);
                conditions.push(format!(
                    "owner_id = ${} AND registration_state = 'registered'",
                    binds.len()
                ));
            }

            if let Some(device_id) = &filter.device_id {
                binds.push(device_id);
                conditions.push(format!("device_id = ${}", binds.len()));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", conditions.join(" AND "))
            };

            let query = format!(
                "SELECT {} FROM devices {} ORDER BY device_id",
                DEVICE_COLUMNS, where_clause
            );

            let mut query_builder = sqlx::query_as::<_, DeviceRow>(&query);
            for value in binds {
                query_builder = query_builder.bind(value);
            }

            query_builder
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(Device::try_from)
                .collect()
        })
        .await
    }

    async fn claim_device(
        &self,
        device_id: &str,
        owner_id: &str,
        display_name: Option<&str>,
    ) -> Result<u64> {
        // Concurrent claims on the same row serialize on its lock; the loser
        // re-evaluates the owner condition and matches nothing.
        self.timed("claim_device", async {
            let result = sqlx::query(
                r#"
                UPDATE devices
                SET owner_id = $2,
                    registration_state = 'registered',
                    display_name = COALESCE($3, display_name)
                WHERE device_id = $1 AND (owner_id IS NULL OR owner_id = $2)
                "#,
            )
            .bind(device_id)
            .bind(owner_id)
            .bind(display_name)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        })
        .await
    }

    async fn release_device(&self, device_id: &str, expected_owner: Option<&str>) -> Result<u64> {
        self.timed("release_device", async {
            let result = sqlx::query(
                r#"
                UPDATE devices
                SET owner_id = NULL, registration_state = 'unclaimed'
                WHERE device_id = $1
                  AND ($2::text IS NULL OR owner_id IS NULL OR owner_id = $2)
                "#,
            )
            .bind(device_id)
            .bind(expected_owner)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        })
        .await
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }

        self.timed("insert_readings", async {
            let device_ids: Vec<&str> = readings.iter().map(|r| r.device_id.as_str()).collect();
            let owner_ids: Vec<Option<&str>> =
                readings.iter().map(|r| r.owner_id.as_deref()).collect();
            let timestamps: Vec<DateTime<Utc>> = readings.iter().map(|r| r.timestamp).collect();
            let temperatures: Vec<f64> = readings.iter().map(|r| r.temperature).collect();
            let humidities: Vec<f64> = readings.iter().map(|r| r.humidity).collect();
            let luminosities: Vec<i64> = readings.iter().map(|r| r.luminosity).collect();

            // One statement, so a batch lands entirely or not at all
            let query = r#"
                INSERT INTO readings (device_id, owner_id, ts, temperature, humidity, luminosity)
                SELECT device_id, owner_id, ts, temperature, humidity, luminosity
                FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::float8[], $5::float8[], $6::int8[])
                    WITH ORDINALITY AS t(device_id, owner_id, ts, temperature, humidity, luminosity, ord)
                ORDER BY ord
                "#;

            sqlx::query(query)
                .bind(&device_ids)
                .bind(&owner_ids)
                .bind(&timestamps)
                .bind(&temperatures)
                .bind(&humidities)
                .bind(&luminosities)
                .execute(&self.pool)
                .await?;

            debug!("Inserted {} readings", readings.len());
            Ok(())
        })
        .await
    }

    async fn find_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>> {
        self.timed("find_readings", async {
            let mut conditions = Vec::new();
            let mut param = 0;

            if filter.user_id.is_some() {
                param += 1;
                conditions.push(format!(
                    "device_id IN (SELECT device_id FROM devices WHERE owner_id = ${})",
                    param
                ));
            }

            if filter.device_id.is_some() {
                param += 1;
                conditions.push(format!("device_id = ${}", param));
            }

            if filter.start.is_some() {
                param += 1;
                conditions.push(format!("ts >= ${}", param));
            }

            if filter.end.is_some() {
                param += 1;
                conditions.push(format!("ts <= ${}", param));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", conditions.join(" AND "))
            };

            // LIMIT NULL is no limit
            let query = format!(
                "SELECT device_id, owner_id, temperature, humidity, luminosity, ts AS timestamp
                 FROM readings
                 {}
                 ORDER BY ts, id
                 LIMIT ${} OFFSET ${}",
                where_clause,
                param + 1,
                param + 2
            );

            // Bind in the same order the placeholders were numbered
            let mut query_builder = sqlx::query_as::<_, Reading>(&query);
            if let Some(user_id) = &filter.user_id {
                query_builder = query_builder.bind(user_id);
            }
            if let Some(device_id) = &filter.device_id {
                query_builder = query_builder.bind(device_id);
            }
            if let Some(start) = &filter.start {
                query_builder = query_builder.bind(start);
            }
            if let Some(end) = &filter.end {
                query_builder = query_builder.bind(end);
            }
            query_builder = query_builder
                .bind(filter.limit.map(sql_count))
                .bind(sql_count(filter.offset.unwrap_or(0)));

            Ok(query_builder.fetch_all(&self.pool).await?)
        })
        .await
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn find_account(&self, username: &str) -> Result<Option<Account>> {
        self.timed("find_account", async {
            let account = sqlx::query_as::<_, Account>(
                "SELECT username, credential_hash, created_at FROM accounts WHERE username = $1",
            )
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

            Ok(account)
        })
        .await
    }

    async fn insert_account_if_absent(&self, account: &Account) -> Result<bool> {
        self.timed("insert_account", async {
            let result = sqlx::query(
                r#"
                INSERT INTO accounts (username, credential_hash, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (username) DO NOTHING
                "#,
            )
            .bind(&account.username)
            .bind(&account.credential_hash)
            .bind(account.created_at)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(state: &str, owner: Option<&str>) -> DeviceRow {
        DeviceRow {
            device_id: "dev-1".to_string(),
            owner_id: owner.map(str::to_string),
            registration_state: state.to_string(),
            display_name: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_device_row_decodes() {
        let device = Device::try_from(row("registered", Some("alice"))).unwrap();
        assert_eq!(device.registration_state, RegistrationState::Registered);
        assert_eq!(device.owner_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_device_row_unknown_state_fails_closed() {
        assert!(Device::try_from(row("inactive", None)).is_err());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::StorageTimeout(d)) if d == Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_bounded_passes_results_through() {
        let value = bounded(Duration::from_secs(1), "fast", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let result: Result<()> = bounded(Duration::from_secs(1), "missing", async {
            Err(Error::NotFound("dev-1".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_bounded_maps_lost_pool_to_unavailable() {
        let result: Result<()> = bounded(Duration::from_secs(1), "closed", async {
            Err(Error::Database(sqlx::Error::PoolClosed))
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_sql_count_clamps() {
        assert_eq!(sql_count(25), 25);
        assert_eq!(sql_count(usize::MAX), i64::MAX);
    }

    #[test]
    fn test_device_row_inconsistent_owner_fails_closed() {
        assert!(Device::try_from(row("unclaimed", Some("alice"))).is_err());
        assert!(Device::try_from(row("registered", None)).is_err());
    }
}
