//! SQL-backed store over SQLite or Postgres.
//!
//! Tables:
//! - `system_settings`  → control record, keyed by `setting_key`
//! - `roster_groups`    → one row per group, `last_reset_at`
//! - `bus_roster`       → one row per (group, rider)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar};
use tracing::error;

#[cfg(feature = "sqlite")]
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

#[cfg(feature = "postgres")]
use sqlx::PgPool;

use super::{ClaimOutcome, ControlRecord, RosterEntry, RosterStore, WriteBatch};
use crate::calendar::DateKey;
use crate::config::DatabaseConfig;
use crate::errors::{ResetError, ResetResult};

/// Primary key of the control record in `system_settings`.
pub const CONTROL_SETTING_KEY: &str = "dailyRosterReset";

/// Store backed by a sqlx connection pool.
///
/// Available variants depend on enabled features:
/// - `sqlite` feature enables `SqlStore::SQLite`
/// - `postgres` feature enables `SqlStore::Postgres`
#[derive(Debug, Clone)]
pub enum SqlStore {
    #[cfg(feature = "sqlite")]
    SQLite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

fn store_err(op: &str, e: sqlx::Error) -> ResetError {
    error!("{op} failed: {e}");
    ResetError::StoreError(format!("{op}: {e}"))
}

impl SqlStore {
    /// Connect according to `config.db_type`.
    ///
    /// In-memory SQLite URLs get a single-connection pool, since every
    /// connection would otherwise open its own empty database.
    pub async fn connect(config: &DatabaseConfig) -> ResetResult<Self> {
        match config.db_type.as_str() {
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let mut options = SqlitePoolOptions::new();
                if config.sqlite_url.contains(":memory:") {
                    options = options.max_connections(1);
                }
                let pool = options
                    .connect(&config.sqlite_url)
                    .await
                    .map_err(|e| store_err("connect to SQLite", e))?;

                Ok(SqlStore::SQLite(pool))
            }
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(ResetError::ConfigError(
                "SQLite support not compiled in. Enable the 'sqlite' feature.".to_string(),
            )),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let pool = PgPool::connect(&config.postgres_url)
                    .await
                    .map_err(|e| store_err("connect to PostgreSQL", e))?;

                Ok(SqlStore::Postgres(pool))
            }
            #[cfg(not(feature = "postgres"))]
            "postgres" => Err(ResetError::ConfigError(
                "PostgreSQL support not compiled in. Enable the 'postgres' feature.".to_string(),
            )),
            other => Err(ResetError::ConfigError(format!(
                "unsupported database type: {other}"
            ))),
        }
    }

    /// Create the tables if they do not exist.
    pub async fn ensure_schema(&self) -> ResetResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                for statement in [
                    r#"
                    CREATE TABLE IF NOT EXISTS system_settings (
                        setting_key TEXT PRIMARY KEY,
                        last_reset_date TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS roster_groups (
                        group_id TEXT PRIMARY KEY,
                        last_reset_at TEXT
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS bus_roster (
                        group_id TEXT NOT NULL,
                        rider_id TEXT NOT NULL,
                        is_on_bus BOOLEAN NOT NULL DEFAULT FALSE,
                        joined_at TEXT,
                        updated_at TEXT,
                        PRIMARY KEY (group_id, rider_id)
                    )
                    "#,
                ] {
                    query(statement)
                        .execute(pool)
                        .await
                        .map_err(|e| store_err("SQLite ensure_schema", e))?;
                }
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                for statement in [
                    r#"
                    CREATE TABLE IF NOT EXISTS system_settings (
                        setting_key TEXT PRIMARY KEY,
                        last_reset_date TEXT NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS roster_groups (
                        group_id TEXT PRIMARY KEY,
                        last_reset_at TIMESTAMPTZ
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS bus_roster (
                        group_id TEXT NOT NULL,
                        rider_id TEXT NOT NULL,
                        is_on_bus BOOLEAN NOT NULL DEFAULT FALSE,
                        joined_at TIMESTAMPTZ,
                        updated_at TIMESTAMPTZ,
                        PRIMARY KEY (group_id, rider_id)
                    )
                    "#,
                ] {
                    query(statement)
                        .execute(pool)
                        .await
                        .map_err(|e| store_err("Postgres ensure_schema", e))?;
                }
            }
        }

        Ok(())
    }

    /// Insert a group row if it does not exist yet.
    pub async fn insert_group(&self, group_id: &str) -> ResetResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                query("INSERT INTO roster_groups (group_id) VALUES (?) ON CONFLICT(group_id) DO NOTHING")
                    .bind(group_id)
                    .execute(pool)
                    .await
                    .map_err(|e| store_err("SQLite insert_group", e))?;
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                query("INSERT INTO roster_groups (group_id) VALUES ($1) ON CONFLICT (group_id) DO NOTHING")
                    .bind(group_id)
                    .execute(pool)
                    .await
                    .map_err(|e| store_err("Postgres insert_group", e))?;
            }
        }

        Ok(())
    }

    /// Insert or replace a roster entry. The group row must already exist
    /// for it to be enumerated by the reset.
    pub async fn put_roster_entry(&self, group_id: &str, entry: &RosterEntry) -> ResetResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                query(
                    r#"
                    INSERT INTO bus_roster (group_id, rider_id, is_on_bus, joined_at, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(group_id, rider_id) DO UPDATE SET
                        is_on_bus  = excluded.is_on_bus,
                        joined_at  = excluded.joined_at,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(group_id)
                .bind(&entry.rider_id)
                .bind(entry.is_on_bus)
                .bind(entry.joined_at)
                .bind(entry.updated_at)
                .execute(pool)
                .await
                .map_err(|e| store_err("SQLite put_roster_entry", e))?;
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                query(
                    r#"
                    INSERT INTO bus_roster (group_id, rider_id, is_on_bus, joined_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (group_id, rider_id) DO UPDATE SET
                        is_on_bus  = EXCLUDED.is_on_bus,
                        joined_at  = EXCLUDED.joined_at,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(group_id)
                .bind(&entry.rider_id)
                .bind(entry.is_on_bus)
                .bind(entry.joined_at)
                .bind(entry.updated_at)
                .execute(pool)
                .await
                .map_err(|e| store_err("Postgres put_roster_entry", e))?;
            }
        }

        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => pool.close().await,
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => pool.close().await,
        }
    }

    pub async fn group_last_reset_at(&self, group_id: &str) -> ResetResult<Option<DateTime<Utc>>> {
        let stamp: Option<Option<DateTime<Utc>>> = match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                query_scalar("SELECT last_reset_at FROM roster_groups WHERE group_id = ?")
                    .bind(group_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| store_err("SQLite group_last_reset_at", e))?
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                query_scalar("SELECT last_reset_at FROM roster_groups WHERE group_id = $1")
                    .bind(group_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| store_err("Postgres group_last_reset_at", e))?
            }
        };

        Ok(stamp.flatten())
    }
}

fn control_record_from_row(row: (String, DateTime<Utc>)) -> ResetResult<ControlRecord> {
    let (raw_date, updated_at) = row;
    Ok(ControlRecord {
        last_reset_date: DateKey::parse(&raw_date)?,
        updated_at,
    })
}

#[async_trait]
impl RosterStore for SqlStore {
    fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(_) => "postgres",
        }
    }

    /// The compare and the write are one conditional upsert: the row is only
    /// touched when the stored key is older than `today`, so concurrent
    /// claimers serialize on the row and exactly one sees a changed row.
    async fn claim_reset_date(&self, today: &DateKey) -> ResetResult<ClaimOutcome> {
        let now = Utc::now();

        let recorded: Option<String> = match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| store_err("SQLite begin claim", e))?;

                let changed = query(
                    r#"
                    INSERT INTO system_settings (setting_key, last_reset_date, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(setting_key) DO UPDATE SET
                        last_reset_date = excluded.last_reset_date,
                        updated_at      = excluded.updated_at
                    WHERE system_settings.last_reset_date < excluded.last_reset_date
                    "#,
                )
                .bind(CONTROL_SETTING_KEY)
                .bind(today.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| store_err("SQLite claim_reset_date", e))?
                .rows_affected();

                let recorded = if changed > 0 {
                    None
                } else {
                    query_scalar(
                        "SELECT last_reset_date FROM system_settings WHERE setting_key = ?",
                    )
                    .bind(CONTROL_SETTING_KEY)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| store_err("SQLite read control record", e))?
                };

                tx.commit()
                    .await
                    .map_err(|e| store_err("SQLite commit claim", e))?;
                recorded
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| store_err("Postgres begin claim", e))?;

                let changed = query(
                    r#"
                    INSERT INTO system_settings (setting_key, last_reset_date, updated_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (setting_key) DO UPDATE SET
                        last_reset_date = EXCLUDED.last_reset_date,
                        updated_at      = EXCLUDED.updated_at
                    WHERE system_settings.last_reset_date < EXCLUDED.last_reset_date
                    "#,
                )
                .bind(CONTROL_SETTING_KEY)
                .bind(today.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| store_err("Postgres claim_reset_date", e))?
                .rows_affected();

                let recorded = if changed > 0 {
                    None
                } else {
                    query_scalar(
                        "SELECT last_reset_date FROM system_settings WHERE setting_key = $1",
                    )
                    .bind(CONTROL_SETTING_KEY)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| store_err("Postgres read control record", e))?
                };

                tx.commit()
                    .await
                    .map_err(|e| store_err("Postgres commit claim", e))?;
                recorded
            }
        };

        match recorded {
            None => Ok(ClaimOutcome::Claimed),
            Some(raw) => Ok(ClaimOutcome::AlreadyClaimed {
                recorded: DateKey::parse(&raw)?,
            }),
        }
    }

    async fn control_record(&self) -> ResetResult<Option<ControlRecord>> {
        let row: Option<(String, DateTime<Utc>)> = match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => query_as(
                "SELECT last_reset_date, updated_at FROM system_settings WHERE setting_key = ?",
            )
            .bind(CONTROL_SETTING_KEY)
            .fetch_optional(pool)
            .await
            .map_err(|e| store_err("SQLite control_record", e))?,
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => query_as(
                "SELECT last_reset_date, updated_at FROM system_settings WHERE setting_key = $1",
            )
            .bind(CONTROL_SETTING_KEY)
            .fetch_optional(pool)
            .await
            .map_err(|e| store_err("Postgres control_record", e))?,
        };

        row.map(control_record_from_row).transpose()
    }

    async fn list_group_ids(&self) -> ResetResult<Vec<String>> {
        let ids: Vec<String> = match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                query_scalar("SELECT group_id FROM roster_groups ORDER BY group_id")
                    .fetch_all(pool)
                    .await
                    .map_err(|e| store_err("SQLite list_group_ids", e))?
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                query_scalar("SELECT group_id FROM roster_groups ORDER BY group_id")
                    .fetch_all(pool)
                    .await
                    .map_err(|e| store_err("Postgres list_group_ids", e))?
            }
        };

        Ok(ids)
    }

    async fn fetch_roster_page(
        &self,
        group_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> ResetResult<Vec<RosterEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let entries = match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => query_as::<_, RosterEntry>(
                r#"
                SELECT rider_id, is_on_bus, joined_at, updated_at
                FROM bus_roster
                WHERE group_id = ? AND (? IS NULL OR rider_id > ?)
                ORDER BY rider_id
                LIMIT ?
                "#,
            )
            .bind(group_id)
            .bind(after)
            .bind(after)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(|e| store_err("SQLite fetch_roster_page", e))?,
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => query_as::<_, RosterEntry>(
                r#"
                SELECT rider_id, is_on_bus, joined_at, updated_at
                FROM bus_roster
                WHERE group_id = $1 AND ($2::TEXT IS NULL OR rider_id > $2)
                ORDER BY rider_id
                LIMIT $3
                "#,
            )
            .bind(group_id)
            .bind(after)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(|e| store_err("Postgres fetch_roster_page", e))?,
        };

        Ok(entries)
    }

    async fn commit_batch(&self, batch: &WriteBatch) -> ResetResult<()> {
        batch.check_limit()?;
        if batch.is_empty() {
            return Ok(());
        }
        let now = Utc::now();

        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| store_err("SQLite begin batch", e))?;

                for write in batch.writes() {
                    query(
                        r#"
                        INSERT INTO bus_roster (group_id, rider_id, is_on_bus, joined_at, updated_at)
                        VALUES (?, ?, FALSE, NULL, ?)
                        ON CONFLICT(group_id, rider_id) DO UPDATE SET
                            is_on_bus  = FALSE,
                            joined_at  = NULL,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&write.group_id)
                    .bind(&write.rider_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| store_err("SQLite commit_batch write", e))?;
                }

                tx.commit()
                    .await
                    .map_err(|e| store_err("SQLite commit_batch", e))?;
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| store_err("Postgres begin batch", e))?;

                for write in batch.writes() {
                    query(
                        r#"
                        INSERT INTO bus_roster (group_id, rider_id, is_on_bus, joined_at, updated_at)
                        VALUES ($1, $2, FALSE, NULL, $3)
                        ON CONFLICT (group_id, rider_id) DO UPDATE SET
                            is_on_bus  = FALSE,
                            joined_at  = NULL,
                            updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(&write.group_id)
                    .bind(&write.rider_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| store_err("Postgres commit_batch write", e))?;
                }

                tx.commit()
                    .await
                    .map_err(|e| store_err("Postgres commit_batch", e))?;
            }
        }

        Ok(())
    }

    async fn stamp_group_reset(&self, group_id: &str) -> ResetResult<()> {
        let now = Utc::now();

        match self {
            #[cfg(feature = "sqlite")]
            SqlStore::SQLite(pool) => {
                query(
                    r#"
                    INSERT INTO roster_groups (group_id, last_reset_at) VALUES (?, ?)
                    ON CONFLICT(group_id) DO UPDATE SET last_reset_at = excluded.last_reset_at
                    "#,
                )
                .bind(group_id)
                .bind(now)
                .execute(pool)
                .await
                .map_err(|e| store_err("SQLite stamp_group_reset", e))?;
            }
            #[cfg(feature = "postgres")]
            SqlStore::Postgres(pool) => {
                query(
                    r#"
                    INSERT INTO roster_groups (group_id, last_reset_at) VALUES ($1, $2)
                    ON CONFLICT (group_id) DO UPDATE SET last_reset_at = EXCLUDED.last_reset_at
                    "#,
                )
                .bind(group_id)
                .bind(now)
                .execute(pool)
                .await
                .map_err(|e| store_err("Postgres stamp_group_reset", e))?;
            }
        }

        Ok(())
    }
}
