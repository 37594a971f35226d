//! `PostgreSQL`-backed [`EventStore`].
//!
//! A single `events` table holds the whole log: `(offset, owner, type, at,
//! version, payload, metadata, reserved_at, acked_at)`, with a unique index
//! on `(type, owner, version)` enforcing the no-gaps invariant. Optimistic
//! concurrency is enforced by locking the stream with a
//! `pg_advisory_xact_lock` before reading its current version, so two
//! concurrent appends to a brand-new stream can't both observe "empty" and
//! both try to write version 1.
//!
//! `subscribe` is a competing-consumer loop over the same table using
//! `FOR UPDATE SKIP LOCKED`: the claiming row lock and the eventual ack are
//! the same transaction, so a handler failure rolls the claim back and the
//! row becomes re-leasable once its lease expires rather than being lost.

use chrono::{DateTime, Utc};
use cqrs_core::event::SerializedEvent;
use cqrs_core::event_store::{
    check_events_consistent, check_expected_version, EventStore, EventStoreError, ExpectedVersion,
    Select, SubscribeCallback,
};
use cqrs_core::stream::{StreamId, Version};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// How long a claimed-but-unacknowledged event can stay claimed before
/// another `subscribe` caller is allowed to pick it up again.
const LEASE_DURATION: Duration = Duration::from_secs(60);

/// How long `subscribe` sleeps when there is nothing left to claim.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A `PostgreSQL`-backed [`EventStore`].
///
/// Cheaply cloneable — wraps a [`PgPool`], which is itself a handle onto a
/// shared connection pool.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect to `database_url` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] if the connection or schema setup
    /// fails.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, ensuring the schema exists.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] if schema setup fails.
    pub async fn from_pool(pool: PgPool) -> Result<Self, EventStoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                "offset" BIGSERIAL PRIMARY KEY,
                "type" TEXT NOT NULL,
                owner TEXT NOT NULL,
                version BIGINT NOT NULL,
                at TIMESTAMPTZ NOT NULL,
                event_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                metadata JSONB,
                reserved_at TIMESTAMPTZ,
                acked_at TIMESTAMPTZ,
                UNIQUE ("type", owner, version)
            );

            CREATE INDEX IF NOT EXISTS idx_events_stream
                ON events ("type", owner, version);

            CREATE INDEX IF NOT EXISTS idx_events_unclaimed
                ON events ("offset")
                WHERE acked_at IS NULL;

            CREATE TABLE IF NOT EXISTS snapshots (
                "type" TEXT NOT NULL,
                owner TEXT NOT NULL,
                version BIGINT NOT NULL,
                state BYTEA NOT NULL,
                at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY ("type", owner)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Current version of `stream`, or [`Version::INITIAL`] if it has no
    /// events. Must run inside the transaction that holds the stream's
    /// advisory lock, so the read is consistent with whatever this
    /// transaction is about to append.
    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        stream: &StreamId,
    ) -> Result<Version, EventStoreError> {
        let row = sqlx::query(
            r#"SELECT COALESCE(MAX(version), 0) AS version FROM events
               WHERE "type" = $1 AND owner = $2"#,
        )
        .bind(stream.aggregate_type().as_str())
        .bind(stream.owner_id().as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

        let version: i64 = row
            .try_get("version")
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
        Ok(Version::new(u64::try_from(version).unwrap_or(0)))
    }
}

impl EventStore for PostgresEventStore {
    fn append_events(
        &self,
        stream: StreamId,
        expected_version: ExpectedVersion,
        events: Vec<cqrs_core::event::StoredEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if events.is_empty() {
                return Err(EventStoreError::DatabaseError(
                    "cannot append an empty batch of events".to_string(),
                ));
            }
            if events.iter().any(|event| event.stream != stream) {
                return Err(EventStoreError::InconsistentEvents {
                    stream: stream.clone(),
                    at: events[0].version,
                });
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            sqlx::query(r"SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(stream.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            let current = Self::current_version(&mut tx, &stream).await?;
            check_expected_version(&stream, expected_version, current)?;
            check_events_consistent(&stream, current, &events)?;

            for event in &events {
                sqlx::query(
                    r#"INSERT INTO events
                       ("type", owner, version, at, event_type, payload, metadata)
                       VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
                )
                .bind(stream.aggregate_type().as_str())
                .bind(stream.owner_id().as_str())
                .bind(i64::try_from(event.version.value()).unwrap_or(i64::MAX))
                .bind(event.at)
                .bind(&event.event.event_type)
                .bind(&event.event.data)
                .bind(&event.event.metadata)
                .execute(&mut *tx)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            }

            tx.commit()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            Ok(events
                .last()
                .map_or(current, |last_event| last_event.version))
        })
    }

    fn stream(
        &self,
        select: Select,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<cqrs_core::event::StoredEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let from_version = select
                .from_version
                .map_or(0, |v| i64::try_from(v.value()).unwrap_or(0));

            let rows = sqlx::query(
                r#"SELECT "type", owner, version, at, event_type, payload, metadata
                   FROM events
                   WHERE ($1::TEXT IS NULL OR "type" = $1)
                     AND ($2::TEXT IS NULL OR owner = $2)
                     AND version >= $3
                   ORDER BY "type", owner, version ASC"#,
            )
            .bind(&select.aggregate_type)
            .bind(&select.owner_id)
            .bind(from_version)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            rows.into_iter().map(row_to_stored_event).collect()
        })
    }

    fn subscribe(
        &self,
        callback: SubscribeCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

                let row = sqlx::query(
                    r#"SELECT "offset", "type", owner, version, at, event_type, payload, metadata
                       FROM events
                       WHERE reserved_at IS NULL
                          OR (reserved_at < now() - $1::INTERVAL AND acked_at IS NULL)
                       ORDER BY "offset" ASC
                       LIMIT 1
                       FOR UPDATE SKIP LOCKED"#,
                )
                .bind(format!("{} seconds", LEASE_DURATION.as_secs()))
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

                let Some(row) = row else {
                    tx.commit()
                        .await
                        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                };

                let offset: i64 = row
                    .try_get("offset")
                    .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
                let stored = row_to_stored_event(row)?;

                sqlx::query(r#"UPDATE events SET reserved_at = now() WHERE "offset" = $1"#)
                    .bind(offset)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

                match callback(stored).await {
                    Ok(()) => {
                        sqlx::query(r#"UPDATE events SET acked_at = now() WHERE "offset" = $1"#)
                            .bind(offset)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
                        tx.commit()
                            .await
                            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
                    }
                    Err(_) => {
                        tx.rollback()
                            .await
                            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
                    }
                }
            }
        })
    }

    fn save_snapshot(
        &self,
        stream: StreamId,
        version: Version,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r#"INSERT INTO snapshots ("type", owner, version, state, at)
                   VALUES ($1, $2, $3, $4, now())
                   ON CONFLICT ("type", owner)
                   DO UPDATE SET version = EXCLUDED.version, state = EXCLUDED.state, at = EXCLUDED.at"#,
            )
            .bind(stream.aggregate_type().as_str())
            .bind(stream.owner_id().as_str())
            .bind(i64::try_from(version.value()).unwrap_or(i64::MAX))
            .bind(state)
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        stream: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(Version, Vec<u8>)>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(
                r#"SELECT version, state FROM snapshots WHERE "type" = $1 AND owner = $2"#,
            )
            .bind(stream.aggregate_type().as_str())
            .bind(stream.owner_id().as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let version: i64 = row
                .try_get("version")
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            let state: Vec<u8> = row
                .try_get("state")
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            Ok(Some((Version::new(u64::try_from(version).unwrap_or(0)), state)))
        })
    }
}

fn row_to_stored_event(
    row: sqlx::postgres::PgRow,
) -> Result<cqrs_core::event::StoredEvent, EventStoreError> {
    let aggregate_type: String = row
        .try_get("type")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
    let owner_id: String = row
        .try_get("owner")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
    let at: DateTime<Utc> = row
        .try_get("at")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
    let event_type: String = row
        .try_get("event_type")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
    let payload: Vec<u8> = row
        .try_get("payload")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
    let metadata: Option<serde_json::Value> = row
        .try_get("metadata")
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

    Ok(cqrs_core::event::StoredEvent::new(
        StreamId::new(aggregate_type, owner_id),
        Version::new(u64::try_from(version).unwrap_or(0)),
        at,
        SerializedEvent::new(event_type, payload, metadata),
    ))
}
