//! Postgres backend.
//!
//! Every sequence number (queue and delayed rows alike) comes from the
//! `signal_seq` sequence, so numbers are never reused. A transition commit is
//! one database transaction that starts by deleting the originating queue row;
//! if that row is already gone nothing else is written.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use statewright_common::{
    DatabaseConfig, DeadLetter, DelayedSignal, EncodedEvent, EntityKey, EntityProperty,
    EntitySnapshot, Error, NumberedSignal, PromotedSignal, PropertyPredicate, RangeQuery, Result,
    Signal, SignalLogEntry,
};

use crate::traits::{
    CommitReceipt, DelayedSignalStore, EntityStore, SignalLog, SignalQueue, TransitionCommit,
    TransitionStore,
};

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and, when configured, bring the schema up to date.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        let storage = Self::new(pool);
        if config.run_migrations {
            storage.migrate().await?;
        }
        Ok(storage)
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Storage migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    #[sqlx(rename = "type")]
    entity_type: String,
    id: String,
    event_type: String,
    event_bytes: Vec<u8>,
}

impl From<QueueRow> for NumberedSignal {
    fn from(row: QueueRow) -> Self {
        NumberedSignal {
            sequence_number: row.seq,
            signal: Signal::new(
                EntityKey::new(row.entity_type, row.id),
                EncodedEvent::new(row.event_type, row.event_bytes),
            ),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DelayedRow {
    seq: i64,
    from_type: String,
    from_id: String,
    #[sqlx(rename = "type")]
    entity_type: String,
    id: String,
    event_type: String,
    event_bytes: Vec<u8>,
    due_time: DateTime<Utc>,
}

impl From<DelayedRow> for DelayedSignal {
    fn from(row: DelayedRow) -> Self {
        DelayedSignal {
            sequence_number: row.seq,
            from: EntityKey::new(row.from_type, row.from_id),
            signal: Signal::new(
                EntityKey::new(row.entity_type, row.id),
                EncodedEvent::new(row.event_type, row.event_bytes),
            ),
            due_time: row.due_time,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    #[sqlx(rename = "type")]
    entity_type: String,
    id: String,
    state_tag: Option<String>,
    bytes: Vec<u8>,
}

impl From<EntityRow> for EntitySnapshot {
    fn from(row: EntityRow) -> Self {
        EntitySnapshot {
            key: EntityKey::new(row.entity_type, row.id),
            state_tag: row.state_tag,
            bytes: row.bytes,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    #[sqlx(rename = "type")]
    entity_type: String,
    id: String,
    event_type: String,
    event_bytes: Vec<u8>,
    seq: i64,
    applied_at: DateTime<Utc>,
}

impl From<LogRow> for SignalLogEntry {
    fn from(row: LogRow) -> Self {
        SignalLogEntry {
            sequence_number: row.seq,
            key: EntityKey::new(row.entity_type, row.id),
            event: EncodedEvent::new(row.event_type, row.event_bytes),
            applied_at: row.applied_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    seq: i64,
    #[sqlx(rename = "type")]
    entity_type: String,
    id: String,
    event_type: String,
    event_bytes: Vec<u8>,
    error: String,
    failed_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetter {
            sequence_number: row.seq,
            signal: Signal::new(
                EntityKey::new(row.entity_type, row.id),
                EncodedEvent::new(row.event_type, row.event_bytes),
            ),
            error: row.error,
            failed_at: row.failed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Statement helpers, shared by standalone calls and transition commits
// ---------------------------------------------------------------------------

async fn insert_queued(conn: &mut PgConnection, signal: &Signal) -> Result<NumberedSignal> {
    let seq = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO signal_queue (seq, type, id, event_type, event_bytes)
        VALUES (nextval('signal_seq'), $1, $2, $3, $4)
        RETURNING seq
        "#,
    )
    .bind(&signal.key.entity_type)
    .bind(&signal.key.id)
    .bind(&signal.event.event_type)
    .bind(&signal.event.bytes)
    .fetch_one(&mut *conn)
    .await?;

    Ok(NumberedSignal {
        sequence_number: seq,
        signal: signal.clone(),
    })
}

async fn insert_delayed(
    conn: &mut PgConnection,
    signal: &Signal,
    from: &EntityKey,
    due_time: DateTime<Utc>,
) -> Result<DelayedSignal> {
    let seq = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO delayed_signal_queue
            (seq, from_type, from_id, type, id, event_type, event_bytes, due_time)
        VALUES (nextval('signal_seq'), $1, $2, $3, $4, $5, $6, $7)
        RETURNING seq
        "#,
    )
    .bind(&from.entity_type)
    .bind(&from.id)
    .bind(&signal.key.entity_type)
    .bind(&signal.key.id)
    .bind(&signal.event.event_type)
    .bind(&signal.event.bytes)
    .bind(due_time)
    .fetch_one(&mut *conn)
    .await?;

    Ok(DelayedSignal {
        sequence_number: seq,
        from: from.clone(),
        signal: signal.clone(),
        due_time,
    })
}

async fn delete_delayed(
    conn: &mut PgConnection,
    from: &EntityKey,
    target: &EntityKey,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM delayed_signal_queue
        WHERE from_type = $1 AND from_id = $2 AND type = $3 AND id = $4
        "#,
    )
    .bind(&from.entity_type)
    .bind(&from.id)
    .bind(&target.entity_type)
    .bind(&target.id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_entity(conn: &mut PgConnection, snapshot: &EntitySnapshot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entity (type, id, state_tag, bytes)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (type, id) DO UPDATE
            SET state_tag = EXCLUDED.state_tag, bytes = EXCLUDED.bytes
        "#,
    )
    .bind(&snapshot.key.entity_type)
    .bind(&snapshot.key.id)
    .bind(&snapshot.state_tag)
    .bind(&snapshot.bytes)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn replace_properties(
    conn: &mut PgConnection,
    key: &EntityKey,
    properties: &[EntityProperty],
) -> Result<()> {
    sqlx::query("DELETE FROM entity_property WHERE type = $1 AND id = $2")
        .bind(&key.entity_type)
        .bind(&key.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM entity_property_range WHERE type = $1 AND id = $2")
        .bind(&key.entity_type)
        .bind(&key.id)
        .execute(&mut *conn)
        .await?;

    for property in properties {
        match &property.range {
            None => {
                sqlx::query(
                    "INSERT INTO entity_property (type, id, name, value) VALUES ($1, $2, $3, $4)",
                )
                .bind(&key.entity_type)
                .bind(&key.id)
                .bind(&property.name)
                .bind(&property.value)
                .execute(&mut *conn)
                .await?;
            }
            Some(range) => {
                sqlx::query(
                    r#"
                    INSERT INTO entity_property_range
                        (type, id, name, value, range_name, range_value)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&key.entity_type)
                .bind(&key.id)
                .bind(&property.name)
                .bind(&property.value)
                .bind(&range.name)
                .bind(range.value)
                .execute(&mut *conn)
                .await?;
            }
        }
    }
    Ok(())
}

async fn insert_log(conn: &mut PgConnection, entry: &SignalLogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO signal_log (type, id, event_type, event_bytes, seq, applied_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&entry.key.entity_type)
    .bind(&entry.key.id)
    .bind(&entry.event.event_type)
    .bind(&entry.event.bytes)
    .bind(entry.sequence_number)
    .bind(entry.applied_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn ids_matching(
    pool: &PgPool,
    entity_type: &str,
    predicate: &PropertyPredicate,
) -> Result<BTreeSet<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT id FROM entity_property WHERE type = $1 AND name = $2 AND value = $3",
    )
    .bind(entity_type)
    .bind(&predicate.name)
    .bind(&predicate.value)
    .fetch_all(pool)
    .await?;
    Ok(ids.into_iter().collect())
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl SignalQueue for PgStorage {
    async fn offer(&self, signal: &Signal) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let queued = insert_queued(&mut conn, signal).await?;
        debug!(seq = queued.sequence_number, key = %signal.key, "Signal offered");
        Ok(queued.sequence_number)
    }

    async fn peek_ready(&self) -> Result<Vec<NumberedSignal>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            "SELECT seq, type, id, event_type, event_bytes FROM signal_queue ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn remove(&self, sequence_number: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM signal_queue WHERE seq = $1")
            .bind(sequence_number)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SignalLog for PgStorage {
    async fn append(&self, entry: &SignalLogEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_log(&mut conn, entry).await
    }

    async fn read_log_page(
        &self,
        key: &EntityKey,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SignalLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT type, id, event_type, event_bytes, seq, applied_at
            FROM signal_log
            WHERE type = $1 AND id = $2 AND ($3::BIGINT IS NULL OR seq > $3)
            ORDER BY seq ASC
            LIMIT $4
            "#,
        )
        .bind(&key.entity_type)
        .bind(&key.id)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn has_log(&self, key: &EntityKey) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM signal_log WHERE type = $1 AND id = $2)",
        )
        .bind(&key.entity_type)
        .bind(&key.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl DelayedSignalStore for PgStorage {
    async fn schedule(
        &self,
        signal: &Signal,
        from: &EntityKey,
        due_time: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Ok(insert_delayed(&mut conn, signal, from, due_time)
            .await?
            .sequence_number)
    }

    async fn cancel(&self, from: &EntityKey, target: &EntityKey) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        delete_delayed(&mut conn, from, target).await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<PromotedSignal>> {
        let mut tx = self.pool.begin().await?;

        let mut due: Vec<DelayedSignal> = sqlx::query_as::<_, DelayedRow>(
            r#"
            DELETE FROM delayed_signal_queue
            WHERE seq IN (
                SELECT seq FROM delayed_signal_queue
                WHERE due_time <= $1
                ORDER BY due_time, seq
                FOR UPDATE SKIP LOCKED
            )
            RETURNING seq, from_type, from_id, type, id, event_type, event_bytes, due_time
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
        due.sort_by_key(|d| (d.due_time, d.sequence_number));

        let mut promoted = Vec::with_capacity(due.len());
        for delayed in due {
            let queued = insert_queued(&mut tx, &delayed.signal).await?;
            promoted.push(PromotedSignal { delayed, queued });
        }

        tx.commit().await?;
        Ok(promoted)
    }

    async fn pending_delayed(&self) -> Result<Vec<DelayedSignal>> {
        let rows = sqlx::query_as::<_, DelayedRow>(
            r#"
            SELECT seq, from_type, from_id, type, id, event_type, event_bytes, due_time
            FROM delayed_signal_queue
            ORDER BY due_time, seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl EntityStore for PgStorage {
    async fn read_snapshot(&self, key: &EntityKey) -> Result<Option<EntitySnapshot>> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT type, id, state_tag, bytes FROM entity WHERE type = $1 AND id = $2",
        )
        .bind(&key.entity_type)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn write_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_entity(&mut conn, snapshot).await
    }

    async fn write_properties(&self, key: &EntityKey, properties: &[EntityProperty]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        replace_properties(&mut tx, key, properties).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_entity(
        &self,
        snapshot: &EntitySnapshot,
        properties: &[EntityProperty],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_entity(&mut tx, snapshot).await?;
        replace_properties(&mut tx, &snapshot.key, properties).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query_by_property_any(
        &self,
        entity_type: &str,
        predicates: &[PropertyPredicate],
    ) -> Result<BTreeSet<String>> {
        let names: Vec<&str> = predicates.iter().map(|p| p.name.as_str()).collect();
        let values: Vec<&str> = predicates.iter().map(|p| p.value.as_str()).collect();
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT p.id
            FROM entity_property p
            JOIN UNNEST($2::TEXT[], $3::TEXT[]) AS q(name, value)
                ON p.name = q.name AND p.value = q.value
            WHERE p.type = $1
            "#,
        )
        .bind(entity_type)
        .bind(&names)
        .bind(&values)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn query_by_property_all(
        &self,
        entity_type: &str,
        predicates: &[PropertyPredicate],
    ) -> Result<BTreeSet<String>> {
        let mut result: Option<BTreeSet<String>> = None;
        for predicate in predicates {
            let ids = ids_matching(&self.pool, entity_type, predicate).await?;
            let narrowed = match result {
                None => ids,
                Some(acc) => acc.intersection(&ids).cloned().collect(),
            };
            if narrowed.is_empty() {
                return Ok(narrowed);
            }
            result = Some(narrowed);
        }
        Ok(result.unwrap_or_default())
    }

    async fn query_by_range(&self, entity_type: &str, query: &RangeQuery) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id
            FROM entity_property_range
            WHERE type = $1 AND name = $2 AND value = $3 AND range_name = $4
              AND ($5::BIGINT IS NULL OR range_value > $5 OR ($6 AND range_value = $5))
              AND ($7::BIGINT IS NULL OR range_value < $7 OR ($8 AND range_value = $7))
            ORDER BY range_value ASC, id ASC
            LIMIT $9
            "#,
        )
        .bind(entity_type)
        .bind(&query.name)
        .bind(&query.value)
        .bind(&query.range_name)
        .bind(query.lower)
        .bind(query.lower_inclusive)
        .bind(query.upper)
        .bind(query.upper_inclusive)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_all(&self, entity_type: &str) -> Result<Vec<EntitySnapshot>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT type, id, state_tag, bytes FROM entity WHERE type = $1 ORDER BY id ASC",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl TransitionStore for PgStorage {
    async fn commit_transition(&self, commit: &TransitionCommit) -> Result<CommitReceipt> {
        let seq = commit.signal.sequence_number;
        let key = &commit.snapshot.key;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM signal_queue WHERE seq = $1")
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::SignalNotQueued(seq));
        }

        upsert_entity(&mut tx, &commit.snapshot).await?;
        replace_properties(&mut tx, key, &commit.properties).await?;
        insert_log(&mut tx, &commit.log_entry()).await?;

        let mut receipt = CommitReceipt::default();
        for target in &commit.cancellations {
            receipt.cancelled += delete_delayed(&mut tx, key, target).await?;
        }
        for signal in &commit.immediate {
            receipt.queued.push(insert_queued(&mut tx, signal).await?);
        }
        for (signal, due_time) in &commit.delayed {
            receipt
                .scheduled
                .push(insert_delayed(&mut tx, signal, key, *due_time).await?);
        }

        tx.commit().await?;
        Ok(receipt)
    }

    async fn dead_letter(
        &self,
        signal: &NumberedSignal,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM signal_queue WHERE seq = $1")
            .bind(signal.sequence_number)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO signal_dead_letter
                (seq, type, id, event_type, event_bytes, error, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (seq) DO NOTHING
            "#,
        )
        .bind(signal.sequence_number)
        .bind(&signal.key().entity_type)
        .bind(&signal.key().id)
        .bind(&signal.event().event_type)
        .bind(&signal.event().bytes)
        .bind(error)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT seq, type, id, event_type, event_bytes, error, failed_at
            FROM signal_dead_letter
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
