//! The work orchestrator (`spec.md` §4.1): one `sqlx::Transaction` per
//! `process_work_batch` call, running the eight ordered steps —
//! heartbeat, stale reap, apply completions, apply failures, ingest,
//! renew leases, claim, collect — against a single Postgres connection.
//!
//! Grounded on `sr-adapters::postgres::PostgresEventStore`'s
//! transaction-per-append shape and `sr-adapters::outbox`'s
//! get/mark-published query pairs, generalized to the three work
//! classes sharing one lease/claim shape so the claim/renew/fail queries
//! are written once per class rather than duplicated three times over.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use wh_core::{
    InstanceId, MessageCompletion, MessageFailure, MessageId, NewMessage,
    NewPerspectiveCheckpoint, OrchestratorFlags, StatusFlags, StreamId, WorkBatch, WorkClass,
    WorkItem,
};
use wh_ports::{WorkBatchRequest, WorkStore, WorkStoreError};

use crate::error::StoreError;
use crate::partition::{owned_partitions, partition_for_stream};

/// How many rows the claim step selects per work class in one call.
/// Not exposed as a caller-tunable parameter in `spec.md` §4.1's
/// input list, so it is a fixed constant here, the way `outbox.rs`
/// fixes its own internal publish-batch size.
const CLAIM_BATCH_LIMIT: i64 = 100;

/// The envelope type descriptor stamped on perspective work items, whose
/// "envelope" is really `{perspective_name, last_event_id}` rather than
/// a caller payload.
const PERSPECTIVE_ENVELOPE_TYPE: &str = "__perspective_checkpoint__";

pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionError {
                message: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl WorkStore for PgWorkStore {
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> Result<WorkBatch, WorkStoreError> {
        process_work_batch(&self.pool, request)
            .await
            .map_err(Into::into)
    }
}

#[instrument(skip(pool, request), fields(instance_id = %request.instance_id))]
pub async fn process_work_batch(
    pool: &PgPool,
    request: WorkBatchRequest,
) -> Result<WorkBatch, StoreError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    heartbeat(&mut tx, &request, now).await?;

    let reaped_instances = reap_stale(&mut tx, request.stale_threshold_seconds, now).await?;
    if !reaped_instances.is_empty() {
        debug!(count = reaped_instances.len(), "reaped stale instances");
    }

    apply_completions(&mut tx, WorkClass::Outbox, &request.outbox_completions).await?;
    apply_completions(&mut tx, WorkClass::Inbox, &request.inbox_completions).await?;
    apply_completions(&mut tx, WorkClass::Inbox, &request.receptor_completions).await?;
    apply_completions(
        &mut tx,
        WorkClass::Perspective,
        &request.perspective_checkpoint_completions,
    )
    .await?;

    apply_failures(&mut tx, WorkClass::Outbox, &request.outbox_failures, now).await?;
    apply_failures(&mut tx, WorkClass::Inbox, &request.inbox_failures, now).await?;
    apply_failures(&mut tx, WorkClass::Inbox, &request.receptor_failures, now).await?;
    apply_failures(
        &mut tx,
        WorkClass::Perspective,
        &request.perspective_checkpoint_failures,
        now,
    )
    .await?;

    for message in &request.new_outbox_messages {
        ingest_message(
            &mut tx,
            WorkClass::Outbox,
            message,
            request.instance_id,
            request.partition_count,
            request.lease_seconds,
            now,
        )
        .await?;
    }
    for message in &request.new_inbox_messages {
        ingest_message(
            &mut tx,
            WorkClass::Inbox,
            message,
            request.instance_id,
            request.partition_count,
            request.lease_seconds,
            now,
        )
        .await?;
    }
    for checkpoint in &request.new_perspective_checkpoints {
        ensure_perspective_checkpoint(&mut tx, checkpoint, request.partition_count).await?;
    }

    renew_leases(
        &mut tx,
        WorkClass::Outbox,
        &request.renew_outbox_lease_ids,
        request.instance_id,
        request.lease_seconds,
        now,
    )
    .await?;
    renew_leases(
        &mut tx,
        WorkClass::Inbox,
        &request.renew_inbox_lease_ids,
        request.instance_id,
        request.lease_seconds,
        now,
    )
    .await?;

    let mut batch = WorkBatch {
        reaped_instances,
        ..Default::default()
    };

    if !request.flags.contains(OrchestratorFlags::SKIP_CLAIM) {
        let live_instances = live_instance_ids(&mut tx).await?;
        let owned = owned_partitions(
            &live_instances,
            request.instance_id,
            request.partition_count,
            request.max_partitions_per_instance,
        );

        batch.outbox_work = claim_outbox(&mut tx, request.instance_id, &owned, request.lease_seconds, now).await?;
        batch.inbox_work = claim_inbox(&mut tx, request.instance_id, &owned, request.lease_seconds, now).await?;
        batch.perspective_work =
            claim_perspective(&mut tx, request.instance_id, &owned, request.lease_seconds, now).await?;
    }

    tx.commit().await?;
    Ok(batch)
}

async fn heartbeat(
    tx: &mut Transaction<'_, Postgres>,
    request: &WorkBatchRequest,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO wh_service_instances (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at, metadata)
        VALUES ($1, $2, $3, $4, $5, $5, $6)
        ON CONFLICT (instance_id) DO UPDATE
        SET last_heartbeat_at = EXCLUDED.last_heartbeat_at,
            service_name = EXCLUDED.service_name,
            host_name = EXCLUDED.host_name,
            process_id = EXCLUDED.process_id
        "#,
    )
    .bind(request.instance_id.as_uuid())
    .bind(&request.service_name)
    .bind(&request.host_name)
    .bind(request.process_id as i32)
    .bind(now)
    .bind(&request.metadata)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Deletes stale instances and nulls out the lease columns they held,
/// per `spec.md` §4.1 step 2. Returns the deleted instance ids for the
/// caller to log.
///
/// The `ON DELETE SET NULL` foreign keys from outbox/inbox/perspective
/// rows to `wh_service_instances` only null `instance_id` — they cannot
/// also clear `lease_expiry`, so relying on them alone would leave a row
/// with `instance_id IS NULL` and `lease_expiry IS NOT NULL`, violating
/// the `CHECK ((instance_id IS NULL) = (lease_expiry IS NULL))` pair
/// constraint and aborting the whole transaction. Both columns are
/// therefore cleared explicitly here, before the instance rows are
/// deleted, so the FK action downstream is a no-op.
async fn reap_stale(
    tx: &mut Transaction<'_, Postgres>,
    stale_threshold_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceId>, StoreError> {
    let cutoff = now - chrono::Duration::seconds(stale_threshold_seconds);
    let rows = sqlx::query("SELECT instance_id FROM wh_service_instances WHERE last_heartbeat_at < $1")
        .bind(cutoff)
        .fetch_all(&mut **tx)
        .await?;

    let reaped: Vec<InstanceId> = rows
        .iter()
        .map(|r| InstanceId::from_uuid(r.get("instance_id")))
        .collect();

    if reaped.is_empty() {
        return Ok(reaped);
    }
    let reaped_uuids: Vec<Uuid> = reaped.iter().map(|id| id.as_uuid()).collect();

    for table in ["wh_outbox", "wh_inbox", "wh_perspective_checkpoints"] {
        let sql = format!(
            "UPDATE {table} SET instance_id = NULL, lease_expiry = NULL WHERE instance_id = ANY($1)"
        );
        sqlx::query(&sql)
            .bind(&reaped_uuids)
            .execute(&mut **tx)
            .await?;
    }

    // wh_active_streams is ON DELETE CASCADE (no lease-pair CHECK to
    // satisfy), so its rows for these instances simply disappear,
    // letting the next admit recreate ownership with a live instance.
    sqlx::query("DELETE FROM wh_service_instances WHERE instance_id = ANY($1)")
        .bind(&reaped_uuids)
        .execute(&mut **tx)
        .await?;

    Ok(reaped)
}

async fn apply_completions(
    tx: &mut Transaction<'_, Postgres>,
    class: WorkClass,
    completions: &[MessageCompletion],
) -> Result<(), StoreError> {
    for completion in completions {
        match class {
            WorkClass::Outbox => {
                sqlx::query(
                    "UPDATE wh_outbox SET status = status | $2, instance_id = NULL, lease_expiry = NULL,
                     published_at = CASE WHEN ($2 & $3) != 0 THEN now() ELSE published_at END
                     WHERE message_id = $1",
                )
                .bind(completion.message_id.as_uuid())
                .bind(completion.completed_status.bits())
                .bind(StatusFlags::PUBLISHED.bits())
                .execute(&mut **tx)
                .await?;
            }
            WorkClass::Inbox => {
                sqlx::query(
                    "UPDATE wh_inbox SET status = status | $2, instance_id = NULL, lease_expiry = NULL
                     WHERE message_id = $1",
                )
                .bind(completion.message_id.as_uuid())
                .bind(completion.completed_status.bits())
                .execute(&mut **tx)
                .await?;
            }
            WorkClass::Perspective => {
                sqlx::query(
                    "UPDATE wh_perspective_checkpoints SET status = status | $2, instance_id = NULL, lease_expiry = NULL
                     WHERE checkpoint_id = $1",
                )
                .bind(completion.message_id.as_uuid())
                .bind(completion.completed_status.bits())
                .execute(&mut **tx)
                .await?;
            }
        }
    }
    Ok(())
}

async fn apply_failures(
    tx: &mut Transaction<'_, Postgres>,
    class: WorkClass,
    failures: &[MessageFailure],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    for failure in failures {
        let failed_bits = (failure.completed_status | StatusFlags::FAILED).bits();
        let sql = match class {
            WorkClass::Outbox => {
                "UPDATE wh_outbox SET status = status | $2, error = $3, attempts = attempts + 1,
                 instance_id = NULL, lease_expiry = NULL
                 WHERE message_id = $1
                 RETURNING stream_id, sequence_order"
            }
            WorkClass::Inbox => {
                "UPDATE wh_inbox SET status = status | $2, error = $3, attempts = attempts + 1,
                 instance_id = NULL, lease_expiry = NULL
                 WHERE message_id = $1
                 RETURNING stream_id, sequence_order"
            }
            WorkClass::Perspective => {
                "UPDATE wh_perspective_checkpoints SET status = status | $2, error = $3, attempts = attempts + 1,
                 instance_id = NULL, lease_expiry = NULL
                 WHERE checkpoint_id = $1
                 RETURNING stream_id, sequence_order"
            }
        };
        let row = sqlx::query(sql)
            .bind(failure.message_id.as_uuid())
            .bind(failed_bits)
            .bind(&failure.error)
            .fetch_optional(&mut **tx)
            .await?;

        // Cascade-release later same-stream messages held by this
        // instance (spec.md §4.3). Perspective checkpoints are a
        // per-stream-per-perspective singleton, not a sequence, so the
        // cascade only applies to outbox/inbox.
        if let (Some(row), WorkClass::Outbox | WorkClass::Inbox) = (row, class) {
            let stream_id: Option<String> = row.try_get("stream_id").ok();
            let sequence_order: i64 = row.try_get("sequence_order").unwrap_or_default();
            if let Some(stream_id) = stream_id {
                cascade_release(tx, class, &stream_id, sequence_order).await?;
            }
        }
        let _ = now;
    }
    Ok(())
}

async fn cascade_release(
    tx: &mut Transaction<'_, Postgres>,
    class: WorkClass,
    stream_id: &str,
    sequence_order: i64,
) -> Result<(), StoreError> {
    let sql = match class {
        WorkClass::Outbox => {
            "UPDATE wh_outbox SET instance_id = NULL, lease_expiry = NULL
             WHERE stream_id = $1 AND sequence_order > $2 AND instance_id IS NOT NULL"
        }
        WorkClass::Inbox => {
            "UPDATE wh_inbox SET instance_id = NULL, lease_expiry = NULL
             WHERE stream_id = $1 AND sequence_order > $2 AND instance_id IS NOT NULL"
        }
        WorkClass::Perspective => unreachable!("perspective rows are not cascade-released"),
    };
    sqlx::query(sql)
        .bind(stream_id)
        .bind(sequence_order)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn ingest_message(
    tx: &mut Transaction<'_, Postgres>,
    class: WorkClass,
    message: &NewMessage,
    instance_id: InstanceId,
    partition_count: i32,
    lease_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let inserted = sqlx::query(
        "INSERT INTO wh_message_dedup (message_id, first_seen_at) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(message.message_id.as_uuid())
    .bind(now)
    .execute(&mut **tx)
    .await?;

    if inserted.rows_affected() == 0 {
        // Already seen: skip entirely, per spec.md §4.2 step 1.
        return Ok(());
    }

    let partition_number = message
        .stream_id
        .as_ref()
        .map(|s| partition_for_stream(s.as_str(), partition_count));
    let lease_expiry = now + chrono::Duration::seconds(lease_seconds);

    match class {
        WorkClass::Outbox => {
            sqlx::query(
                r#"
                INSERT INTO wh_outbox (message_id, destination, envelope_type, envelope_data, metadata, scope,
                    stream_id, partition_number, is_event, status, attempts, created_at, instance_id, lease_expiry)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12, $13)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(message.message_id.as_uuid())
            .bind(message.destination.as_deref().unwrap_or_default())
            .bind(&message.envelope_type)
            .bind(&message.envelope_data)
            .bind(&message.metadata)
            .bind(&message.scope)
            .bind(message.stream_id.as_ref().map(|s| s.as_str().to_string()))
            .bind(partition_number)
            .bind(message.is_event)
            .bind(StatusFlags::STORED.bits())
            .bind(now)
            .bind(instance_id.as_uuid())
            .bind(lease_expiry)
            .execute(&mut **tx)
            .await?;
        }
        WorkClass::Inbox => {
            sqlx::query(
                r#"
                INSERT INTO wh_inbox (message_id, handler_name, envelope_type, envelope_data, metadata, scope,
                    stream_id, partition_number, is_event, status, attempts, created_at, instance_id, lease_expiry)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12, $13)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(message.message_id.as_uuid())
            .bind(message.handler_name.as_deref().unwrap_or_default())
            .bind(&message.envelope_type)
            .bind(&message.envelope_data)
            .bind(&message.metadata)
            .bind(&message.scope)
            .bind(message.stream_id.as_ref().map(|s| s.as_str().to_string()))
            .bind(partition_number)
            .bind(message.is_event)
            .bind(StatusFlags::STORED.bits())
            .bind(now)
            .bind(instance_id.as_uuid())
            .bind(lease_expiry)
            .execute(&mut **tx)
            .await?;
        }
        WorkClass::Perspective => unreachable!("perspective checkpoints use ensure_perspective_checkpoint"),
    }

    if let Some(stream_id) = &message.stream_id {
        upsert_active_stream(
            tx,
            stream_id,
            instance_id,
            lease_expiry,
            partition_number.unwrap_or_default(),
            now,
        )
        .await?;
    }

    Ok(())
}

async fn upsert_active_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &StreamId,
    instance_id: InstanceId,
    lease_expiry: DateTime<Utc>,
    partition_number: i32,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO wh_active_streams (stream_id, assigned_instance_id, lease_expiry, partition_number, last_activity_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (stream_id) DO UPDATE
        SET assigned_instance_id = EXCLUDED.assigned_instance_id,
            lease_expiry = EXCLUDED.lease_expiry,
            partition_number = EXCLUDED.partition_number,
            last_activity_at = EXCLUDED.last_activity_at
        "#,
    )
    .bind(stream_id.as_str())
    .bind(instance_id.as_uuid())
    .bind(lease_expiry)
    .bind(partition_number)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Admits a `(stream_id, perspective_name)` pair if not already present.
/// The claim step still leases these rows through the same
/// partition/lease machinery as outbox/inbox (`spec.md` §4.1 step 7), but
/// per the Open Question 2 decision in `SPEC_FULL.md` §9 the runner that
/// processes a claimed checkpoint is the skeleton — it marks the
/// checkpoint done without loading or applying events, so `last_event_id`
/// is never advanced here. Not dedup-gated through `wh_message_dedup`
/// (there is no message id here) — the table's own unique constraint on
/// `(stream_id, perspective_name)` is the idempotency gate.
async fn ensure_perspective_checkpoint(
    tx: &mut Transaction<'_, Postgres>,
    checkpoint: &NewPerspectiveCheckpoint,
    partition_count: i32,
) -> Result<(), StoreError> {
    let partition_number = partition_for_stream(checkpoint.stream_id.as_str(), partition_count);
    sqlx::query(
        r#"
        INSERT INTO wh_perspective_checkpoints
            (checkpoint_id, stream_id, perspective_name, status, attempts, partition_number)
        VALUES ($1, $2, $3, $4, 0, $5)
        ON CONFLICT (stream_id, perspective_name) DO NOTHING
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(checkpoint.stream_id.as_str())
    .bind(&checkpoint.perspective_name)
    .bind(StatusFlags::STORED.bits())
    .bind(partition_number)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn renew_leases(
    tx: &mut Transaction<'_, Postgres>,
    class: WorkClass,
    ids: &[MessageId],
    instance_id: InstanceId,
    lease_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }
    let lease_expiry = now + chrono::Duration::seconds(lease_seconds);
    let id_uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
    let sql = match class {
        WorkClass::Outbox => {
            "UPDATE wh_outbox SET lease_expiry = $1 WHERE message_id = ANY($2) AND instance_id = $3"
        }
        WorkClass::Inbox => {
            "UPDATE wh_inbox SET lease_expiry = $1 WHERE message_id = ANY($2) AND instance_id = $3"
        }
        WorkClass::Perspective => {
            "UPDATE wh_perspective_checkpoints SET lease_expiry = $1 WHERE checkpoint_id = ANY($2) AND instance_id = $3"
        }
    };
    sqlx::query(sql)
        .bind(lease_expiry)
        .bind(&id_uuids)
        .bind(instance_id.as_uuid())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn live_instance_ids(tx: &mut Transaction<'_, Postgres>) -> Result<Vec<InstanceId>, StoreError> {
    let rows = sqlx::query("SELECT instance_id FROM wh_service_instances")
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows
        .iter()
        .map(|r| InstanceId::from_uuid(r.get("instance_id")))
        .collect())
}

fn terminal_bit(class: WorkClass) -> i32 {
    match class {
        WorkClass::Outbox => StatusFlags::PUBLISHED.bits(),
        WorkClass::Inbox => StatusFlags::RECEPTOR_PROCESSED.bits(),
        WorkClass::Perspective => {
            (StatusFlags::PERSPECTIVE_PROCESSED_INLINE | StatusFlags::PERSPECTIVE_PROCESSED_ASYNC).bits()
        }
    }
}

async fn claim_outbox(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: InstanceId,
    owned: &[i32],
    lease_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<WorkItem>, StoreError> {
    let lease_expiry = now + chrono::Duration::seconds(lease_seconds);
    let failed_bit = StatusFlags::FAILED.bits();
    let terminal = terminal_bit(WorkClass::Outbox);

    let rows = sqlx::query(
        r#"
        WITH candidates AS (
            SELECT message_id FROM wh_outbox
            WHERE published_at IS NULL
              AND (instance_id IS NULL OR lease_expiry < $1)
              AND (partition_number IS NULL OR partition_number = ANY($2))
              AND NOT EXISTS (
                  SELECT 1 FROM wh_outbox earlier
                  WHERE earlier.stream_id = wh_outbox.stream_id
                    AND earlier.stream_id IS NOT NULL
                    AND earlier.sequence_order < wh_outbox.sequence_order
                    AND (earlier.status & $3) = 0
                    AND (earlier.status & $4) = 0
              )
            ORDER BY sequence_order
            LIMIT $5
            FOR UPDATE SKIP LOCKED
        )
        UPDATE wh_outbox
        SET instance_id = $6, lease_expiry = $1
        FROM candidates
        WHERE wh_outbox.message_id = candidates.message_id
        RETURNING wh_outbox.message_id AS item_id, wh_outbox.stream_id, wh_outbox.partition_number,
            wh_outbox.destination, wh_outbox.envelope_type, wh_outbox.envelope_data, wh_outbox.metadata,
            wh_outbox.status, wh_outbox.attempts, wh_outbox.sequence_order, wh_outbox.lease_expiry
        "#,
    )
    .bind(now)
    .bind(owned)
    .bind(terminal)
    .bind(failed_bit)
    .bind(CLAIM_BATCH_LIMIT)
    .bind(instance_id.as_uuid())
    .bind(lease_expiry)
    .fetch_all(&mut **tx)
    .await?;

    rows.iter().map(|r| row_to_work_item(r, WorkClass::Outbox)).collect()
}

async fn claim_inbox(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: InstanceId,
    owned: &[i32],
    lease_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<WorkItem>, StoreError> {
    let lease_expiry = now + chrono::Duration::seconds(lease_seconds);
    let failed_bit = StatusFlags::FAILED.bits();
    let terminal = terminal_bit(WorkClass::Inbox);

    let rows = sqlx::query(
        r#"
        WITH candidates AS (
            SELECT message_id FROM wh_inbox
            WHERE (status & $3) = 0
              AND (status & $4) = 0
              AND (instance_id IS NULL OR lease_expiry < $1)
              AND (partition_number IS NULL OR partition_number = ANY($2))
              AND NOT EXISTS (
                  SELECT 1 FROM wh_inbox earlier
                  WHERE earlier.stream_id = wh_inbox.stream_id
                    AND earlier.stream_id IS NOT NULL
                    AND earlier.sequence_order < wh_inbox.sequence_order
                    AND (earlier.status & $3) = 0
                    AND (earlier.status & $4) = 0
              )
            ORDER BY sequence_order
            LIMIT $5
            FOR UPDATE SKIP LOCKED
        )
        UPDATE wh_inbox
        SET instance_id = $6, lease_expiry = $1
        FROM candidates
        WHERE wh_inbox.message_id = candidates.message_id
        RETURNING wh_inbox.message_id AS item_id, wh_inbox.stream_id, wh_inbox.partition_number,
            wh_inbox.handler_name, wh_inbox.envelope_type, wh_inbox.envelope_data, wh_inbox.metadata,
            wh_inbox.status, wh_inbox.attempts, wh_inbox.sequence_order, wh_inbox.lease_expiry
        "#,
    )
    .bind(now)
    .bind(owned)
    .bind(terminal)
    .bind(failed_bit)
    .bind(CLAIM_BATCH_LIMIT)
    .bind(instance_id.as_uuid())
    .bind(lease_expiry)
    .fetch_all(&mut **tx)
    .await?;

    rows.iter().map(|r| row_to_work_item(r, WorkClass::Inbox)).collect()
}

async fn claim_perspective(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: InstanceId,
    owned: &[i32],
    lease_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<WorkItem>, StoreError> {
    let lease_expiry = now + chrono::Duration::seconds(lease_seconds);
    let failed_bit = StatusFlags::FAILED.bits();
    let terminal = terminal_bit(WorkClass::Perspective);

    // Checkpoints are per-stream-per-perspective singletons, not a
    // sequence, so there is no stream-ordering predicate here: the
    // unique (stream_id, perspective_name) constraint already prevents
    // two in-flight claims of the same checkpoint.
    let rows = sqlx::query(
        r#"
        WITH candidates AS (
            SELECT checkpoint_id FROM wh_perspective_checkpoints
            WHERE (status & $3) = 0
              AND (status & $4) = 0
              AND (instance_id IS NULL OR lease_expiry < $1)
              AND (partition_number IS NULL OR partition_number = ANY($2))
            ORDER BY sequence_order
            LIMIT $5
            FOR UPDATE SKIP LOCKED
        )
        UPDATE wh_perspective_checkpoints
        SET instance_id = $6, lease_expiry = $1
        FROM candidates
        WHERE wh_perspective_checkpoints.checkpoint_id = candidates.checkpoint_id
        RETURNING wh_perspective_checkpoints.checkpoint_id AS item_id,
            wh_perspective_checkpoints.stream_id, wh_perspective_checkpoints.partition_number,
            wh_perspective_checkpoints.perspective_name, wh_perspective_checkpoints.last_event_id,
            wh_perspective_checkpoints.status, wh_perspective_checkpoints.attempts,
            wh_perspective_checkpoints.sequence_order, wh_perspective_checkpoints.lease_expiry
        "#,
    )
    .bind(now)
    .bind(owned)
    .bind(terminal)
    .bind(failed_bit)
    .bind(CLAIM_BATCH_LIMIT)
    .bind(instance_id.as_uuid())
    .bind(lease_expiry)
    .fetch_all(&mut **tx)
    .await?;

    rows.iter()
        .map(|r| {
            let perspective_name: String = r.try_get("perspective_name")?;
            let last_event_id: Option<Uuid> = r.try_get("last_event_id")?;
            let envelope_data = serde_json::json!({
                "perspectiveName": perspective_name,
                "lastEventId": last_event_id,
            });
            let stream_id: Option<String> = r.try_get("stream_id")?;
            Ok(WorkItem {
                work_class: WorkClass::Perspective,
                message_id: MessageId::from_uuid(r.try_get("item_id")?),
                stream_id: stream_id.map(StreamId::from),
                partition_number: r.try_get("partition_number")?,
                destination: None,
                handler_name: Some(perspective_name.clone()),
                envelope_type: PERSPECTIVE_ENVELOPE_TYPE.to_string(),
                envelope_data,
                metadata: serde_json::json!({}),
                status: StatusFlags::from_bits_truncate(r.try_get::<i32, _>("status")?),
                attempts: r.try_get("attempts")?,
                sequence_order: r.try_get("sequence_order")?,
                lease_expiry: r.try_get("lease_expiry")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(Into::into)
}

fn row_to_work_item(row: &PgRow, work_class: WorkClass) -> Result<WorkItem, StoreError> {
    let stream_id: Option<String> = row.try_get("stream_id")?;
    let (destination, handler_name) = match work_class {
        WorkClass::Outbox => (row.try_get("destination")?, None),
        WorkClass::Inbox => (None, row.try_get("handler_name")?),
        WorkClass::Perspective => (None, None),
    };
    Ok(WorkItem {
        work_class,
        message_id: MessageId::from_uuid(row.try_get("item_id")?),
        stream_id: stream_id.map(StreamId::from),
        partition_number: row.try_get("partition_number")?,
        destination,
        handler_name,
        envelope_type: row.try_get("envelope_type")?,
        envelope_data: row.try_get("envelope_data")?,
        metadata: row.try_get("metadata")?,
        status: StatusFlags::from_bits_truncate(row.try_get::<i32, _>("status")?),
        attempts: row.try_get("attempts")?,
        sequence_order: row.try_get("sequence_order")?,
        lease_expiry: row.try_get("lease_expiry")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_bit_matches_pipeline_stage_per_class() {
        assert_eq!(terminal_bit(WorkClass::Outbox), StatusFlags::PUBLISHED.bits());
        assert_eq!(terminal_bit(WorkClass::Inbox), StatusFlags::RECEPTOR_PROCESSED.bits());
        assert_eq!(
            terminal_bit(WorkClass::Perspective),
            (StatusFlags::PERSPECTIVE_PROCESSED_INLINE | StatusFlags::PERSPECTIVE_PROCESSED_ASYNC).bits()
        );
    }
}
