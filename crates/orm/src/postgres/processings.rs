use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{LockState, NewProcessing, Processing, ProcessingStatus};

#[derive(Default)]
pub struct ProcessingUpdate {
    pub status: Option<ProcessingStatus>,
    pub substatus: Option<ProcessingStatus>,
    pub locking: Option<LockState>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub processing_metadata: Option<serde_json::Value>,
    pub output_metadata: Option<serde_json::Value>,
}

const ADD_PROCESSING_QUERY: &str = r#"
    INSERT INTO processings (transform_id, status, substatus, locking, submitter, granularity,
                             granularity_type, expired_at, processing_metadata, output_metadata)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING processing_id
"#;

const GET_PROCESSING_QUERY: &str = r#"
    SELECT processing_id, transform_id, status, substatus, locking, submitter, granularity,
           granularity_type, expired_at, created_at, updated_at, next_poll_at, finished_at,
           processing_metadata, output_metadata
    FROM processings
    WHERE processing_id = $1
"#;

const GET_PROCESSINGS_BY_TRANSFORM_QUERY: &str = r#"
    SELECT processing_id, transform_id, status, substatus, locking, submitter, granularity,
           granularity_type, expired_at, created_at, updated_at, next_poll_at, finished_at,
           processing_metadata, output_metadata
    FROM processings
    WHERE transform_id = $1
    ORDER BY processing_id ASC
"#;

// Same claim shape as for transforms: select due rows and flip the lock in
// one statement so concurrent pollers get disjoint batches.
const CLAIM_PROCESSINGS_QUERY: &str = r#"
    WITH due AS (
        SELECT processing_id
        FROM processings
        WHERE status = ANY($1)
          AND next_poll_at < NOW()
          AND locking = $5
          AND ($2::BIGINT IS NULL OR updated_at < NOW() - ($2 * INTERVAL '1 second'))
          AND ($4::TEXT IS NULL OR submitter = $4)
        ORDER BY updated_at ASC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    UPDATE processings p
    SET locking = $6,
        updated_at = NOW()
    FROM due
    WHERE p.processing_id = due.processing_id
    RETURNING p.processing_id, p.transform_id, p.status, p.substatus, p.locking, p.submitter,
              p.granularity, p.granularity_type, p.expired_at, p.created_at, p.updated_at,
              p.next_poll_at, p.finished_at, p.processing_metadata, p.output_metadata
"#;

const UPDATE_PROCESSING_QUERY: &str = r#"
    UPDATE processings
    SET status = COALESCE($2, status),
        substatus = COALESCE($3, substatus),
        locking = COALESCE($4, locking),
        next_poll_at = COALESCE($5, next_poll_at),
        processing_metadata = COALESCE($6, processing_metadata),
        output_metadata = COALESCE($7, output_metadata),
        finished_at = COALESCE($8, finished_at),
        updated_at = NOW()
    WHERE processing_id = $1
"#;

const DELETE_PROCESSING_QUERY: &str = "DELETE FROM processings WHERE processing_id = $1";

const CLEAN_LOCKING_QUERY: &str = r#"
    UPDATE processings
    SET locking = $1
    WHERE locking = $2
      AND updated_at < NOW() - ($3 * INTERVAL '1 second')
"#;

const CLEAN_NEXT_POLL_AT_QUERY: &str = r#"
    UPDATE processings
    SET next_poll_at = NOW()
    WHERE status = ANY($1)
"#;

#[instrument(skip(conn, processing))]
pub async fn add_processing(conn: &mut PgConnection, processing: NewProcessing) -> Result<i64> {
    let processing_id: i64 = sqlx::query_scalar(ADD_PROCESSING_QUERY)
        .bind(processing.transform_id)
        .bind(processing.status)
        .bind(processing.substatus)
        .bind(LockState::Idle)
        .bind(&processing.submitter)
        .bind(processing.granularity)
        .bind(processing.granularity_type)
        .bind(processing.expired_at)
        .bind(&processing.processing_metadata)
        .bind(&processing.output_metadata)
        .fetch_one(&mut *conn)
        .await?;
    Ok(processing_id)
}

#[instrument(skip(conn))]
pub async fn get_processing(conn: &mut PgConnection, processing_id: i64) -> Result<Processing> {
    let processing = sqlx::query_as::<_, Processing>(GET_PROCESSING_QUERY)
        .bind(processing_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| OrchestratorError::NoObject(format!("processing {}", processing_id)))?;
    Ok(processing)
}

#[instrument(skip(conn))]
pub async fn get_processings_by_transform_id(
    conn: &mut PgConnection,
    transform_id: i64,
) -> Result<Vec<Processing>> {
    let processings = sqlx::query_as::<_, Processing>(GET_PROCESSINGS_BY_TRANSFORM_QUERY)
        .bind(transform_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(processings)
}

/// Claim up to `bulk_size` due processings, optionally restricted to one
/// submitter. Claimed rows come back with `locking = Locked`.
#[instrument(skip(conn, statuses))]
pub async fn claim_processings_by_status(
    conn: &mut PgConnection,
    statuses: &[ProcessingStatus],
    period_secs: Option<i64>,
    bulk_size: i64,
    submitter: Option<&str>,
) -> Result<Vec<Processing>> {
    let status_codes: Vec<i16> = statuses.iter().map(|s| *s as i16).collect();
    let processings = sqlx::query_as::<_, Processing>(CLAIM_PROCESSINGS_QUERY)
        .bind(&status_codes)
        .bind(period_secs)
        .bind(bulk_size)
        .bind(submitter)
        .bind(LockState::Idle)
        .bind(LockState::Locked)
        .fetch_all(&mut *conn)
        .await?;
    Ok(processings)
}

#[instrument(skip(conn, update))]
pub async fn update_processing(
    conn: &mut PgConnection,
    processing_id: i64,
    update: ProcessingUpdate,
) -> Result<()> {
    let finished_at = update
        .status
        .filter(|s| s.is_terminal())
        .map(|_| Utc::now());

    let result = sqlx::query(UPDATE_PROCESSING_QUERY)
        .bind(processing_id)
        .bind(update.status)
        .bind(update.substatus)
        .bind(update.locking)
        .bind(update.next_poll_at)
        .bind(&update.processing_metadata)
        .bind(&update.output_metadata)
        .bind(finished_at)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::NoObject(format!(
            "processing {}",
            processing_id
        )));
    }
    Ok(())
}

#[instrument(skip(conn))]
pub async fn delete_processing(conn: &mut PgConnection, processing_id: i64) -> Result<()> {
    sqlx::query(DELETE_PROCESSING_QUERY)
        .bind(processing_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Expire claims older than `time_period_secs`.
#[instrument(skip(conn))]
pub async fn clean_locking(conn: &mut PgConnection, time_period_secs: i64) -> Result<u64> {
    let result = sqlx::query(CLEAN_LOCKING_QUERY)
        .bind(LockState::Idle)
        .bind(LockState::Locked)
        .bind(time_period_secs)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Force an immediate re-poll of every processing in the given statuses.
#[instrument(skip(conn, statuses))]
pub async fn clean_next_poll_at(
    conn: &mut PgConnection,
    statuses: &[ProcessingStatus],
) -> Result<u64> {
    let status_codes: Vec<i16> = statuses.iter().map(|s| *s as i16).collect();
    let result = sqlx::query(CLEAN_NEXT_POLL_AT_QUERY)
        .bind(&status_codes)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
