use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{LockState, Transform, TransformStatus, TransformType};

pub struct NewTransform {
    pub transform_type: TransformType,
    pub transform_tag: Option<String>,
    pub priority: i32,
    pub status: TransformStatus,
    pub retries: i32,
    pub expired_at: Option<DateTime<Utc>>,
    pub transform_metadata: Option<serde_json::Value>,
    /// Link the new transform to its originating request.
    pub request_id: Option<i64>,
    /// Link the new transform to a workload-progress row.
    pub workprogress_id: Option<i64>,
}

#[derive(Default)]
pub struct TransformUpdate {
    pub status: Option<TransformStatus>,
    pub substatus: Option<String>,
    pub locking: Option<LockState>,
    pub retries: Option<i32>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub transform_metadata: Option<serde_json::Value>,
}

const ADD_TRANSFORM_QUERY: &str = r#"
    INSERT INTO transforms (transform_type, transform_tag, priority, status, locking, retries,
                            expired_at, transform_metadata)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    RETURNING transform_id
"#;

const ADD_REQ2TRANSFORM_QUERY: &str = r#"
    INSERT INTO req2transforms (request_id, transform_id)
    VALUES ($1, $2)
"#;

const ADD_WP2TRANSFORM_QUERY: &str = r#"
    INSERT INTO workprogress2transforms (workprogress_id, transform_id)
    VALUES ($1, $2)
"#;

const GET_TRANSFORM_QUERY: &str = r#"
    SELECT transform_id, transform_type, transform_tag, priority, status, substatus, locking,
           retries, expired_at, created_at, updated_at, next_poll_at, finished_at, transform_metadata
    FROM transforms
    WHERE transform_id = $1
"#;

const GET_TRANSFORMS_BY_REQUEST_QUERY: &str = r#"
    SELECT t.transform_id, t.transform_type, t.transform_tag, t.priority, t.status, t.substatus,
           t.locking, t.retries, t.expired_at, t.created_at, t.updated_at, t.next_poll_at,
           t.finished_at, t.transform_metadata
    FROM transforms t
    JOIN req2transforms r ON r.transform_id = t.transform_id
    WHERE r.request_id = $1
    ORDER BY t.transform_id ASC
"#;

// Due-work selection and the lock flip happen in one statement so that two
// concurrent agents always claim disjoint subsets.
const CLAIM_TRANSFORMS_QUERY: &str = r#"
    WITH due AS (
        SELECT transform_id
        FROM transforms
        WHERE status = ANY($1)
          AND next_poll_at < NOW()
          AND locking = $4
          AND ($2::BIGINT IS NULL OR updated_at < NOW() - ($2 * INTERVAL '1 second'))
        ORDER BY updated_at ASC, priority DESC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    UPDATE transforms t
    SET locking = $5,
        updated_at = NOW()
    FROM due
    WHERE t.transform_id = due.transform_id
    RETURNING t.transform_id, t.transform_type, t.transform_tag, t.priority, t.status, t.substatus,
              t.locking, t.retries, t.expired_at, t.created_at, t.updated_at, t.next_poll_at,
              t.finished_at, t.transform_metadata
"#;

const UPDATE_TRANSFORM_QUERY: &str = r#"
    UPDATE transforms
    SET status = COALESCE($2, status),
        substatus = COALESCE($3, substatus),
        locking = COALESCE($4, locking),
        retries = COALESCE($5, retries),
        next_poll_at = COALESCE($6, next_poll_at),
        transform_metadata = COALESCE($7, transform_metadata),
        finished_at = COALESCE($8, finished_at),
        updated_at = NOW()
    WHERE transform_id = $1
"#;

const DELETE_REQ2TRANSFORM_QUERY: &str = "DELETE FROM req2transforms WHERE transform_id = $1";
const DELETE_WP2TRANSFORM_QUERY: &str =
    "DELETE FROM workprogress2transforms WHERE transform_id = $1";
const DELETE_TRANSFORM_QUERY: &str = "DELETE FROM transforms WHERE transform_id = $1";

const CLEAN_LOCKING_QUERY: &str = r#"
    UPDATE transforms
    SET locking = $1
    WHERE locking = $2
      AND updated_at < NOW() - ($3 * INTERVAL '1 second')
"#;

const CLEAN_NEXT_POLL_AT_QUERY: &str = r#"
    UPDATE transforms
    SET next_poll_at = NOW()
    WHERE status = ANY($1)
"#;

/// Insert a transform together with its junction rows.
#[instrument(skip(conn, transform))]
pub async fn add_transform(conn: &mut PgConnection, transform: NewTransform) -> Result<i64> {
    let transform_id: i64 = sqlx::query_scalar(ADD_TRANSFORM_QUERY)
        .bind(transform.transform_type)
        .bind(&transform.transform_tag)
        .bind(transform.priority)
        .bind(transform.status)
        .bind(LockState::Idle)
        .bind(transform.retries)
        .bind(transform.expired_at)
        .bind(&transform.transform_metadata)
        .fetch_one(&mut *conn)
        .await?;

    if let Some(request_id) = transform.request_id {
        sqlx::query(ADD_REQ2TRANSFORM_QUERY)
            .bind(request_id)
            .bind(transform_id)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(workprogress_id) = transform.workprogress_id {
        sqlx::query(ADD_WP2TRANSFORM_QUERY)
            .bind(workprogress_id)
            .bind(transform_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(transform_id)
}

#[instrument(skip(conn))]
pub async fn get_transform(conn: &mut PgConnection, transform_id: i64) -> Result<Transform> {
    let transform = sqlx::query_as::<_, Transform>(GET_TRANSFORM_QUERY)
        .bind(transform_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| OrchestratorError::NoObject(format!("transform {}", transform_id)))?;
    Ok(transform)
}

#[instrument(skip(conn))]
pub async fn get_transforms_by_request_id(
    conn: &mut PgConnection,
    request_id: i64,
) -> Result<Vec<Transform>> {
    let transforms = sqlx::query_as::<_, Transform>(GET_TRANSFORMS_BY_REQUEST_QUERY)
        .bind(request_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(transforms)
}

/// Claim up to `bulk_size` due transforms: rows in one of `statuses` whose
/// `next_poll_at` has passed and that no other agent holds. Claimed rows come
/// back with `locking = Locked`.
#[instrument(skip(conn, statuses))]
pub async fn claim_transforms_by_status(
    conn: &mut PgConnection,
    statuses: &[TransformStatus],
    period_secs: Option<i64>,
    bulk_size: i64,
) -> Result<Vec<Transform>> {
    let status_codes: Vec<i16> = statuses.iter().map(|s| *s as i16).collect();
    let transforms = sqlx::query_as::<_, Transform>(CLAIM_TRANSFORMS_QUERY)
        .bind(&status_codes)
        .bind(period_secs)
        .bind(bulk_size)
        .bind(LockState::Idle)
        .bind(LockState::Locked)
        .fetch_all(&mut *conn)
        .await?;
    Ok(transforms)
}

#[instrument(skip(conn, update))]
pub async fn update_transform(
    conn: &mut PgConnection,
    transform_id: i64,
    update: TransformUpdate,
) -> Result<()> {
    let finished_at = update
        .status
        .filter(|s| s.is_terminal())
        .map(|_| Utc::now());

    let result = sqlx::query(UPDATE_TRANSFORM_QUERY)
        .bind(transform_id)
        .bind(update.status)
        .bind(&update.substatus)
        .bind(update.locking)
        .bind(update.retries)
        .bind(update.next_poll_at)
        .bind(&update.transform_metadata)
        .bind(finished_at)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::NoObject(format!(
            "transform {}",
            transform_id
        )));
    }
    Ok(())
}

/// Remove a transform and its junction rows.
#[instrument(skip(conn))]
pub async fn delete_transform(conn: &mut PgConnection, transform_id: i64) -> Result<()> {
    sqlx::query(DELETE_REQ2TRANSFORM_QUERY)
        .bind(transform_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(DELETE_WP2TRANSFORM_QUERY)
        .bind(transform_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(DELETE_TRANSFORM_QUERY)
        .bind(transform_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Expire claims older than `time_period_secs`. Crashed agents leave rows
/// locked; this puts them back into rotation.
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

/// Force an immediate re-poll of every transform in the given statuses.
#[instrument(skip(conn, statuses))]
pub async fn clean_next_poll_at(
    conn: &mut PgConnection,
    statuses: &[TransformStatus],
) -> Result<u64> {
    let status_codes: Vec<i16> = statuses.iter().map(|s| *s as i16).collect();
    let result = sqlx::query(CLEAN_NEXT_POLL_AT_QUERY)
        .bind(&status_codes)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
