use sqlx::PgConnection;
use tracing::instrument;

use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{Request, RequestStatus};

pub struct NewRequest {
    pub workload_id: Option<i64>,
    pub requester: Option<String>,
    pub priority: i32,
    pub status: RequestStatus,
    pub request_metadata: Option<serde_json::Value>,
}

#[derive(Default)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub priority: Option<i32>,
    pub request_metadata: Option<serde_json::Value>,
}

const ADD_REQUEST_QUERY: &str = r#"
    INSERT INTO requests (workload_id, requester, priority, status, request_metadata)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING request_id
"#;

const GET_REQUEST_QUERY: &str = r#"
    SELECT request_id, workload_id, requester, priority, status, request_metadata,
           created_at, updated_at
    FROM requests
    WHERE request_id = $1
"#;

const GET_REQUESTS_BY_STATUS_QUERY: &str = r#"
    SELECT request_id, workload_id, requester, priority, status, request_metadata,
           created_at, updated_at
    FROM requests
    WHERE status = ANY($1)
    ORDER BY priority DESC, request_id ASC
"#;

const UPDATE_REQUEST_QUERY: &str = r#"
    UPDATE requests
    SET status = COALESCE($2, status),
        priority = COALESCE($3, priority),
        request_metadata = COALESCE($4, request_metadata),
        updated_at = NOW()
    WHERE request_id = $1
"#;

#[instrument(skip(conn, request))]
pub async fn add_request(conn: &mut PgConnection, request: NewRequest) -> Result<i64> {
    let request_id: i64 = sqlx::query_scalar(ADD_REQUEST_QUERY)
        .bind(request.workload_id)
        .bind(&request.requester)
        .bind(request.priority)
        .bind(request.status)
        .bind(&request.request_metadata)
        .fetch_one(&mut *conn)
        .await?;
    Ok(request_id)
}

#[instrument(skip(conn))]
pub async fn get_request(conn: &mut PgConnection, request_id: i64) -> Result<Request> {
    let request = sqlx::query_as::<_, Request>(GET_REQUEST_QUERY)
        .bind(request_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| OrchestratorError::NoObject(format!("request {}", request_id)))?;
    Ok(request)
}

#[instrument(skip(conn, statuses))]
pub async fn get_requests_by_status(
    conn: &mut PgConnection,
    statuses: &[RequestStatus],
) -> Result<Vec<Request>> {
    let status_codes: Vec<i16> = statuses.iter().map(|s| *s as i16).collect();
    let requests = sqlx::query_as::<_, Request>(GET_REQUESTS_BY_STATUS_QUERY)
        .bind(&status_codes)
        .fetch_all(&mut *conn)
        .await?;
    Ok(requests)
}

#[instrument(skip(conn, update))]
pub async fn update_request(
    conn: &mut PgConnection,
    request_id: i64,
    update: RequestUpdate,
) -> Result<()> {
    let result = sqlx::query(UPDATE_REQUEST_QUERY)
        .bind(request_id)
        .bind(update.status)
        .bind(update.priority)
        .bind(&update.request_metadata)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::NoObject(format!(
            "request {}",
            request_id
        )));
    }
    Ok(())
}
