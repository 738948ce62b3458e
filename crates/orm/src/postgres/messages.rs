//! Durable message outbox.
//!
//! A message row exists iff the state transition that caused it committed:
//! `add_message` must run on the same transaction as that state change. An
//! external publisher drains the table with `retrieve_messages` /
//! `delete_messages`; delivery is at-least-once and messages are idempotent.

use sqlx::PgConnection;
use tracing::instrument;

use stagehand_core::errors::Result;
use stagehand_core::models::{Message, MessageSource, MessageStatus, MessageType};

pub struct NewMessage {
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub source: MessageSource,
    pub transform_id: i64,
    pub num_contents: i32,
    pub bulk_size: Option<i32>,
    pub msg_content: serde_json::Value,
}

const ADD_MESSAGE_QUERY: &str = r#"
    INSERT INTO messages (msg_type, status, source, transform_id, num_contents, bulk_size,
                          msg_content)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    RETURNING msg_id
"#;

// LIMIT NULL means no limit.
const RETRIEVE_MESSAGES_QUERY: &str = r#"
    SELECT msg_id, msg_type, status, source, transform_id, num_contents, bulk_size, msg_content,
           created_at, updated_at
    FROM messages
    WHERE ($2::SMALLINT IS NULL OR msg_type = $2)
      AND ($3::SMALLINT IS NULL OR status = $3)
      AND ($4::SMALLINT IS NULL OR source = $4)
    ORDER BY msg_id ASC
    LIMIT $1
"#;

const DELETE_MESSAGES_QUERY: &str = "DELETE FROM messages WHERE msg_id = ANY($1)";

const UPDATE_MESSAGES_QUERY: &str = r#"
    UPDATE messages AS m
    SET status = u.status,
        updated_at = NOW()
    FROM (SELECT UNNEST($1::BIGINT[]) AS msg_id, UNNEST($2::SMALLINT[]) AS status) AS u
    WHERE m.msg_id = u.msg_id
"#;

#[instrument(skip(conn, message), fields(transform_id = message.transform_id))]
pub async fn add_message(conn: &mut PgConnection, message: NewMessage) -> Result<i64> {
    let msg_id: i64 = sqlx::query_scalar(ADD_MESSAGE_QUERY)
        .bind(message.msg_type)
        .bind(message.status)
        .bind(message.source)
        .bind(message.transform_id)
        .bind(message.num_contents)
        .bind(message.bulk_size)
        .bind(&message.msg_content)
        .fetch_one(&mut *conn)
        .await?;
    Ok(msg_id)
}

/// Retrieve up to `bulk_size` messages, oldest first.
#[instrument(skip(conn))]
pub async fn retrieve_messages(
    conn: &mut PgConnection,
    bulk_size: Option<i64>,
    msg_type: Option<MessageType>,
    status: Option<MessageStatus>,
    source: Option<MessageSource>,
) -> Result<Vec<Message>> {
    let messages = sqlx::query_as::<_, Message>(RETRIEVE_MESSAGES_QUERY)
        .bind(bulk_size)
        .bind(msg_type.map(|t| t as i16))
        .bind(status.map(|s| s as i16))
        .bind(source.map(|s| s as i16))
        .fetch_all(&mut *conn)
        .await?;
    Ok(messages)
}

#[instrument(skip(conn, msg_ids), fields(count = msg_ids.len()))]
pub async fn delete_messages(conn: &mut PgConnection, msg_ids: &[i64]) -> Result<u64> {
    if msg_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(DELETE_MESSAGES_QUERY)
        .bind(msg_ids)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

#[instrument(skip(conn, updates), fields(count = updates.len()))]
pub async fn update_messages(
    conn: &mut PgConnection,
    updates: &[(i64, MessageStatus)],
) -> Result<u64> {
    if updates.is_empty() {
        return Ok(0);
    }
    let msg_ids: Vec<i64> = updates.iter().map(|(id, _)| *id).collect();
    let statuses: Vec<i16> = updates.iter().map(|(_, s)| *s as i16).collect();
    let result = sqlx::query(UPDATE_MESSAGES_QUERY)
        .bind(&msg_ids)
        .bind(&statuses)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
