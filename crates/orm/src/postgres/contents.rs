use sqlx::PgConnection;
use tracing::instrument;

use stagehand_core::errors::Result;
use stagehand_core::models::{Content, ContentStatus, NewContent};

const ADD_CONTENTS_QUERY: &str = r#"
    INSERT INTO contents (coll_id, scope, name, bytes, adler32, min_id, max_id, content_type,
                          status, substatus, content_metadata)
    SELECT * FROM UNNEST($1::BIGINT[], $2::TEXT[], $3::TEXT[], $4::BIGINT[], $5::TEXT[],
                         $6::BIGINT[], $7::BIGINT[], $8::SMALLINT[], $9::SMALLINT[],
                         $10::SMALLINT[], $11::JSONB[])
"#;

const GET_CONTENTS_BY_COLL_QUERY: &str = r#"
    SELECT content_id, coll_id, scope, name, min_id, max_id, content_type, status, substatus,
           bytes, adler32, content_metadata, created_at, updated_at
    FROM contents
    WHERE coll_id = $1
    ORDER BY content_id ASC
"#;

const GET_CONTENTS_BY_TRANSFORM_QUERY: &str = r#"
    SELECT c.content_id, c.coll_id, c.scope, c.name, c.min_id, c.max_id, c.content_type,
           c.status, c.substatus, c.bytes, c.adler32, c.content_metadata, c.created_at,
           c.updated_at
    FROM contents c
    JOIN collections coll ON coll.coll_id = c.coll_id
    WHERE coll.transform_id = $1
    ORDER BY c.content_id ASC
"#;

// Terminal content states never regress; the status filter enforces the
// monotone order at the database.
const UPDATE_CONTENTS_SUBSTATUS_QUERY: &str = r#"
    UPDATE contents AS c
    SET substatus = u.substatus,
        status = CASE WHEN u.substatus = ANY($3) THEN u.substatus ELSE c.status END,
        updated_at = NOW()
    FROM (SELECT UNNEST($1::BIGINT[]) AS content_id, UNNEST($2::SMALLINT[]) AS substatus) AS u
    WHERE c.content_id = u.content_id
      AND c.status <> ALL($3)
"#;

/// Bulk-insert newly mapped contents. A uniqueness violation on
/// `(coll_id, scope, name)` surfaces as `DuplicatedObject`: the mapping step
/// must only hand over files that are not yet recorded.
#[instrument(skip(conn, contents), fields(count = contents.len()))]
pub async fn add_contents(conn: &mut PgConnection, contents: &[NewContent]) -> Result<u64> {
    if contents.is_empty() {
        return Ok(0);
    }

    let mut coll_ids = Vec::with_capacity(contents.len());
    let mut scopes = Vec::with_capacity(contents.len());
    let mut names = Vec::with_capacity(contents.len());
    let mut bytes = Vec::with_capacity(contents.len());
    let mut adler32s = Vec::with_capacity(contents.len());
    let mut min_ids = Vec::with_capacity(contents.len());
    let mut max_ids = Vec::with_capacity(contents.len());
    let mut content_types = Vec::with_capacity(contents.len());
    let mut statuses = Vec::with_capacity(contents.len());
    let mut substatuses = Vec::with_capacity(contents.len());
    let mut metadatas = Vec::with_capacity(contents.len());

    for content in contents {
        coll_ids.push(content.coll_id);
        scopes.push(content.scope.clone());
        names.push(content.name.clone());
        bytes.push(content.bytes);
        adler32s.push(content.adler32.clone());
        min_ids.push(content.min_id);
        max_ids.push(content.max_id);
        content_types.push(content.content_type as i16);
        statuses.push(content.status as i16);
        substatuses.push(content.substatus as i16);
        metadatas.push(content.content_metadata.clone());
    }

    let result = sqlx::query(ADD_CONTENTS_QUERY)
        .bind(&coll_ids)
        .bind(&scopes)
        .bind(&names)
        .bind(&bytes)
        .bind(&adler32s)
        .bind(&min_ids)
        .bind(&max_ids)
        .bind(&content_types)
        .bind(&statuses)
        .bind(&substatuses)
        .bind(&metadatas)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

#[instrument(skip(conn))]
pub async fn get_contents_by_coll_id(
    conn: &mut PgConnection,
    coll_id: i64,
) -> Result<Vec<Content>> {
    let contents = sqlx::query_as::<_, Content>(GET_CONTENTS_BY_COLL_QUERY)
        .bind(coll_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(contents)
}

#[instrument(skip(conn))]
pub async fn get_contents_by_transform_id(
    conn: &mut PgConnection,
    transform_id: i64,
) -> Result<Vec<Content>> {
    let contents = sqlx::query_as::<_, Content>(GET_CONTENTS_BY_TRANSFORM_QUERY)
        .bind(transform_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(contents)
}

/// Apply per-content substatus deltas in bulk. Terminal substatuses also
/// promote the content status; rows already terminal are left untouched.
#[instrument(skip(conn, updates), fields(count = updates.len()))]
pub async fn update_contents_substatus(
    conn: &mut PgConnection,
    updates: &[(i64, ContentStatus)],
) -> Result<u64> {
    if updates.is_empty() {
        return Ok(0);
    }

    let content_ids: Vec<i64> = updates.iter().map(|(id, _)| *id).collect();
    let substatuses: Vec<i16> = updates.iter().map(|(_, s)| *s as i16).collect();
    let terminal_codes: Vec<i16> = [
        ContentStatus::Available,
        ContentStatus::Failed,
        ContentStatus::Lost,
    ]
    .iter()
    .map(|s| *s as i16)
    .collect();

    let result = sqlx::query(UPDATE_CONTENTS_SUBSTATUS_QUERY)
        .bind(&content_ids)
        .bind(&substatuses)
        .bind(&terminal_codes)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
