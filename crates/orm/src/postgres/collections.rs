use sqlx::PgConnection;
use tracing::instrument;

use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{Collection, CollectionRelationType, CollectionStatus};

pub struct NewCollection {
    pub transform_id: i64,
    pub relation_type: CollectionRelationType,
    pub scope: String,
    pub name: String,
    pub status: CollectionStatus,
    pub coll_metadata: Option<serde_json::Value>,
}

#[derive(Default)]
pub struct CollectionUpdate {
    pub status: Option<CollectionStatus>,
    pub coll_metadata: Option<serde_json::Value>,
}

const ADD_COLLECTION_QUERY: &str = r#"
    INSERT INTO collections (transform_id, relation_type, scope, name, status, coll_metadata)
    VALUES ($1, $2, $3, $4, $5, $6)
    RETURNING coll_id
"#;

const GET_COLLECTION_QUERY: &str = r#"
    SELECT coll_id, transform_id, relation_type, scope, name, status, coll_metadata,
           created_at, updated_at
    FROM collections
    WHERE coll_id = $1
"#;

const GET_COLLECTIONS_BY_TRANSFORM_QUERY: &str = r#"
    SELECT coll_id, transform_id, relation_type, scope, name, status, coll_metadata,
           created_at, updated_at
    FROM collections
    WHERE transform_id = $1
    ORDER BY coll_id ASC
"#;

const UPDATE_COLLECTION_QUERY: &str = r#"
    UPDATE collections
    SET status = COALESCE($2, status),
        coll_metadata = COALESCE($3, coll_metadata),
        updated_at = NOW()
    WHERE coll_id = $1
"#;

#[instrument(skip(conn, collection), fields(scope = %collection.scope, name = %collection.name))]
pub async fn add_collection(conn: &mut PgConnection, collection: NewCollection) -> Result<i64> {
    let coll_id: i64 = sqlx::query_scalar(ADD_COLLECTION_QUERY)
        .bind(collection.transform_id)
        .bind(collection.relation_type)
        .bind(&collection.scope)
        .bind(&collection.name)
        .bind(collection.status)
        .bind(&collection.coll_metadata)
        .fetch_one(&mut *conn)
        .await?;
    Ok(coll_id)
}

#[instrument(skip(conn))]
pub async fn get_collection(conn: &mut PgConnection, coll_id: i64) -> Result<Collection> {
    let collection = sqlx::query_as::<_, Collection>(GET_COLLECTION_QUERY)
        .bind(coll_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| OrchestratorError::NoObject(format!("collection {}", coll_id)))?;
    Ok(collection)
}

#[instrument(skip(conn))]
pub async fn get_collections_by_transform_id(
    conn: &mut PgConnection,
    transform_id: i64,
) -> Result<Vec<Collection>> {
    let collections = sqlx::query_as::<_, Collection>(GET_COLLECTIONS_BY_TRANSFORM_QUERY)
        .bind(transform_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(collections)
}

#[instrument(skip(conn, update))]
pub async fn update_collection(
    conn: &mut PgConnection,
    coll_id: i64,
    update: CollectionUpdate,
) -> Result<()> {
    let result = sqlx::query(UPDATE_COLLECTION_QUERY)
        .bind(coll_id)
        .bind(update.status)
        .bind(&update.coll_metadata)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::NoObject(format!(
            "collection {}",
            coll_id
        )));
    }
    Ok(())
}
