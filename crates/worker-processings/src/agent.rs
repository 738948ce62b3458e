//! Processing agent: polls the external replication rules of submitted
//! processings and reconciles their progress back onto contents and the
//! processing row.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::{error, info, instrument, warn};

use stagehand_core::backoff::BackoffPolicy;
use stagehand_core::config::{AgentConfig, DataServiceConfig};
use stagehand_core::dataservice::DataService;
use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{
    ContentStatus, LockState, MessageSource, MessageStatus, MessageType, Processing,
    ProcessingStatus, TransformStatus,
};
use stagehand_core::rucio::RucioClient;
use stagehand_orm::postgres::processings::ProcessingUpdate;
use stagehand_orm::postgres::transforms::TransformUpdate;
use stagehand_orm::postgres::{collections, contents, messages, processings, transforms};
use stagehand_workflow::work::{ContentDelta, PollUpdates, Work, build_input_output_maps};

pub struct ProcessingAgentContext {
    pub pool: Pool<Postgres>,
    pub data_service: DataServiceConfig,
    pub agent: AgentConfig,
    pub backoff: BackoffPolicy,
}

/// One agent tick: claim due processings and poll each one.
#[instrument(name = "processing_agent_tick", skip_all)]
pub async fn tick(ctx: &ProcessingAgentContext) -> anyhow::Result<()> {
    // A fresh client per tick; connection reuse is the pool's concern.
    let svc = RucioClient::new(&ctx.data_service)?;

    let claimed = {
        let mut tx = ctx.pool.begin().await?;
        let claimed = processings::claim_processings_by_status(
            &mut tx,
            &[ProcessingStatus::Submitted, ProcessingStatus::Running],
            ctx.agent.poll_period.map(|p| p.as_secs() as i64),
            ctx.agent.bulk_size,
            None,
        )
        .await?;
        tx.commit().await?;
        claimed
    };

    if claimed.is_empty() {
        return Ok(());
    }
    info!("Claimed {} processings", claimed.len());

    for processing in &claimed {
        match poll_processing(ctx, &svc, processing).await {
            Ok(()) => {}
            Err(OrchestratorError::ProcessNotFound(msg)) => {
                warn!(
                    "Processing {}: external rule vanished: {}",
                    processing.processing_id, msg
                );
                if let Err(e) = mark_lost(ctx, processing, &msg).await {
                    error!(
                        "Could not mark processing {} as lost: {}",
                        processing.processing_id, e
                    );
                }
            }
            Err(e) => {
                error!("Processing {} poll failed: {}", processing.processing_id, e);
                if let Err(release_err) = release_with_backoff(ctx, processing).await {
                    error!(
                        "Could not release processing {}: {}",
                        processing.processing_id, release_err
                    );
                }
            }
        }
    }

    Ok(())
}

#[instrument(skip(ctx, svc, processing), fields(processing_id = processing.processing_id))]
async fn poll_processing(
    ctx: &ProcessingAgentContext,
    svc: &dyn DataService,
    processing: &Processing,
) -> Result<()> {
    let transform_id = processing.transform_id;

    let (transform, collections, all_contents) = {
        let mut conn = ctx.pool.acquire().await?;
        let transform = transforms::get_transform(&mut conn, transform_id).await?;
        let collections =
            collections::get_collections_by_transform_id(&mut conn, transform_id).await?;
        let contents = contents::get_contents_by_transform_id(&mut conn, transform_id).await?;
        (transform, collections, contents)
    };

    let work = Work::from_transform(&transform, collections.clone(), vec![processing.clone()])?;
    let maps = build_input_output_maps(&collections, &all_contents);

    let updates = work.poll_processing_updates(svc, processing, &maps).await?;

    // Content deltas, the processing delta and the outbox message commit
    // together; a reader seeing the processing Finished also sees its
    // contents Available.
    let mut tx = ctx.pool.begin().await?;
    if !updates.updated_contents.is_empty() {
        let deltas: Vec<(i64, ContentStatus)> = updates
            .updated_contents
            .iter()
            .map(|delta| (delta.content_id, delta.substatus))
            .collect();
        contents::update_contents_substatus(&mut tx, &deltas).await?;
    }
    processings::update_processing(
        &mut tx,
        processing.processing_id,
        ProcessingUpdate {
            status: updates.processing_status,
            substatus: updates.processing_status,
            locking: Some(LockState::Idle),
            next_poll_at: Some(next_poll_at(&ctx.backoff, 0)),
            ..ProcessingUpdate::default()
        },
    )
    .await?;
    if updates.processing_status.is_some() || !updates.updated_contents.is_empty() {
        messages::add_message(&mut tx, poll_message(processing, &updates)).await?;
    }
    tx.commit().await?;

    if let Some(status) = updates.processing_status {
        info!(
            "Processing {}: {:?} -> {:?} (rule state {}, {} content updates)",
            processing.processing_id,
            processing.status,
            status,
            updates.rule_state,
            updates.updated_contents.len()
        );
    }
    Ok(())
}

/// The external rule is gone for good: the processing is lost and its
/// transform has failed. Both transitions and the message commit together.
async fn mark_lost(
    ctx: &ProcessingAgentContext,
    processing: &Processing,
    reason: &str,
) -> Result<()> {
    let substatus: String = reason.chars().take(512).collect();

    let mut tx = ctx.pool.begin().await?;
    processings::update_processing(
        &mut tx,
        processing.processing_id,
        ProcessingUpdate {
            status: Some(ProcessingStatus::Lost),
            substatus: Some(ProcessingStatus::Lost),
            locking: Some(LockState::Idle),
            ..ProcessingUpdate::default()
        },
    )
    .await?;
    transforms::update_transform(
        &mut tx,
        processing.transform_id,
        TransformUpdate {
            status: Some(TransformStatus::Failed),
            substatus: Some(substatus),
            ..TransformUpdate::default()
        },
    )
    .await?;
    messages::add_message(
        &mut tx,
        messages::NewMessage {
            msg_type: MessageType::TransformStageIn,
            status: MessageStatus::New,
            source: MessageSource::ProcessingAgent,
            transform_id: processing.transform_id,
            num_contents: 0,
            bulk_size: None,
            msg_content: serde_json::json!({
                "transform_id": processing.transform_id,
                "processing_id": processing.processing_id,
                "status": TransformStatus::Failed,
                "reason": reason,
            }),
        },
    )
    .await?;
    tx.commit().await?;

    info!(
        "Processing {} lost, transform {} failed",
        processing.processing_id, processing.transform_id
    );
    Ok(())
}

/// Transient failure: no state advance, release the claim with backoff.
async fn release_with_backoff(
    ctx: &ProcessingAgentContext,
    processing: &Processing,
) -> Result<()> {
    let mut tx = ctx.pool.begin().await?;
    processings::update_processing(
        &mut tx,
        processing.processing_id,
        ProcessingUpdate {
            locking: Some(LockState::Idle),
            next_poll_at: Some(next_poll_at(&ctx.backoff, 1)),
            ..ProcessingUpdate::default()
        },
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

fn next_poll_at(backoff: &BackoffPolicy, retries: u32) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(backoff.delay(retries).as_millis() as i64)
}

fn poll_message(processing: &Processing, updates: &PollUpdates) -> messages::NewMessage {
    let updated_files: Vec<serde_json::Value> = updates
        .updated_contents
        .iter()
        .map(|delta: &ContentDelta| {
            serde_json::json!({
                "content_id": delta.content_id,
                "substatus": delta.substatus,
            })
        })
        .collect();

    messages::NewMessage {
        msg_type: MessageType::FileStageIn,
        status: MessageStatus::New,
        source: MessageSource::ProcessingAgent,
        transform_id: processing.transform_id,
        num_contents: updated_files.len() as i32,
        bulk_size: None,
        msg_content: serde_json::json!({
            "processing_id": processing.processing_id,
            "transform_id": processing.transform_id,
            "status": updates.processing_status,
            "updated_files": updated_files,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_message_envelope() {
        let meta = stagehand_core::models::ProcessingMeta::V1(
            stagehand_core::models::StageInProcessingMeta {
                internal_id: uuid::Uuid::new_v4(),
                src_rse: "SRC".to_string(),
                dest_rse: "DST".to_string(),
                life_time: 3600,
                rule_id: Some("R".to_string()),
            },
        );
        let processing = Processing {
            processing_id: 100,
            transform_id: 7,
            status: ProcessingStatus::Running,
            substatus: ProcessingStatus::Running,
            locking: LockState::Locked,
            submitter: None,
            granularity: None,
            granularity_type: None,
            expired_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            next_poll_at: Utc::now(),
            finished_at: None,
            processing_metadata: Some(meta.to_value().unwrap()),
            output_metadata: None,
        };
        let updates = PollUpdates {
            processing_status: Some(ProcessingStatus::Finished),
            updated_contents: vec![
                ContentDelta {
                    content_id: 1,
                    substatus: ContentStatus::Available,
                },
                ContentDelta {
                    content_id: 2,
                    substatus: ContentStatus::Available,
                },
            ],
            rule_state: "OK".to_string(),
        };

        let message = poll_message(&processing, &updates);
        assert_eq!(message.transform_id, 7);
        assert_eq!(message.num_contents, 2);
        assert_eq!(message.msg_content["processing_id"], 100);
        assert_eq!(message.msg_content["status"], "Finished");
        assert_eq!(
            message.msg_content["updated_files"][0]["substatus"],
            "Available"
        );
    }
}
