//! Transform agent: claims due transforms and advances each one a single
//! tick. External calls happen between the claim and the release
//! transactions, never inside them.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::{error, info, instrument, warn};

use stagehand_core::backoff::BackoffPolicy;
use stagehand_core::config::{AgentConfig, DataServiceConfig};
use stagehand_core::dataservice::DataService;
use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{
    LockState, MessageSource, MessageStatus, MessageType, Processing, ProcessingStatus, Transform,
    TransformStatus,
};
use stagehand_core::rucio::RucioClient;
use stagehand_orm::postgres::processings::ProcessingUpdate;
use stagehand_orm::postgres::transforms::TransformUpdate;
use stagehand_orm::postgres::{collections, contents, messages, processings, transforms};
use stagehand_workflow::work::{InputOutputMaps, Work, WorkStatus, build_input_output_maps};

pub struct TransformAgentContext {
    pub pool: Pool<Postgres>,
    pub data_service: DataServiceConfig,
    pub agent: AgentConfig,
    pub backoff: BackoffPolicy,
}

const SUBMITTER: &str = "worker-transforms";

/// One agent tick: claim a batch of due transforms and advance each.
#[instrument(name = "transform_agent_tick", skip_all)]
pub async fn tick(ctx: &TransformAgentContext) -> anyhow::Result<()> {
    // A fresh client per tick; connection reuse is the pool's concern.
    let svc = RucioClient::new(&ctx.data_service)?;

    let claimed = {
        let mut tx = ctx.pool.begin().await?;
        let claimed = transforms::claim_transforms_by_status(
            &mut tx,
            &[
                TransformStatus::New,
                TransformStatus::Transforming,
                TransformStatus::ToCancel,
            ],
            ctx.agent.poll_period.map(|p| p.as_secs() as i64),
            ctx.agent.bulk_size,
        )
        .await?;
        tx.commit().await?;
        claimed
    };

    if claimed.is_empty() {
        return Ok(());
    }
    info!("Claimed {} transforms", claimed.len());

    for transform in &claimed {
        match process_transform(ctx, &svc, transform).await {
            Ok(()) => {}
            Err(OrchestratorError::Validation(msg)) => {
                error!(
                    "Transform {} failed validation: {}",
                    transform.transform_id, msg
                );
                if let Err(e) = fail_transform(ctx, transform, &msg).await {
                    error!(
                        "Could not mark transform {} as failed: {}",
                        transform.transform_id, e
                    );
                }
            }
            Err(e) => {
                error!("Transform {} tick failed: {}", transform.transform_id, e);
                if let Err(release_err) = release_with_backoff(ctx, transform).await {
                    error!(
                        "Could not release transform {}: {}",
                        transform.transform_id, release_err
                    );
                }
            }
        }
    }

    Ok(())
}

#[instrument(skip(ctx, svc, transform), fields(transform_id = transform.transform_id))]
async fn process_transform(
    ctx: &TransformAgentContext,
    svc: &dyn DataService,
    transform: &Transform,
) -> Result<()> {
    let transform_id = transform.transform_id;

    let (collections, mut all_contents, processings) = {
        let mut conn = ctx.pool.acquire().await?;
        let collections =
            collections::get_collections_by_transform_id(&mut conn, transform_id).await?;
        let contents = contents::get_contents_by_transform_id(&mut conn, transform_id).await?;
        let processings =
            processings::get_processings_by_transform_id(&mut conn, transform_id).await?;
        (collections, contents, processings)
    };

    if transform.status == TransformStatus::ToCancel {
        return cancel_transform(ctx, svc, transform, &processings).await;
    }

    let mut work = Work::from_transform(transform, collections.clone(), processings)?;

    // Refresh input collection metadata before looking for new files.
    let refreshes = work.get_input_collections(svc).await?;
    if !refreshes.is_empty() {
        let mut tx = ctx.pool.begin().await?;
        for refresh in &refreshes {
            collections::update_collection(
                &mut tx,
                refresh.coll_id,
                collections::CollectionUpdate {
                    status: refresh.status,
                    coll_metadata: serde_json::to_value(&refresh.meta).ok(),
                },
            )
            .await?;
        }
        tx.commit().await?;
        work.apply_collection_refresh(&refreshes);
    }

    // Map newly discovered files and persist their content rows.
    let maps = build_input_output_maps(&collections, &all_contents);
    let new_maps = work.get_new_input_output_maps(svc, &maps).await?;
    if !new_maps.is_empty() {
        let records: Vec<_> = new_maps
            .values()
            .flat_map(|map| map.inputs.iter().chain(map.outputs.iter()).cloned())
            .collect();
        let mut tx = ctx.pool.begin().await?;
        let inserted = contents::add_contents(&mut tx, &records).await?;
        tx.commit().await?;
        info!(
            "Transform {}: registered {} new contents in {} maps",
            transform_id,
            inserted,
            new_maps.len()
        );

        let mut conn = ctx.pool.acquire().await?;
        all_contents = contents::get_contents_by_transform_id(&mut conn, transform_id).await?;
    }
    let maps = build_input_output_maps(&collections, &all_contents);

    // One active processing at a time; create it lazily once something is
    // mapped.
    if work.active_processing().is_none() && !maps.is_empty() {
        let new_processing = work.create_processing(SUBMITTER)?;
        let processing_id = {
            let mut tx = ctx.pool.begin().await?;
            let processing_id = processings::add_processing(&mut tx, new_processing).await?;
            tx.commit().await?;
            processing_id
        };
        let processing = {
            let mut conn = ctx.pool.acquire().await?;
            processings::get_processing(&mut conn, processing_id).await?
        };
        info!(
            "Transform {}: created processing {}",
            transform_id, processing_id
        );
        work.register_processing(processing);
    }

    // Submit the active processing if its external rule does not exist yet.
    if let Some(active) = work.active_processing() {
        let processing_id = active.processing_id;
        if active.rule_id().is_none() {
            if let Some(updated_meta) = work.submit_processing(svc, active).await? {
                let mut tx = ctx.pool.begin().await?;
                processings::update_processing(
                    &mut tx,
                    processing_id,
                    ProcessingUpdate {
                        status: Some(ProcessingStatus::Submitted),
                        substatus: Some(ProcessingStatus::Submitted),
                        processing_metadata: Some(updated_meta.to_value()?),
                        ..ProcessingUpdate::default()
                    },
                )
                .await?;
                tx.commit().await?;
                info!(
                    "Transform {}: submitted processing {} (rule {:?})",
                    transform_id,
                    processing_id,
                    updated_meta.stage_in().rule_id
                );
            } else {
                warn!(
                    "Transform {}: processing {} not submitted yet",
                    transform_id, processing_id
                );
            }
        }
    }

    // Roll up and release in one transaction, emitting the outbox message
    // together with the status change.
    let work_status = work.syn_work_status(&maps);
    let status_delta = match work_status {
        Some(status) => Some(transform_status_for(status)),
        None if transform.status == TransformStatus::New => Some(TransformStatus::Transforming),
        None => None,
    };

    let mut tx = ctx.pool.begin().await?;
    transforms::update_transform(
        &mut tx,
        transform_id,
        TransformUpdate {
            status: status_delta,
            locking: Some(LockState::Idle),
            retries: Some(0),
            next_poll_at: Some(next_poll_at(&ctx.backoff, 0)),
            transform_metadata: Some(work.transform_metadata_value()?),
            ..TransformUpdate::default()
        },
    )
    .await?;
    if let Some(new_status) = status_delta {
        messages::add_message(&mut tx, rollup_message(transform_id, new_status, &maps)).await?;
    }
    tx.commit().await?;

    if let Some(new_status) = status_delta {
        info!(
            "Transform {}: {:?} -> {:?}",
            transform_id, transform.status, new_status
        );
    }
    Ok(())
}

/// Cooperative cancellation: best-effort rule removal, then mark the
/// processing and the transform cancelled.
#[instrument(skip(ctx, svc, transform, all_processings), fields(transform_id = transform.transform_id))]
async fn cancel_transform(
    ctx: &TransformAgentContext,
    svc: &dyn DataService,
    transform: &Transform,
    all_processings: &[Processing],
) -> Result<()> {
    let active: Vec<&Processing> = all_processings.iter().filter(|p| p.is_active()).collect();

    for processing in &active {
        if let Some(rule_id) = processing.rule_id() {
            if let Err(e) = svc.delete_replication_rule(&rule_id).await {
                warn!(
                    "Transform {}: could not cancel rule {}: {}",
                    transform.transform_id, rule_id, e
                );
            }
        }
    }

    let mut tx = ctx.pool.begin().await?;
    for processing in &active {
        processings::update_processing(
            &mut tx,
            processing.processing_id,
            ProcessingUpdate {
                status: Some(ProcessingStatus::Cancelled),
                substatus: Some(ProcessingStatus::Cancelled),
                locking: Some(LockState::Idle),
                ..ProcessingUpdate::default()
            },
        )
        .await?;
    }
    transforms::update_transform(
        &mut tx,
        transform.transform_id,
        TransformUpdate {
            status: Some(TransformStatus::Cancelled),
            locking: Some(LockState::Idle),
            next_poll_at: Some(next_poll_at(&ctx.backoff, 0)),
            ..TransformUpdate::default()
        },
    )
    .await?;
    messages::add_message(
        &mut tx,
        rollup_message(
            transform.transform_id,
            TransformStatus::Cancelled,
            &InputOutputMaps::new(),
        ),
    )
    .await?;
    tx.commit().await?;

    info!("Transform {} cancelled", transform.transform_id);
    Ok(())
}

/// Terminal failure with a descriptive substatus.
async fn fail_transform(
    ctx: &TransformAgentContext,
    transform: &Transform,
    reason: &str,
) -> Result<()> {
    let substatus: String = reason.chars().take(512).collect();
    let mut tx = ctx.pool.begin().await?;
    transforms::update_transform(
        &mut tx,
        transform.transform_id,
        TransformUpdate {
            status: Some(TransformStatus::Failed),
            substatus: Some(substatus),
            locking: Some(LockState::Idle),
            next_poll_at: Some(next_poll_at(&ctx.backoff, 0)),
            ..TransformUpdate::default()
        },
    )
    .await?;
    messages::add_message(
        &mut tx,
        rollup_message(
            transform.transform_id,
            TransformStatus::Failed,
            &InputOutputMaps::new(),
        ),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Transient failure: no state advance, release the claim with backoff.
async fn release_with_backoff(ctx: &TransformAgentContext, transform: &Transform) -> Result<()> {
    let retries = transform.retries + 1;
    let mut tx = ctx.pool.begin().await?;
    transforms::update_transform(
        &mut tx,
        transform.transform_id,
        TransformUpdate {
            locking: Some(LockState::Idle),
            retries: Some(retries),
            next_poll_at: Some(next_poll_at(&ctx.backoff, retries as u32)),
            ..TransformUpdate::default()
        },
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

fn transform_status_for(status: WorkStatus) -> TransformStatus {
    match status {
        WorkStatus::Finished => TransformStatus::Finished,
        WorkStatus::SubFinished => TransformStatus::SubFinished,
        WorkStatus::Failed => TransformStatus::Failed,
    }
}

fn next_poll_at(backoff: &BackoffPolicy, retries: u32) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(backoff.delay(retries).as_millis() as i64)
}

fn rollup_message(
    transform_id: i64,
    status: TransformStatus,
    maps: &InputOutputMaps,
) -> messages::NewMessage {
    let files: Vec<serde_json::Value> = maps
        .values()
        .flat_map(|map| map.outputs.iter())
        .map(|content| {
            serde_json::json!({
                "scope": content.scope,
                "name": content.name,
                "status": content.status,
            })
        })
        .collect();

    messages::NewMessage {
        msg_type: MessageType::TransformStageIn,
        status: MessageStatus::New,
        source: MessageSource::TransformAgent,
        transform_id,
        num_contents: files.len() as i32,
        bulk_size: None,
        msg_content: serde_json::json!({
            "transform_id": transform_id,
            "status": status,
            "files": files,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_status_maps_onto_transform_status() {
        assert_eq!(
            transform_status_for(WorkStatus::Finished),
            TransformStatus::Finished
        );
        assert_eq!(
            transform_status_for(WorkStatus::SubFinished),
            TransformStatus::SubFinished
        );
        assert_eq!(
            transform_status_for(WorkStatus::Failed),
            TransformStatus::Failed
        );
    }

    #[test]
    fn test_rollup_message_envelope() {
        let message = rollup_message(7, TransformStatus::Finished, &InputOutputMaps::new());
        assert_eq!(message.transform_id, 7);
        assert_eq!(message.num_contents, 0);
        assert_eq!(message.msg_content["transform_id"], 7);
        assert_eq!(message.msg_content["status"], "Finished");
    }

    #[test]
    fn test_next_poll_at_is_in_the_future() {
        let backoff = BackoffPolicy {
            jitter_factor: 0.0,
            ..BackoffPolicy::default()
        };
        let next = next_poll_at(&backoff, 0);
        assert!(next > Utc::now());
    }
}
