//! The work abstraction: one variant per transform kind.
//!
//! A work is transient, rebuilt each tick from the persisted transform and
//! its collections and processings. Its operations are pure functions of
//! (persisted state, external data service); they return deltas and never
//! touch the database themselves.

use std::collections::BTreeMap;

use stagehand_core::dataservice::DataService;
use stagehand_core::errors::Result;
use stagehand_core::models::{
    Collection, CollectionMeta, CollectionRelationType, CollectionStatus, Content, ContentStatus,
    NewContent, NewProcessing, Processing, ProcessingMeta, ProcessingStatus, Transform,
    TransformType,
};

use crate::stagein::StageInWork;

/// Rollup status of a work once its outputs have settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Finished,
    SubFinished,
    Failed,
}

/// Refreshed metadata for one input collection.
#[derive(Debug, Clone)]
pub struct CollectionRefresh {
    pub coll_id: i64,
    pub status: Option<CollectionStatus>,
    pub meta: CollectionMeta,
}

/// One registered input/output map: persisted contents keyed by map id.
#[derive(Debug, Clone, Default)]
pub struct IoMap {
    pub inputs: Vec<Content>,
    pub outputs: Vec<Content>,
}

pub type InputOutputMaps = BTreeMap<i64, IoMap>;

/// A not-yet-persisted map entry for freshly discovered inputs.
#[derive(Debug, Clone)]
pub struct NewIoMap {
    pub inputs: Vec<NewContent>,
    pub outputs: Vec<NewContent>,
}

pub type NewInputOutputMaps = BTreeMap<i64, NewIoMap>;

/// Per-content substatus delta from a processing poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDelta {
    pub content_id: i64,
    pub substatus: ContentStatus,
}

/// Everything one poll of an external processing produced.
#[derive(Debug, Clone)]
pub struct PollUpdates {
    pub processing_status: Option<ProcessingStatus>,
    pub updated_contents: Vec<ContentDelta>,
    pub rule_state: String,
}

/// Reconstruct the registered input/output maps from persisted rows.
///
/// Contents carry their map id in `content_metadata`; which side of the map
/// a content sits on follows from its collection's relation type. Contents
/// not yet assigned to a map are skipped.
pub fn build_input_output_maps(
    collections: &[Collection],
    contents: &[Content],
) -> InputOutputMaps {
    let mut maps = InputOutputMaps::new();
    for content in contents {
        let Some(map_id) = content.meta().map_id else {
            continue;
        };
        let Some(collection) = collections.iter().find(|c| c.coll_id == content.coll_id) else {
            continue;
        };
        let entry = maps.entry(map_id).or_default();
        match collection.relation_type {
            CollectionRelationType::Input => entry.inputs.push(content.clone()),
            CollectionRelationType::Output => entry.outputs.push(content.clone()),
            CollectionRelationType::Log => {}
        }
    }
    maps
}

/// Closed set of work variants.
pub enum Work {
    StageIn(StageInWork),
}

impl Work {
    /// Rebuild the work for a persisted transform.
    pub fn from_transform(
        transform: &Transform,
        collections: Vec<Collection>,
        processings: Vec<Processing>,
    ) -> Result<Self> {
        match transform.transform_type {
            TransformType::StageIn => Ok(Work::StageIn(StageInWork::from_parts(
                transform,
                collections,
                processings,
            )?)),
        }
    }

    pub fn transform_id(&self) -> i64 {
        match self {
            Work::StageIn(work) => work.transform_id(),
        }
    }

    pub fn has_new_inputs(&self) -> bool {
        match self {
            Work::StageIn(work) => work.has_new_inputs(),
        }
    }

    pub fn active_processing(&self) -> Option<&Processing> {
        match self {
            Work::StageIn(work) => work.active_processing(),
        }
    }

    /// Fold refreshed collection metadata back into the work's view.
    pub fn apply_collection_refresh(&mut self, refreshes: &[CollectionRefresh]) {
        match self {
            Work::StageIn(work) => work.apply_collection_refresh(refreshes),
        }
    }

    /// Make a processing persisted by the caller visible to the work.
    pub fn register_processing(&mut self, processing: Processing) {
        match self {
            Work::StageIn(work) => work.register_processing(processing),
        }
    }

    /// The work's current metadata blob, for persisting back to the
    /// transform row.
    pub fn transform_metadata_value(&self) -> Result<serde_json::Value> {
        match self {
            Work::StageIn(work) => work.transform_metadata_value(),
        }
    }

    pub async fn get_input_collections(
        &self,
        svc: &dyn DataService,
    ) -> Result<Vec<CollectionRefresh>> {
        match self {
            Work::StageIn(work) => work.get_input_collections(svc).await,
        }
    }

    pub async fn get_input_contents(&self, svc: &dyn DataService) -> Result<Vec<NewContent>> {
        match self {
            Work::StageIn(work) => work.get_input_contents(svc).await,
        }
    }

    pub async fn get_new_input_output_maps(
        &mut self,
        svc: &dyn DataService,
        mapped: &InputOutputMaps,
    ) -> Result<NewInputOutputMaps> {
        match self {
            Work::StageIn(work) => work.get_new_input_output_maps(svc, mapped).await,
        }
    }

    pub fn create_processing(&self, submitter: &str) -> Result<NewProcessing> {
        match self {
            Work::StageIn(work) => work.create_processing(submitter),
        }
    }

    pub async fn submit_processing(
        &self,
        svc: &dyn DataService,
        processing: &Processing,
    ) -> Result<Option<ProcessingMeta>> {
        match self {
            Work::StageIn(work) => work.submit_processing(svc, processing).await,
        }
    }

    pub async fn poll_processing_updates(
        &self,
        svc: &dyn DataService,
        processing: &Processing,
        maps: &InputOutputMaps,
    ) -> Result<PollUpdates> {
        match self {
            Work::StageIn(work) => work.poll_processing_updates(svc, processing, maps).await,
        }
    }

    pub fn syn_work_status(&mut self, maps: &InputOutputMaps) -> Option<WorkStatus> {
        match self {
            Work::StageIn(work) => work.syn_work_status(maps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stagehand_core::models::{ContentMeta, ContentType};

    fn collection(coll_id: i64, relation_type: CollectionRelationType) -> Collection {
        Collection {
            coll_id,
            transform_id: 1,
            relation_type,
            scope: "u".to_string(),
            name: "ds1".to_string(),
            status: CollectionStatus::Open,
            coll_metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn content(content_id: i64, coll_id: i64, name: &str, map_id: Option<i64>) -> Content {
        let meta = ContentMeta {
            map_id,
            ..ContentMeta::default()
        };
        Content {
            content_id,
            coll_id,
            scope: "u".to_string(),
            name: name.to_string(),
            min_id: 0,
            max_id: 0,
            content_type: ContentType::File,
            status: ContentStatus::New,
            substatus: ContentStatus::New,
            bytes: 1,
            adler32: None,
            content_metadata: Some(meta.to_value()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_maps_pairs_inputs_with_outputs() {
        let collections = vec![
            collection(10, CollectionRelationType::Input),
            collection(20, CollectionRelationType::Output),
        ];
        let contents = vec![
            content(1, 10, "f1", Some(1)),
            content(2, 20, "f1", Some(1)),
            content(3, 10, "f2", Some(2)),
            content(4, 20, "f2", Some(2)),
        ];

        let maps = build_input_output_maps(&collections, &contents);
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[&1].inputs.len(), 1);
        assert_eq!(maps[&1].outputs.len(), 1);
        assert_eq!(maps[&1].inputs[0].content_id, 1);
        assert_eq!(maps[&1].outputs[0].content_id, 2);
        assert_eq!(maps[&2].inputs[0].name, "f2");
    }

    #[test]
    fn test_build_maps_skips_unmapped_contents() {
        let collections = vec![collection(10, CollectionRelationType::Input)];
        let contents = vec![content(1, 10, "f1", None)];
        let maps = build_input_output_maps(&collections, &contents);
        assert!(maps.is_empty());
    }
}
