//! Stage-in work: replicate the files of an input collection to a
//! destination storage element via a replication rule, tracking each file
//! until it is available at the destination.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use uuid::Uuid;

use stagehand_core::dataservice::{
    DataService, DataServiceError, Did, LOCK_STATE_OK, RULE_STATE_OK, RuleSpec,
};
use stagehand_core::errors::{OrchestratorError, Result};
use stagehand_core::models::{
    Collection, CollectionMeta, CollectionRelationType, CollectionStatus, ContentMeta,
    ContentStatus, ContentType, GranularityType, NewContent, NewProcessing, Processing,
    ProcessingMeta, ProcessingStatus, StageInProcessingMeta, StageInTransformMeta, Transform,
    TransformMeta,
};

use crate::work::{
    CollectionRefresh, ContentDelta, InputOutputMaps, NewInputOutputMaps, NewIoMap, PollUpdates,
    WorkStatus,
};

/// Default bound on how long a stage-in may wait for its rule, in seconds.
pub const DEFAULT_MAX_WAITING_TIME_SECS: i64 = 3600 * 24 * 7;

pub struct StageInWork {
    transform_id: i64,
    meta: StageInTransformMeta,
    collections: Vec<Collection>,
    processings: Vec<Processing>,
    status: Option<WorkStatus>,
}

impl StageInWork {
    /// Rebuild the work from persisted rows. The transform must carry valid
    /// stage-in metadata, one primary input collection and at least one
    /// output collection.
    pub fn from_parts(
        transform: &Transform,
        collections: Vec<Collection>,
        processings: Vec<Processing>,
    ) -> Result<Self> {
        let meta = transform.meta()?.stage_in().clone();

        if !collections
            .iter()
            .any(|c| c.relation_type == CollectionRelationType::Input)
        {
            return Err(OrchestratorError::Validation(format!(
                "transform {} has no input collection",
                transform.transform_id
            )));
        }
        if !collections
            .iter()
            .any(|c| c.relation_type == CollectionRelationType::Output)
        {
            return Err(OrchestratorError::Validation(format!(
                "transform {} has no output collection",
                transform.transform_id
            )));
        }

        Ok(Self {
            transform_id: transform.transform_id,
            meta,
            collections,
            processings,
            status: None,
        })
    }

    pub fn transform_id(&self) -> i64 {
        self.transform_id
    }

    pub fn has_new_inputs(&self) -> bool {
        self.meta.has_new_inputs
    }

    pub fn work_status(&self) -> Option<WorkStatus> {
        self.status
    }

    /// The first input collection is the primary one.
    fn primary_input(&self) -> &Collection {
        self.collections
            .iter()
            .find(|c| c.relation_type == CollectionRelationType::Input)
            .expect("validated at construction")
    }

    fn output_collection(&self) -> &Collection {
        self.collections
            .iter()
            .find(|c| c.relation_type == CollectionRelationType::Output)
            .expect("validated at construction")
    }

    fn input_collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections
            .iter()
            .filter(|c| c.relation_type == CollectionRelationType::Input)
    }

    pub fn active_processing(&self) -> Option<&Processing> {
        self.processings.iter().find(|p| p.is_active())
    }

    pub fn register_processing(&mut self, processing: Processing) {
        self.processings.push(processing);
    }

    pub fn apply_collection_refresh(&mut self, refreshes: &[CollectionRefresh]) {
        for refresh in refreshes {
            if let Some(collection) = self
                .collections
                .iter_mut()
                .find(|c| c.coll_id == refresh.coll_id)
            {
                if let Some(status) = refresh.status {
                    collection.status = status;
                }
                collection.coll_metadata =
                    serde_json::to_value(&refresh.meta).ok();
            }
        }
    }

    pub fn transform_metadata_value(&self) -> Result<serde_json::Value> {
        TransformMeta::V1(self.meta.clone()).to_value()
    }

    /// Refresh the metadata of the input collections from the data service.
    /// Collections already known to be closed are not polled again.
    pub async fn get_input_collections(
        &self,
        svc: &dyn DataService,
    ) -> Result<Vec<CollectionRefresh>> {
        let mut refreshes = Vec::new();
        for collection in self.input_collections() {
            if collection.is_open() == Some(false) {
                continue;
            }

            let did_meta = svc
                .get_metadata(&collection.scope, &collection.name)
                .await
                .map_err(|e| OrchestratorError::DataService(e.to_string()))?;

            let meta = CollectionMeta {
                bytes: did_meta.bytes,
                total_files: did_meta.length,
                availability: did_meta.availability,
                events: did_meta.events,
                is_open: did_meta.is_open,
                run_number: did_meta.run_number,
                did_type: did_meta.did_type,
            };
            let status = match did_meta.is_open {
                Some(false) => Some(CollectionStatus::Closed),
                _ => None,
            };
            refreshes.push(CollectionRefresh {
                coll_id: collection.coll_id,
                status,
                meta,
            });
        }
        Ok(refreshes)
    }

    /// Enumerate the files of the primary input collection.
    pub async fn get_input_contents(&self, svc: &dyn DataService) -> Result<Vec<NewContent>> {
        let primary = self.primary_input();
        let files = svc
            .list_files(&primary.scope, &primary.name)
            .await
            .map_err(|e| OrchestratorError::DataService(e.to_string()))?;

        let contents = files
            .into_iter()
            .map(|file| {
                let meta = ContentMeta {
                    events: file.events,
                    ..ContentMeta::default()
                };
                NewContent {
                    coll_id: primary.coll_id,
                    scope: file.scope,
                    name: file.name,
                    bytes: file.bytes,
                    adler32: file.adler32,
                    min_id: 0,
                    max_id: file.events.unwrap_or(0),
                    content_type: ContentType::File,
                    status: ContentStatus::New,
                    substatus: ContentStatus::New,
                    content_metadata: Some(meta.to_value()),
                }
            })
            .collect();
        Ok(contents)
    }

    /// Inputs that are not yet mapped to outputs, as fresh map entries keyed
    /// from max(existing) + 1. When the primary collection is closed and no
    /// new file shows up, the work stops looking for inputs.
    pub async fn get_new_input_output_maps(
        &mut self,
        svc: &dyn DataService,
        mapped: &InputOutputMaps,
    ) -> Result<NewInputOutputMaps> {
        let inputs = self.get_input_contents(svc).await?;

        let mapped_scope_names: HashSet<String> = mapped
            .values()
            .filter_map(|map| {
                let primary = map
                    .inputs
                    .iter()
                    .find(|c| c.meta().primary == Some(true))
                    .or_else(|| map.inputs.first())?;
                Some(primary.did_key())
            })
            .collect();

        let new_inputs: Vec<NewContent> = inputs
            .into_iter()
            .filter(|ip| !mapped_scope_names.contains(&format!("{}:{}", ip.scope, ip.name)))
            .collect();

        let mut new_maps = NewInputOutputMaps::new();
        if new_inputs.is_empty() {
            // No point re-checking a closed collection.
            if self.primary_input().status == CollectionStatus::Closed {
                self.meta.has_new_inputs = false;
            }
            return Ok(new_maps);
        }

        let output_coll_id = self.output_collection().coll_id;
        let mut next_key = mapped.keys().max().copied().unwrap_or(0) + 1;
        for input in new_inputs {
            let mut meta = input
                .content_metadata
                .as_ref()
                .and_then(|v| serde_json::from_value::<ContentMeta>(v.clone()).ok())
                .unwrap_or_default();
            meta.map_id = Some(next_key);

            let mut input = input;
            input.content_metadata = Some(meta.to_value());

            let mut output = input.clone();
            output.coll_id = output_coll_id;

            new_maps.insert(
                next_key,
                NewIoMap {
                    inputs: vec![input],
                    outputs: vec![output],
                },
            );
            next_key += 1;
        }

        debug!(
            "Transform {}: {} new input/output maps",
            self.transform_id,
            new_maps.len()
        );
        Ok(new_maps)
    }

    /// Build the in-memory processing record for this work. The caller
    /// persists it and registers the stored row back onto the work.
    pub fn create_processing(&self, submitter: &str) -> Result<NewProcessing> {
        let meta = ProcessingMeta::V1(StageInProcessingMeta {
            internal_id: Uuid::new_v4(),
            src_rse: self.meta.src_rse.clone(),
            dest_rse: self.meta.dest_rse.clone(),
            life_time: self.meta.life_time,
            rule_id: None,
        });

        Ok(NewProcessing {
            transform_id: self.transform_id,
            status: ProcessingStatus::New,
            substatus: ProcessingStatus::New,
            submitter: Some(submitter.to_string()),
            granularity: None,
            granularity_type: Some(GranularityType::File),
            expired_at: None,
            processing_metadata: Some(meta.to_value()?),
            output_metadata: None,
        })
    }

    async fn create_rule(&self, svc: &dyn DataService) -> Result<Option<String>> {
        let primary = self.primary_input();
        let spec = RuleSpec {
            dids: vec![Did {
                scope: primary.scope.clone(),
                name: primary.name.clone(),
            }],
            copies: 1,
            rse_expression: self.meta.dest_rse.clone(),
            source_replica_expression: Some(self.meta.src_rse.clone()),
            lifetime: Some(self.meta.life_time),
            locked: false,
            grouping: "DATASET".to_string(),
            ask_approval: false,
        };

        match svc.add_replication_rule(&spec).await {
            Ok(rule_id) => Ok(Some(rule_id)),
            Err(DataServiceError::DuplicateRule(msg)) => {
                warn!(
                    "Transform {}: duplicate rule for {}:{} ({}), adopting the existing one",
                    self.transform_id, primary.scope, primary.name, msg
                );
                let rules = svc
                    .list_did_rules(&primary.scope, &primary.name)
                    .await
                    .map_err(|e| OrchestratorError::DataService(e.to_string()))?;
                Ok(rules
                    .into_iter()
                    .find(|rule| {
                        rule.account == svc.account()
                            && rule.rse_expression == self.meta.dest_rse
                    })
                    .map(|rule| rule.id))
            }
            Err(e) => {
                // Leave the rule unset; the next tick retries.
                warn!(
                    "Transform {}: failed to create replication rule: {}",
                    self.transform_id, e
                );
                Ok(None)
            }
        }
    }

    /// Materialize the external rule for the given processing. Idempotent:
    /// once a rule id is recorded, nothing is submitted again. Returns the
    /// updated metadata when the rule was created or adopted.
    pub async fn submit_processing(
        &self,
        svc: &dyn DataService,
        processing: &Processing,
    ) -> Result<Option<ProcessingMeta>> {
        let mut meta = processing.meta()?;
        if meta.stage_in().rule_id.is_some() {
            return Ok(None);
        }

        match self.create_rule(svc).await? {
            Some(rule_id) => {
                meta.stage_in_mut().rule_id = Some(rule_id);
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Poll the processing's replication rule and translate replica-lock
    /// state into per-content substatus deltas.
    pub async fn poll_processing_updates(
        &self,
        svc: &dyn DataService,
        processing: &Processing,
        maps: &InputOutputMaps,
    ) -> Result<PollUpdates> {
        let meta = processing.meta()?;
        let rule_id = meta.stage_in().rule_id.clone().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "processing {} polled without a rule id",
                processing.processing_id
            ))
        })?;

        let rule = svc
            .get_replication_rule(&rule_id)
            .await
            .map_err(OrchestratorError::from)?;

        let mut replica_status: HashMap<String, ContentStatus> = HashMap::new();
        if rule.locks_ok_cnt > 0 {
            let locks = svc
                .list_replica_locks(&rule_id)
                .await
                .map_err(|e| OrchestratorError::DataService(e.to_string()))?;
            for lock in locks {
                if lock.state == LOCK_STATE_OK {
                    replica_status.insert(
                        format!("{}:{}", lock.scope, lock.name),
                        ContentStatus::Available,
                    );
                }
            }
        }

        let mut updated_contents = Vec::new();
        let mut finished = 0usize;
        let mut unfinished = 0usize;
        for map in maps.values() {
            for content in &map.outputs {
                // Without an entry for this key the substatus is unchanged.
                let substatus = replica_status
                    .get(&content.did_key())
                    .copied()
                    .unwrap_or(content.substatus);
                if substatus != content.substatus {
                    updated_contents.push(ContentDelta {
                        content_id: content.content_id,
                        substatus,
                    });
                }
                if substatus == ContentStatus::Available {
                    finished += 1;
                } else {
                    unfinished += 1;
                }
            }
        }

        let processing_status = if rule.state == RULE_STATE_OK && finished > 0 && unfinished == 0 {
            Some(ProcessingStatus::Finished)
        } else if processing.status == ProcessingStatus::Submitted {
            Some(ProcessingStatus::Running)
        } else {
            None
        };

        Ok(PollUpdates {
            processing_status,
            updated_contents,
            rule_state: rule.state,
        })
    }

    /// Roll the distribution of output content statuses up into a work
    /// status. Undecided while a processing is active, new inputs may still
    /// arrive, or any output has not settled.
    pub fn syn_work_status(&mut self, maps: &InputOutputMaps) -> Option<WorkStatus> {
        if self.active_processing().is_some() || self.meta.has_new_inputs {
            return None;
        }

        let statuses: Vec<ContentStatus> = maps
            .values()
            .flat_map(|map| map.outputs.iter().map(|c| c.status))
            .collect();

        if statuses.iter().any(|s| !s.is_terminal()) {
            return None;
        }

        let status = if statuses.is_empty() {
            // A closed collection with no files produces no outputs.
            WorkStatus::SubFinished
        } else if statuses.iter().all(|s| *s == ContentStatus::Available) {
            WorkStatus::Finished
        } else if statuses.iter().all(|s| *s != ContentStatus::Available) {
            WorkStatus::Failed
        } else {
            WorkStatus::SubFinished
        };

        self.status = Some(status);
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use stagehand_core::dataservice::{
        DidMetadata, FileSummary, ReplicaLock, RuleDetail, RuleSummary,
    };
    use stagehand_core::models::{Content, LockState, Transform, TransformStatus, TransformType};

    enum AddRuleOutcome {
        Created(String),
        Duplicate,
        Unavailable,
    }

    struct FakeDataService {
        account: String,
        metadata: DidMetadata,
        files: Vec<FileSummary>,
        add_rule: AddRuleOutcome,
        did_rules: Vec<RuleSummary>,
        rule: Option<RuleDetail>,
        locks: Vec<ReplicaLock>,
    }

    impl Default for FakeDataService {
        fn default() -> Self {
            Self {
                account: "orchestrator".to_string(),
                metadata: DidMetadata {
                    bytes: Some(300),
                    length: Some(3),
                    availability: Some("available".to_string()),
                    events: Some(30),
                    is_open: Some(true),
                    run_number: None,
                    did_type: Some("DATASET".to_string()),
                },
                files: Vec::new(),
                add_rule: AddRuleOutcome::Created("R".to_string()),
                did_rules: Vec::new(),
                rule: None,
                locks: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl DataService for FakeDataService {
        fn account(&self) -> &str {
            &self.account
        }

        async fn get_metadata(
            &self,
            _scope: &str,
            _name: &str,
        ) -> std::result::Result<DidMetadata, DataServiceError> {
            Ok(self.metadata.clone())
        }

        async fn list_files(
            &self,
            _scope: &str,
            _name: &str,
        ) -> std::result::Result<Vec<FileSummary>, DataServiceError> {
            Ok(self.files.clone())
        }

        async fn add_replication_rule(
            &self,
            _spec: &RuleSpec,
        ) -> std::result::Result<String, DataServiceError> {
            match &self.add_rule {
                AddRuleOutcome::Created(id) => Ok(id.clone()),
                AddRuleOutcome::Duplicate => {
                    Err(DataServiceError::DuplicateRule("rule exists".to_string()))
                }
                AddRuleOutcome::Unavailable => {
                    Err(DataServiceError::Other("service unavailable".to_string()))
                }
            }
        }

        async fn list_did_rules(
            &self,
            _scope: &str,
            _name: &str,
        ) -> std::result::Result<Vec<RuleSummary>, DataServiceError> {
            Ok(self.did_rules.clone())
        }

        async fn get_replication_rule(
            &self,
            rule_id: &str,
        ) -> std::result::Result<RuleDetail, DataServiceError> {
            self.rule
                .clone()
                .ok_or_else(|| DataServiceError::RuleNotFound(rule_id.to_string()))
        }

        async fn list_replica_locks(
            &self,
            _rule_id: &str,
        ) -> std::result::Result<Vec<ReplicaLock>, DataServiceError> {
            Ok(self.locks.clone())
        }

        async fn delete_replication_rule(
            &self,
            _rule_id: &str,
        ) -> std::result::Result<(), DataServiceError> {
            Ok(())
        }
    }

    fn file(name: &str) -> FileSummary {
        FileSummary {
            scope: "u".to_string(),
            name: name.to_string(),
            bytes: 100,
            adler32: Some("0a1b2c3d".to_string()),
            events: Some(10),
        }
    }

    fn lock(name: &str, state: &str) -> ReplicaLock {
        ReplicaLock {
            scope: "u".to_string(),
            name: name.to_string(),
            state: state.to_string(),
        }
    }

    fn transform() -> Transform {
        let meta = TransformMeta::V1(StageInTransformMeta {
            src_rse: "SRC".to_string(),
            dest_rse: "DST".to_string(),
            life_time: DEFAULT_MAX_WAITING_TIME_SECS,
            has_new_inputs: true,
        });
        Transform {
            transform_id: 1,
            transform_type: TransformType::StageIn,
            transform_tag: Some("stagein".to_string()),
            priority: 0,
            status: TransformStatus::Transforming,
            substatus: None,
            locking: LockState::Locked,
            retries: 0,
            expired_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            next_poll_at: Utc::now(),
            finished_at: None,
            transform_metadata: Some(meta.to_value().unwrap()),
        }
    }

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

    fn content(
        content_id: i64,
        coll_id: i64,
        name: &str,
        map_id: i64,
        status: ContentStatus,
    ) -> Content {
        let meta = ContentMeta {
            events: Some(10),
            map_id: Some(map_id),
            primary: None,
        };
        Content {
            content_id,
            coll_id,
            scope: "u".to_string(),
            name: name.to_string(),
            min_id: 0,
            max_id: 10,
            content_type: ContentType::File,
            status,
            substatus: status,
            bytes: 100,
            adler32: Some("0a1b2c3d".to_string()),
            content_metadata: Some(meta.to_value()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn processing(processing_id: i64, status: ProcessingStatus, rule_id: Option<&str>) -> Processing {
        let meta = ProcessingMeta::V1(StageInProcessingMeta {
            internal_id: Uuid::new_v4(),
            src_rse: "SRC".to_string(),
            dest_rse: "DST".to_string(),
            life_time: DEFAULT_MAX_WAITING_TIME_SECS,
            rule_id: rule_id.map(str::to_string),
        });
        Processing {
            processing_id,
            transform_id: 1,
            status,
            substatus: status,
            locking: LockState::Idle,
            submitter: Some("worker-transforms".to_string()),
            granularity: None,
            granularity_type: Some(GranularityType::File),
            expired_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            next_poll_at: Utc::now(),
            finished_at: None,
            processing_metadata: Some(meta.to_value().unwrap()),
            output_metadata: None,
        }
    }

    fn work(processings: Vec<Processing>) -> StageInWork {
        let collections = vec![
            collection(10, CollectionRelationType::Input),
            collection(20, CollectionRelationType::Output),
        ];
        StageInWork::from_parts(&transform(), collections, processings).unwrap()
    }

    /// Maps for three files already staged through the usual flow.
    fn mapped_three(statuses: [ContentStatus; 3]) -> InputOutputMaps {
        let mut maps = InputOutputMaps::new();
        for (i, status) in statuses.into_iter().enumerate() {
            let key = i as i64 + 1;
            let name = format!("f{}", key);
            maps.insert(
                key,
                crate::work::IoMap {
                    inputs: vec![content(key * 2 - 1, 10, &name, key, ContentStatus::New)],
                    outputs: vec![content(key * 2, 20, &name, key, status)],
                },
            );
        }
        maps
    }

    #[test]
    fn test_missing_metadata_is_a_validation_error() {
        let mut bare = transform();
        bare.transform_metadata = None;
        let collections = vec![
            collection(10, CollectionRelationType::Input),
            collection(20, CollectionRelationType::Output),
        ];
        let result = StageInWork::from_parts(&bare, collections, Vec::new());
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn test_output_collection_is_required() {
        let collections = vec![collection(10, CollectionRelationType::Input)];
        let result = StageInWork::from_parts(&transform(), collections, Vec::new());
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_refresh_skips_closed_collections() {
        let svc = FakeDataService::default();
        let mut w = work(Vec::new());
        w.apply_collection_refresh(&[CollectionRefresh {
            coll_id: 10,
            status: Some(CollectionStatus::Closed),
            meta: CollectionMeta {
                is_open: Some(false),
                ..CollectionMeta::default()
            },
        }]);

        let refreshes = w.get_input_collections(&svc).await.unwrap();
        assert!(refreshes.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_closes_collection_when_service_says_so() {
        let svc = FakeDataService {
            metadata: DidMetadata {
                is_open: Some(false),
                length: Some(3),
                ..DidMetadata::default()
            },
            ..FakeDataService::default()
        };
        let w = work(Vec::new());

        let refreshes = w.get_input_collections(&svc).await.unwrap();
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].coll_id, 10);
        assert_eq!(refreshes[0].status, Some(CollectionStatus::Closed));
        assert_eq!(refreshes[0].meta.total_files, Some(3));
    }

    #[tokio::test]
    async fn test_input_contents_come_from_the_primary_collection() {
        let svc = FakeDataService {
            files: vec![file("f1"), file("f2")],
            ..FakeDataService::default()
        };
        let w = work(Vec::new());

        let contents = w.get_input_contents(&svc).await.unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].coll_id, 10);
        assert_eq!(contents[0].min_id, 0);
        assert_eq!(contents[0].max_id, 10);
        assert_eq!(contents[0].content_type, ContentType::File);
        assert_eq!(contents[0].status, ContentStatus::New);
    }

    #[tokio::test]
    async fn test_initial_mapping_assigns_sequential_keys() {
        let svc = FakeDataService {
            files: vec![file("f1"), file("f2"), file("f3")],
            ..FakeDataService::default()
        };
        let mut w = work(Vec::new());

        let new_maps = w
            .get_new_input_output_maps(&svc, &InputOutputMaps::new())
            .await
            .unwrap();

        assert_eq!(
            new_maps.keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let first = &new_maps[&1];
        assert_eq!(first.inputs[0].coll_id, 10);
        assert_eq!(first.outputs[0].coll_id, 20);
        assert_eq!(first.inputs[0].name, first.outputs[0].name);

        let meta: ContentMeta =
            serde_json::from_value(first.outputs[0].content_metadata.clone().unwrap()).unwrap();
        assert_eq!(meta.map_id, Some(1));
        assert!(w.has_new_inputs());
    }

    #[tokio::test]
    async fn test_mapping_is_idempotent_for_unchanged_inputs() {
        let svc = FakeDataService {
            files: vec![file("f1"), file("f2"), file("f3")],
            ..FakeDataService::default()
        };
        let mut w = work(Vec::new());
        let mapped = mapped_three([ContentStatus::New; 3]);

        let new_maps = w.get_new_input_output_maps(&svc, &mapped).await.unwrap();
        assert!(new_maps.is_empty());
        // The collection is still open, more files may show up.
        assert!(w.has_new_inputs());
    }

    #[tokio::test]
    async fn test_incremental_input_appends_the_next_key() {
        let svc = FakeDataService {
            files: vec![file("f1"), file("f2")],
            ..FakeDataService::default()
        };
        let mut w = work(Vec::new());

        let mut mapped = InputOutputMaps::new();
        mapped.insert(
            1,
            crate::work::IoMap {
                inputs: vec![content(1, 10, "f1", 1, ContentStatus::New)],
                outputs: vec![content(2, 20, "f1", 1, ContentStatus::New)],
            },
        );

        let new_maps = w.get_new_input_output_maps(&svc, &mapped).await.unwrap();
        assert_eq!(new_maps.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(new_maps[&2].inputs[0].name, "f2");
    }

    #[tokio::test]
    async fn test_closed_collection_without_new_files_stops_input_polling() {
        let svc = FakeDataService {
            files: vec![file("f1")],
            ..FakeDataService::default()
        };
        let mut w = work(Vec::new());
        w.apply_collection_refresh(&[CollectionRefresh {
            coll_id: 10,
            status: Some(CollectionStatus::Closed),
            meta: CollectionMeta {
                is_open: Some(false),
                ..CollectionMeta::default()
            },
        }]);

        let mut mapped = InputOutputMaps::new();
        mapped.insert(
            1,
            crate::work::IoMap {
                inputs: vec![content(1, 10, "f1", 1, ContentStatus::New)],
                outputs: vec![content(2, 20, "f1", 1, ContentStatus::New)],
            },
        );

        let new_maps = w.get_new_input_output_maps(&svc, &mapped).await.unwrap();
        assert!(new_maps.is_empty());
        assert!(!w.has_new_inputs());
    }

    #[test]
    fn test_create_processing_carries_fresh_metadata() {
        let w = work(Vec::new());
        let new_processing = w.create_processing("worker-transforms").unwrap();

        assert_eq!(new_processing.transform_id, 1);
        assert_eq!(new_processing.status, ProcessingStatus::New);
        assert_eq!(
            new_processing.submitter.as_deref(),
            Some("worker-transforms")
        );

        let meta =
            ProcessingMeta::from_value(&new_processing.processing_metadata.unwrap()).unwrap();
        assert_eq!(meta.stage_in().src_rse, "SRC");
        assert_eq!(meta.stage_in().dest_rse, "DST");
        assert!(meta.stage_in().rule_id.is_none());
    }

    #[tokio::test]
    async fn test_submit_creates_the_rule() {
        let svc = FakeDataService::default();
        let w = work(Vec::new());
        let p = processing(100, ProcessingStatus::New, None);

        let updated = w.submit_processing(&svc, &p).await.unwrap().unwrap();
        assert_eq!(updated.stage_in().rule_id.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_once_a_rule_exists() {
        let svc = FakeDataService::default();
        let w = work(Vec::new());
        let p = processing(100, ProcessingStatus::Submitted, Some("R"));

        assert!(w.submit_processing(&svc, &p).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_adopts_an_existing_rule_on_duplicate() {
        let svc = FakeDataService {
            add_rule: AddRuleOutcome::Duplicate,
            did_rules: vec![
                RuleSummary {
                    id: "R9".to_string(),
                    account: "somebody-else".to_string(),
                    rse_expression: "DST".to_string(),
                },
                RuleSummary {
                    id: "R0".to_string(),
                    account: "orchestrator".to_string(),
                    rse_expression: "DST".to_string(),
                },
            ],
            ..FakeDataService::default()
        };
        let w = work(Vec::new());
        let p = processing(100, ProcessingStatus::New, None);

        let updated = w.submit_processing(&svc, &p).await.unwrap().unwrap();
        assert_eq!(updated.stage_in().rule_id.as_deref(), Some("R0"));
    }

    #[tokio::test]
    async fn test_submit_leaves_rule_unset_on_transient_failure() {
        let svc = FakeDataService {
            add_rule: AddRuleOutcome::Unavailable,
            ..FakeDataService::default()
        };
        let w = work(Vec::new());
        let p = processing(100, ProcessingStatus::New, None);

        assert!(w.submit_processing(&svc, &p).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_without_locks_only_moves_submitted_to_running() {
        let svc = FakeDataService {
            rule: Some(RuleDetail {
                id: "R".to_string(),
                state: "REPLICATING".to_string(),
                locks_ok_cnt: 0,
                locks_replicating_cnt: Some(3),
                locks_stuck_cnt: None,
            }),
            ..FakeDataService::default()
        };
        let p = processing(100, ProcessingStatus::Submitted, Some("R"));
        let w = work(vec![p.clone()]);
        let maps = mapped_three([ContentStatus::New; 3]);

        let updates = w.poll_processing_updates(&svc, &p, &maps).await.unwrap();
        assert!(updates.updated_contents.is_empty());
        assert_eq!(updates.processing_status, Some(ProcessingStatus::Running));
        assert_eq!(updates.rule_state, "REPLICATING");
    }

    #[tokio::test]
    async fn test_poll_with_all_locks_ok_finishes_the_processing() {
        let svc = FakeDataService {
            rule: Some(RuleDetail {
                id: "R".to_string(),
                state: "OK".to_string(),
                locks_ok_cnt: 3,
                locks_replicating_cnt: Some(0),
                locks_stuck_cnt: Some(0),
            }),
            locks: vec![lock("f1", "OK"), lock("f2", "OK"), lock("f3", "OK")],
            ..FakeDataService::default()
        };
        let p = processing(100, ProcessingStatus::Running, Some("R"));
        let w = work(vec![p.clone()]);
        let maps = mapped_three([ContentStatus::New; 3]);

        let updates = w.poll_processing_updates(&svc, &p, &maps).await.unwrap();
        assert_eq!(updates.updated_contents.len(), 3);
        assert!(
            updates
                .updated_contents
                .iter()
                .all(|d| d.substatus == ContentStatus::Available)
        );
        assert_eq!(updates.processing_status, Some(ProcessingStatus::Finished));
    }

    #[tokio::test]
    async fn test_poll_with_a_straggler_keeps_the_processing_running() {
        let svc = FakeDataService {
            rule: Some(RuleDetail {
                id: "R".to_string(),
                state: "OK".to_string(),
                locks_ok_cnt: 2,
                locks_replicating_cnt: Some(1),
                locks_stuck_cnt: None,
            }),
            locks: vec![
                lock("f1", "OK"),
                lock("f2", "REPLICATING"),
                lock("f3", "OK"),
            ],
            ..FakeDataService::default()
        };
        let p = processing(100, ProcessingStatus::Running, Some("R"));
        let w = work(vec![p.clone()]);
        let maps = mapped_three([ContentStatus::New; 3]);

        let updates = w.poll_processing_updates(&svc, &p, &maps).await.unwrap();
        assert_eq!(updates.updated_contents.len(), 2);
        assert!(updates.processing_status.is_none());
    }

    #[tokio::test]
    async fn test_poll_reports_a_vanished_rule() {
        let svc = FakeDataService::default();
        let p = processing(100, ProcessingStatus::Running, Some("R"));
        let w = work(vec![p.clone()]);
        let maps = mapped_three([ContentStatus::New; 3]);

        let result = w.poll_processing_updates(&svc, &p, &maps).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn test_rollup_waits_for_active_processings() {
        let mut t = transform();
        let meta = TransformMeta::V1(StageInTransformMeta {
            src_rse: "SRC".to_string(),
            dest_rse: "DST".to_string(),
            life_time: DEFAULT_MAX_WAITING_TIME_SECS,
            has_new_inputs: false,
        });
        t.transform_metadata = Some(meta.to_value().unwrap());
        let collections = vec![
            collection(10, CollectionRelationType::Input),
            collection(20, CollectionRelationType::Output),
        ];
        let mut w = StageInWork::from_parts(
            &t,
            collections,
            vec![processing(100, ProcessingStatus::Running, Some("R"))],
        )
        .unwrap();

        let maps = mapped_three([ContentStatus::Available; 3]);
        assert!(w.syn_work_status(&maps).is_none());
    }

    #[test]
    fn test_rollup_waits_for_pending_inputs() {
        let mut w = work(Vec::new());
        let maps = mapped_three([ContentStatus::Available; 3]);
        // has_new_inputs is still true on a fresh work.
        assert!(w.syn_work_status(&maps).is_none());
    }

    #[test]
    fn test_rollup_waits_for_unsettled_contents() {
        let mut w = settled_without_new_inputs();
        let maps = mapped_three([
            ContentStatus::Available,
            ContentStatus::Processing,
            ContentStatus::Available,
        ]);
        assert!(w.syn_work_status(&maps).is_none());
    }

    #[test]
    fn test_rollup_finishes_when_everything_is_available() {
        let mut w = settled_without_new_inputs();
        let maps = mapped_three([ContentStatus::Available; 3]);
        assert_eq!(w.syn_work_status(&maps), Some(WorkStatus::Finished));
        assert_eq!(w.work_status(), Some(WorkStatus::Finished));
    }

    #[test]
    fn test_rollup_subfinishes_on_a_mixed_outcome() {
        let mut w = settled_without_new_inputs();
        let maps = mapped_three([
            ContentStatus::Available,
            ContentStatus::Failed,
            ContentStatus::Available,
        ]);
        assert_eq!(w.syn_work_status(&maps), Some(WorkStatus::SubFinished));
    }

    #[test]
    fn test_rollup_fails_when_nothing_became_available() {
        let mut w = settled_without_new_inputs();
        let maps = mapped_three([
            ContentStatus::Failed,
            ContentStatus::Lost,
            ContentStatus::Failed,
        ]);
        assert_eq!(w.syn_work_status(&maps), Some(WorkStatus::Failed));
    }

    /// A work whose processing finished and whose input polling stopped.
    fn settled_without_new_inputs() -> StageInWork {
        let mut t = transform();
        let meta = TransformMeta::V1(StageInTransformMeta {
            src_rse: "SRC".to_string(),
            dest_rse: "DST".to_string(),
            life_time: DEFAULT_MAX_WAITING_TIME_SECS,
            has_new_inputs: false,
        });
        t.transform_metadata = Some(meta.to_value().unwrap());
        let collections = vec![
            collection(10, CollectionRelationType::Input),
            collection(20, CollectionRelationType::Output),
        ];
        StageInWork::from_parts(
            &t,
            collections,
            vec![processing(100, ProcessingStatus::Finished, Some("R"))],
        )
        .unwrap()
    }
}
