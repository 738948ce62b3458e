//! Durable data model: row types, status enumerations and the typed views
//! over the JSON metadata columns.
//!
//! Numeric status codes are stored as SMALLINT and must stay stable across
//! deploys; the discriminant values below are part of the persisted surface,
//! as are the column names (`locking`, `next_poll_at`, `updated_at`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum TransformType {
    StageIn = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum TransformStatus {
    New = 1,
    Transforming = 2,
    Finished = 3,
    SubFinished = 4,
    Failed = 5,
    Lost = 6,
    Cancelled = 7,
    ToCancel = 8,
    Suspended = 9,
}

impl TransformStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransformStatus::Finished
                | TransformStatus::SubFinished
                | TransformStatus::Failed
                | TransformStatus::Lost
                | TransformStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum ProcessingStatus {
    New = 1,
    Submitting = 2,
    Submitted = 3,
    Running = 4,
    Finished = 5,
    Failed = 6,
    Lost = 7,
    Cancelled = 8,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Finished
                | ProcessingStatus::Failed
                | ProcessingStatus::Lost
                | ProcessingStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum ContentStatus {
    New = 1,
    Processing = 2,
    Available = 3,
    Failed = 4,
    Lost = 5,
    Mapped = 6,
}

impl ContentStatus {
    /// Terminal content states never regress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContentStatus::Available | ContentStatus::Failed | ContentStatus::Lost
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum ContentType {
    File = 1,
    Event = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum CollectionStatus {
    Open = 1,
    Closed = 2,
    SubClosed = 3,
    Failed = 4,
    Deleted = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum CollectionRelationType {
    Input = 1,
    Output = 2,
    Log = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum GranularityType {
    File = 1,
    Event = 2,
}

/// Cooperative row lock. A `Locked` row is owned by exactly one agent until
/// it releases it or the stale-lock reaper expires the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum LockState {
    Idle = 0,
    Locked = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum RequestStatus {
    New = 1,
    Transforming = 2,
    Finished = 3,
    SubFinished = 4,
    Failed = 5,
    Cancelled = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum MessageType {
    FileStageIn = 1,
    CollectionStageIn = 2,
    TransformStageIn = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum MessageStatus {
    New = 1,
    Delivered = 2,
    Failed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum MessageSource {
    TransformAgent = 1,
    ProcessingAgent = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Request {
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub requester: Option<String>,
    pub priority: i32,
    pub status: RequestStatus,
    pub request_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transform {
    pub transform_id: i64,
    pub transform_type: TransformType,
    pub transform_tag: Option<String>,
    pub priority: i32,
    pub status: TransformStatus,
    pub substatus: Option<String>,
    pub locking: LockState,
    pub retries: i32,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transform_metadata: Option<serde_json::Value>,
}

impl Transform {
    /// Typed view over `transform_metadata`; a missing or malformed blob is
    /// a validation failure for the transform.
    pub fn meta(&self) -> Result<TransformMeta> {
        let value = self.transform_metadata.as_ref().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "transform {} has no metadata",
                self.transform_id
            ))
        })?;
        TransformMeta::from_value(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Collection {
    pub coll_id: i64,
    pub transform_id: i64,
    pub relation_type: CollectionRelationType,
    pub scope: String,
    pub name: String,
    pub status: CollectionStatus,
    pub coll_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn meta(&self) -> CollectionMeta {
        self.coll_metadata
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// `None` when the collection has never been polled.
    pub fn is_open(&self) -> Option<bool> {
        self.meta().is_open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Content {
    pub content_id: i64,
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    pub min_id: i64,
    pub max_id: i64,
    pub content_type: ContentType,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub bytes: i64,
    pub adler32: Option<String>,
    pub content_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Content {
    pub fn meta(&self) -> ContentMeta {
        self.content_metadata
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// The DID key, `scope:name`.
    pub fn did_key(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Processing {
    pub processing_id: i64,
    pub transform_id: i64,
    pub status: ProcessingStatus,
    pub substatus: ProcessingStatus,
    pub locking: LockState,
    pub submitter: Option<String>,
    pub granularity: Option<i64>,
    pub granularity_type: Option<GranularityType>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processing_metadata: Option<serde_json::Value>,
    pub output_metadata: Option<serde_json::Value>,
}

impl Processing {
    pub fn meta(&self) -> Result<ProcessingMeta> {
        let value = self.processing_metadata.as_ref().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "processing {} has no metadata",
                self.processing_id
            ))
        })?;
        ProcessingMeta::from_value(value)
    }

    /// The external rule id, once the processing has been submitted.
    pub fn rule_id(&self) -> Option<String> {
        self.meta().ok().and_then(|m| m.stage_in().rule_id.clone())
    }

    /// A processing is active while it may still change the transform's
    /// outputs; terminal processings are history.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub msg_id: i64,
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub source: MessageSource,
    pub transform_id: i64,
    pub num_contents: i32,
    pub bulk_size: Option<i32>,
    pub msg_content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Req2Transform {
    pub request_id: i64,
    pub transform_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workprogress2Transform {
    pub workprogress_id: i64,
    pub transform_id: i64,
}

/// A content record produced by input enumeration, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContent {
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub adler32: Option<String>,
    pub min_id: i64,
    pub max_id: i64,
    pub content_type: ContentType,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub content_metadata: Option<serde_json::Value>,
}

/// A processing record produced by a work, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProcessing {
    pub transform_id: i64,
    pub status: ProcessingStatus,
    pub substatus: ProcessingStatus,
    pub submitter: Option<String>,
    pub granularity: Option<i64>,
    pub granularity_type: Option<GranularityType>,
    pub expired_at: Option<DateTime<Utc>>,
    pub processing_metadata: Option<serde_json::Value>,
    pub output_metadata: Option<serde_json::Value>,
}

/// Versioned wrapper over `transform_metadata`. The tag rides along with the
/// payload keys so existing readers of the flat micro-schema keep working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum TransformMeta {
    #[serde(rename = "1")]
    V1(StageInTransformMeta),
}

impl TransformMeta {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn stage_in(&self) -> &StageInTransformMeta {
        match self {
            TransformMeta::V1(meta) => meta,
        }
    }

    pub fn stage_in_mut(&mut self) -> &mut StageInTransformMeta {
        match self {
            TransformMeta::V1(meta) => meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInTransformMeta {
    pub src_rse: String,
    pub dest_rse: String,
    /// Rule lifetime in seconds, bounded by the work's max waiting time.
    pub life_time: i64,
    #[serde(default = "default_true")]
    pub has_new_inputs: bool,
}

/// Versioned wrapper over `processing_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum ProcessingMeta {
    #[serde(rename = "1")]
    V1(StageInProcessingMeta),
}

impl ProcessingMeta {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn stage_in(&self) -> &StageInProcessingMeta {
        match self {
            ProcessingMeta::V1(meta) => meta,
        }
    }

    pub fn stage_in_mut(&mut self) -> &mut StageInProcessingMeta {
        match self {
            ProcessingMeta::V1(meta) => meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInProcessingMeta {
    pub internal_id: Uuid,
    pub src_rse: String,
    pub dest_rse: String,
    pub life_time: i64,
    #[serde(default)]
    pub rule_id: Option<String>,
}

/// Snapshot of DID metadata cached on an input collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_open: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did_type: Option<String>,
}

/// Per-content metadata. `map_id` ties a content to its input/output map;
/// `primary` marks the primary input of a map with several inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
}

impl ContentMeta {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(TransformStatus::New as i16, 1);
        assert_eq!(TransformStatus::Transforming as i16, 2);
        assert_eq!(TransformStatus::ToCancel as i16, 8);
        assert_eq!(ProcessingStatus::Finished as i16, 5);
        assert_eq!(ProcessingStatus::Lost as i16, 7);
        assert_eq!(ContentStatus::Available as i16, 3);
        assert_eq!(LockState::Idle as i16, 0);
        assert_eq!(LockState::Locked as i16, 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransformStatus::SubFinished.is_terminal());
        assert!(!TransformStatus::Transforming.is_terminal());
        assert!(!TransformStatus::ToCancel.is_terminal());
        assert!(ContentStatus::Lost.is_terminal());
        assert!(!ContentStatus::Mapped.is_terminal());
        assert!(ProcessingStatus::Cancelled.is_terminal());
        assert!(!ProcessingStatus::Submitted.is_terminal());
    }

    #[test]
    fn test_processing_meta_keeps_flat_keys() {
        let meta = ProcessingMeta::V1(StageInProcessingMeta {
            internal_id: Uuid::new_v4(),
            src_rse: "SRC".to_string(),
            dest_rse: "DST".to_string(),
            life_time: 604800,
            rule_id: Some("R1".to_string()),
        });
        let value = meta.to_value().unwrap();
        assert_eq!(value["version"], "1");
        assert!(value.get("internal_id").is_some());
        assert_eq!(value["src_rse"], "SRC");
        assert_eq!(value["dest_rse"], "DST");
        assert_eq!(value["life_time"], 604800);
        assert_eq!(value["rule_id"], "R1");

        let parsed = ProcessingMeta::from_value(&value).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_transform_meta_defaults_has_new_inputs() {
        let value = serde_json::json!({
            "version": "1",
            "src_rse": "SRC",
            "dest_rse": "DST",
            "life_time": 3600,
        });
        let meta = TransformMeta::from_value(&value).unwrap();
        assert!(meta.stage_in().has_new_inputs);
    }

    #[test]
    fn test_content_meta_tolerates_unknown_blob() {
        let content = Content {
            content_id: 1,
            coll_id: 1,
            scope: "u".to_string(),
            name: "f1".to_string(),
            min_id: 0,
            max_id: 10,
            content_type: ContentType::File,
            status: ContentStatus::New,
            substatus: ContentStatus::New,
            bytes: 42,
            adler32: None,
            content_metadata: Some(serde_json::json!("not an object")),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(content.meta(), ContentMeta::default());
        assert_eq!(content.did_key(), "u:f1");
    }
}
