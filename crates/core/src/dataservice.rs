//! Abstract capability set of the external content-replication service.
//!
//! Any backend that can enumerate collection files, manage replication rules
//! and report replica-lock state satisfies this trait. The bundled HTTP
//! client lives in [`crate::rucio`]; tests substitute an in-memory double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataServiceError {
    /// An equivalent rule already exists for the DID; resolve by lookup.
    #[error("duplicate replication rule: {0}")]
    DuplicateRule(String),

    #[error("replication rule not found: {0}")]
    RuleNotFound(String),

    #[error("cannot authenticate: {0}")]
    CannotAuthenticate(String),

    #[error("data service request failed: {0}")]
    Other(String),
}

/// Rule state reported by the service once all replica locks are in place.
pub const RULE_STATE_OK: &str = "OK";

/// Replica-lock state for a fully staged file.
pub const LOCK_STATE_OK: &str = "OK";

/// Data identifier `(scope, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Did {
    pub scope: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DidMetadata {
    pub bytes: Option<i64>,
    pub length: Option<i64>,
    pub availability: Option<String>,
    pub events: Option<i64>,
    pub is_open: Option<bool>,
    pub run_number: Option<i64>,
    pub did_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub adler32: Option<String>,
    #[serde(default)]
    pub events: Option<i64>,
}

/// Parameters for a new replication rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub dids: Vec<Did>,
    pub copies: i32,
    pub rse_expression: String,
    pub source_replica_expression: Option<String>,
    pub lifetime: Option<i64>,
    pub locked: bool,
    pub grouping: String,
    pub ask_approval: bool,
}

/// One rule as listed for a DID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSummary {
    pub id: String,
    pub account: String,
    pub rse_expression: String,
}

/// Full rule state as fetched by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDetail {
    pub id: String,
    pub state: String,
    pub locks_ok_cnt: i64,
    #[serde(default)]
    pub locks_replicating_cnt: Option<i64>,
    #[serde(default)]
    pub locks_stuck_cnt: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaLock {
    pub scope: String,
    pub name: String,
    pub state: String,
}

#[async_trait]
pub trait DataService: Send + Sync {
    /// The effective principal this client acts as.
    fn account(&self) -> &str;

    async fn get_metadata(&self, scope: &str, name: &str)
    -> Result<DidMetadata, DataServiceError>;

    async fn list_files(&self, scope: &str, name: &str)
    -> Result<Vec<FileSummary>, DataServiceError>;

    /// Creates a rule and returns its id. Fails with [`DataServiceError::DuplicateRule`]
    /// when an equivalent rule already exists.
    async fn add_replication_rule(&self, spec: &RuleSpec) -> Result<String, DataServiceError>;

    async fn list_did_rules(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<Vec<RuleSummary>, DataServiceError>;

    async fn get_replication_rule(&self, rule_id: &str) -> Result<RuleDetail, DataServiceError>;

    async fn list_replica_locks(
        &self,
        rule_id: &str,
    ) -> Result<Vec<ReplicaLock>, DataServiceError>;

    /// Best-effort removal of a rule, used by cooperative cancellation.
    async fn delete_replication_rule(&self, rule_id: &str) -> Result<(), DataServiceError>;
}
