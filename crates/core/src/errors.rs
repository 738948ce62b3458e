//! Shared error taxonomy for repositories, works and agents.
//!
//! Repository functions surface these typed errors; agents catch them at the
//! tick boundary, log, release the row lock and continue with the rest of
//! the batch.

use thiserror::Error;

use crate::dataservice::DataServiceError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// An insert hit a uniqueness constraint. This is a logic bug in the
    /// caller (double submission) and should reach the supervisor.
    #[error("object already exists: {0}")]
    DuplicatedObject(String),

    /// A required single-row lookup found nothing. Callers may treat this as
    /// transient when the row is expected to appear later.
    #[error("object not found: {0}")]
    NoObject(String),

    #[error("database error: {0}")]
    Database(String),

    /// Transient or permanent failure talking to the replication service.
    #[error("data service error: {0}")]
    DataService(String),

    /// The external processing (replication rule) no longer exists.
    #[error("external processing not found: {0}")]
    ProcessNotFound(String),

    /// Malformed or missing metadata on a durable row.
    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => OrchestratorError::NoObject(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                OrchestratorError::DuplicatedObject(err.to_string())
            }
            _ => OrchestratorError::Database(err.to_string()),
        }
    }
}

impl From<DataServiceError> for OrchestratorError {
    fn from(err: DataServiceError) -> Self {
        match err {
            DataServiceError::RuleNotFound(msg) => OrchestratorError::ProcessNotFound(msg),
            other => OrchestratorError::DataService(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_no_object() {
        let err: OrchestratorError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, OrchestratorError::NoObject(_)));
    }

    #[test]
    fn test_rule_not_found_maps_to_process_not_found() {
        let err: OrchestratorError =
            DataServiceError::RuleNotFound("rule R1".to_string()).into();
        assert!(matches!(err, OrchestratorError::ProcessNotFound(_)));
    }

    #[test]
    fn test_duplicate_rule_maps_to_data_service() {
        let err: OrchestratorError =
            DataServiceError::DuplicateRule("already there".to_string()).into();
        assert!(matches!(err, OrchestratorError::DataService(_)));
    }
}
