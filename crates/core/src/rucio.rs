//! HTTP client for a Rucio-compatible replication service.
//!
//! Streaming endpoints return newline-delimited JSON; each non-empty line is
//! one record.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::config::DataServiceConfig;
use crate::dataservice::{
    DataService, DataServiceError, DidMetadata, FileSummary, ReplicaLock, RuleDetail, RuleSpec,
    RuleSummary,
};

const ACCOUNT_HEADER: &str = "X-Rucio-Account";
const AUTH_TOKEN_HEADER: &str = "X-Rucio-Auth-Token";

pub struct RucioClient {
    http: reqwest::Client,
    base_url: String,
    account: String,
    auth_token: Option<String>,
}

impl RucioClient {
    pub fn new(config: &DataServiceConfig) -> Result<Self, DataServiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DataServiceError::Other(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account: config.account.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, url)
            .header(ACCOUNT_HEADER, &self.account);
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTH_TOKEN_HEADER, token);
        }
        builder
    }

    async fn check(
        &self,
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, DataServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: {} {}", context, status, body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(DataServiceError::CannotAuthenticate(message))
            }
            StatusCode::CONFLICT => Err(DataServiceError::DuplicateRule(message)),
            StatusCode::NOT_FOUND => Err(DataServiceError::RuleNotFound(message)),
            _ => Err(DataServiceError::Other(message)),
        }
    }
}

impl From<reqwest::Error> for DataServiceError {
    fn from(err: reqwest::Error) -> Self {
        DataServiceError::Other(err.to_string())
    }
}

/// Parse a newline-delimited JSON body.
fn parse_ndjson<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, DataServiceError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<T>(line).map_err(|e| {
                DataServiceError::Other(format!("malformed stream record: {}: {}", e, line))
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl DataService for RucioClient {
    fn account(&self) -> &str {
        &self.account
    }

    async fn get_metadata(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<DidMetadata, DataServiceError> {
        let path = format!("/dids/{}/{}/meta", scope, name);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = self.check(response, "get_metadata").await?;
        Ok(response.json::<DidMetadata>().await?)
    }

    async fn list_files(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<Vec<FileSummary>, DataServiceError> {
        let path = format!("/dids/{}/{}/files", scope, name);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = self.check(response, "list_files").await?;
        let body = response.text().await?;
        let files = parse_ndjson::<FileSummary>(&body)?;
        debug!("Listed {} files for {}:{}", files.len(), scope, name);
        Ok(files)
    }

    async fn add_replication_rule(&self, spec: &RuleSpec) -> Result<String, DataServiceError> {
        let response = self
            .request(reqwest::Method::POST, "/rules/")
            .json(spec)
            .send()
            .await?;
        let response = self.check(response, "add_replication_rule").await?;

        // The service answers with a list of rule ids, one per copy set.
        let body = response.text().await?;
        if let Ok(ids) = serde_json::from_str::<Vec<String>>(&body) {
            return ids
                .into_iter()
                .next()
                .ok_or_else(|| DataServiceError::Other("empty rule id list".to_string()));
        }
        serde_json::from_str::<String>(&body)
            .map_err(|e| DataServiceError::Other(format!("malformed rule id response: {}", e)))
    }

    async fn list_did_rules(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<Vec<RuleSummary>, DataServiceError> {
        let path = format!("/dids/{}/{}/rules", scope, name);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = self.check(response, "list_did_rules").await?;
        let body = response.text().await?;
        parse_ndjson::<RuleSummary>(&body)
    }

    async fn get_replication_rule(&self, rule_id: &str) -> Result<RuleDetail, DataServiceError> {
        let path = format!("/rules/{}", rule_id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = self.check(response, "get_replication_rule").await?;
        Ok(response.json::<RuleDetail>().await?)
    }

    async fn list_replica_locks(
        &self,
        rule_id: &str,
    ) -> Result<Vec<ReplicaLock>, DataServiceError> {
        let path = format!("/rules/{}/locks", rule_id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = self.check(response, "list_replica_locks").await?;
        let body = response.text().await?;
        parse_ndjson::<ReplicaLock>(&body)
    }

    async fn delete_replication_rule(&self, rule_id: &str) -> Result<(), DataServiceError> {
        let path = format!("/rules/{}", rule_id);
        let response = self.request(reqwest::Method::DELETE, &path).send().await?;
        self.check(response, "delete_replication_rule").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ndjson_skips_blank_lines() {
        let body = "{\"scope\":\"u\",\"name\":\"f1\",\"state\":\"OK\"}\n\n{\"scope\":\"u\",\"name\":\"f2\",\"state\":\"REPLICATING\"}\n";
        let locks: Vec<ReplicaLock> = parse_ndjson(body).unwrap();
        assert_eq!(locks.len(), 2);
        assert_eq!(locks[0].name, "f1");
        assert_eq!(locks[1].state, "REPLICATING");
    }

    #[test]
    fn test_parse_ndjson_reports_malformed_record() {
        let body = "{\"scope\":\"u\"";
        let result: Result<Vec<ReplicaLock>, _> = parse_ndjson(body);
        assert!(result.is_err());
    }
}
