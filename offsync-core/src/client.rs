use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const REST_PREFIX: &str = "rest/v1/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),
    #[error("refusing to {0} without a match predicate")]
    EmptyMatch(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Equality predicate over record columns, rendered as `column=eq.value`
/// query pairs by the collection protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Match {
    columns: BTreeMap<String, Value>,
}

impl Match {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and(column, value)
    }

    pub fn and(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Local evaluation against a JSON record.
    pub fn matches(&self, record: &Value) -> bool {
        self.columns
            .iter()
            .all(|(column, expected)| record.get(column) == Some(expected))
    }

    fn query_pairs(&self) -> impl Iterator<Item = (&str, String)> {
        self.columns
            .iter()
            .map(|(column, value)| (column.as_str(), format!("eq.{}", scalar_to_string(value))))
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Minimal projection used to check whether a locally cached record is
/// still current on the backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordStamp {
    pub id: Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Clone)]
pub struct CollectionClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl CollectionClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub async fn ping(&self) -> Result<(), BackendError> {
        let url = self.base_url.join(REST_PREFIX)?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn insert(&self, collection: &str, record: &Value) -> Result<(), BackendError> {
        let url = self.collection_url(collection, None)?;
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn update(
        &self,
        collection: &str,
        filter: &Match,
        changes: &Value,
    ) -> Result<(), BackendError> {
        if filter.is_empty() {
            return Err(BackendError::EmptyMatch("update"));
        }
        let url = self.collection_url(collection, Some(filter))?;
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=minimal")
            .json(changes)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn delete(&self, collection: &str, filter: &Match) -> Result<(), BackendError> {
        if filter.is_empty() {
            return Err(BackendError::EmptyMatch("delete"));
        }
        let url = self.collection_url(collection, Some(filter))?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn select(
        &self,
        collection: &str,
        filter: &Match,
        columns: Option<&[&str]>,
    ) -> Result<Vec<Value>, BackendError> {
        let mut url = self.collection_url(collection, Some(filter))?;
        if let Some(columns) = columns.filter(|c| !c.is_empty()) {
            url.query_pairs_mut().append_pair("select", &columns.join(","));
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn fetch_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>, BackendError> {
        let rows = self.select(collection, &Match::eq("id", id), None).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn fetch_stamp(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<RecordStamp>, BackendError> {
        let mut url = self.collection_url(collection, Some(&Match::eq("id", id)))?;
        url.query_pairs_mut().append_pair("select", "id,updated_at");
        let response = self.authorized(self.http.get(url)).send().await?;
        let rows: Vec<RecordStamp> = Self::handle_response(response).await?;
        Ok(rows.into_iter().next())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn collection_url(&self, collection: &str, filter: Option<&Match>) -> Result<Url, BackendError> {
        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BackendError::InvalidCollection(collection.to_string()));
        }
        let mut url = self
            .base_url
            .join(REST_PREFIX)?
            .join(collection)?;
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            let mut query = url.query_pairs_mut();
            for (column, value) in filter.query_pairs() {
                query.append_pair(column, &value);
            }
        }
        Ok(url)
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), BackendError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> BackendError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        BackendError::Api {
            status,
            body,
            retry_after,
        }
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

impl BackendError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            BackendError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Request(_) => true,
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    /// True when no connection could be established at all. A timeout on an
    /// established request is an ordinary failed attempt.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BackendError::Request(err) if err.is_connect())
    }

    pub fn is_rate_limited(&self) -> bool {
        self.classification() == Some(ApiErrorClass::RateLimit)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            BackendError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn match_renders_eq_pairs_in_column_order() {
        let filter = Match::eq("id", "r1").and("version", 3);
        let pairs: Vec<_> = filter.query_pairs().collect();
        assert_eq!(
            pairs,
            vec![("id", "eq.r1".to_string()), ("version", "eq.3".to_string())]
        );
    }

    #[test]
    fn match_evaluates_locally() {
        let filter = Match::eq("folder_id", "f1");
        assert!(filter.matches(&json!({"id": "d1", "folder_id": "f1"})));
        assert!(!filter.matches(&json!({"id": "d2", "folder_id": "f2"})));
        assert!(Match::new().matches(&json!({"anything": true})));
    }

    #[test]
    fn match_serializes_as_plain_object() {
        let filter = Match::eq("id", "r1");
        assert_eq!(serde_json::to_value(&filter).unwrap(), json!({"id": "r1"}));
    }

    #[test]
    fn retry_after_accepts_seconds() {
        assert_eq!(parse_retry_after("12"), Some(12));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn rejects_suspicious_collection_names() {
        let client = CollectionClient::new("http://localhost:1", "k").unwrap();
        assert!(matches!(
            client.collection_url("../admin", None),
            Err(BackendError::InvalidCollection(_))
        ));
        let url = client
            .collection_url("document_regions", Some(&Match::eq("id", "r1")))
            .unwrap();
        assert_eq!(url.path(), "/rest/v1/document_regions");
        assert_eq!(url.query(), Some("id=eq.r1"));
    }
}
