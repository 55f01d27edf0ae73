//! Thin HTTP client for the PocketBase persistence collaborator.
//!
//! The hub treats durable storage as an external CRUD service: records in,
//! records out, keyed by collection name and record id. Nothing in here
//! knows about sessions, polls or chat; callers shape the JSON.

use std::collections::HashMap;

use reqwest::{Client, Error as ReqwestError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PocketBaseError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] ReqwestError),
    #[error("API error: {message} (code: {code})")]
    Api { message: String, code: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PocketBaseClient {
    client: Client,
    base_url: String,
    admin_token: Option<String>,
}

/// One stored record. Collection-specific fields stay untyped; the callers
/// deserialize what they need out of `fields`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub created: String,
    pub updated: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl PocketBaseClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: String) -> Self {
        self.admin_token = Some(token);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = &self.admin_token {
            if let Ok(value) = format!("Bearer {}", token).parse() {
                headers.insert("Authorization", value);
            }
        }
        headers
    }

    async fn api_error(response: reqwest::Response) -> PocketBaseError {
        let status = response.status();
        let error: Value = response.json().await.unwrap_or_default();
        PocketBaseError::Api {
            message: error["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
            code: status.to_string(),
        }
    }

    pub async fn health(&self) -> Result<(), PocketBaseError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn create_record(
        &self,
        collection: &str,
        data: Value,
    ) -> Result<Record, PocketBaseError> {
        let url = format!("{}/api/collections/{}/records", self.base_url, collection);
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers())
            .json(&data)
            .send()
            .await?;

        if response.status().is_success() {
            let record: Record = response.json().await?;
            debug!(collection, id = %record.id, "created record");
            Ok(record)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn get_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Record, PocketBaseError> {
        let url = format!(
            "{}/api/collections/{}/records/{}",
            self.base_url, collection, id
        );
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn update_record(
        &self,
        collection: &str,
        id: &str,
        data: Value,
    ) -> Result<Record, PocketBaseError> {
        let url = format!(
            "{}/api/collections/{}/records/{}",
            self.base_url, collection, id
        );
        let response = self
            .client
            .patch(&url)
            .headers(self.auth_headers())
            .json(&data)
            .send()
            .await?;

        if response.status().is_success() {
            let record: Record = response.json().await?;
            debug!(collection, id, "updated record");
            Ok(record)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn delete_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<(), PocketBaseError> {
        let url = format!(
            "{}/api/collections/{}/records/{}",
            self.base_url, collection, id
        );
        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers())
            .send()
            .await?;

        if response.status().is_success() {
            debug!(collection, id, "deleted record");
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn list_records(
        &self,
        collection: &str,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Vec<Record>, PocketBaseError> {
        let mut url = format!("{}/api/collections/{}/records", self.base_url, collection);

        let mut params = Vec::new();
        if let Some(f) = filter {
            params.push(format!("filter={}", f));
        }
        if let Some(s) = sort {
            params.push(format!("sort={}", s));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await?;

        if response.status().is_success() {
            let body: Value = response.json().await?;
            let records: Vec<Record> = serde_json::from_value(body["items"].clone())?;
            Ok(records)
        } else {
            Err(Self::api_error(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = PocketBaseClient::new("http://localhost:8090/");
        assert_eq!(client.base_url(), "http://localhost:8090");
    }

    #[test]
    fn record_keeps_extra_fields() {
        let raw = serde_json::json!({
            "id": "abc",
            "created": "2025-01-01 00:00:00",
            "updated": "2025-01-01 00:00:00",
            "state": "live",
            "title": "demo"
        });
        let record: Record = serde_json::from_value(raw).expect("record");
        assert_eq!(record.fields["state"], "live");
        assert_eq!(record.fields["title"], "demo");
    }
}
