//! Result persistence to the managed datastore.
//!
//! Writes here are a side channel: callers go through [`save_best_effort`],
//! which logs failures and never propagates them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::config::PersistenceConfig;
use crate::error::PersistenceError;

/// Collection names.
pub mod collections {
    pub const PROCESSED_EMAILS: &str = "processed_emails";
    pub const TRACKING_REQUESTS: &str = "tracking_requests";
    pub const LLM_RESPONSES: &str = "llm_responses";
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Record-oriented datastore.
#[async_trait]
pub trait ResultStore: Send + Sync {
    fn name(&self) -> &str;

    async fn insert(&self, collection: &str, record: Value) -> Result<(), PersistenceError>;

    /// Insert, or merge into the row whose `conflict_key` matches.
    async fn upsert(
        &self,
        collection: &str,
        record: Value,
        conflict_key: &str,
    ) -> Result<(), PersistenceError>;

    /// First record whose `key` equals `value`.
    async fn fetch_one(
        &self,
        collection: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<Value>, PersistenceError>;
}

/// Write a record, logging instead of failing. Returns whether it was saved.
pub async fn save_best_effort(
    store: &dyn ResultStore,
    collection: &str,
    record: Value,
    conflict_key: Option<&str>,
) -> bool {
    let result = match conflict_key {
        Some(key) => store.upsert(collection, record, key).await,
        None => store.insert(collection, record).await,
    };
    match result {
        Ok(()) => {
            debug!(collection, store = store.name(), "Record saved");
            true
        }
        Err(e) => {
            error!(collection, store = store.name(), error = %e, "Failed to save record");
            false
        }
    }
}

// ── PostgREST ───────────────────────────────────────────────────────

/// PostgREST (Supabase) REST client.
pub struct RestResultStore {
    client: reqwest::Client,
    base_url: String,
    key: SecretString,
}

impl RestResultStore {
    pub fn new(config: &PersistenceConfig) -> Result<Self, PersistenceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PersistenceError::RequestFailed {
                collection: "-".to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
        })
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = self.key.expose_secret();
        builder
            .header("apikey", key)
            .bearer_auth(key)
    }

    async fn send_write(
        &self,
        collection: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<(), PersistenceError> {
        let response = builder
            .send()
            .await
            .map_err(|e| PersistenceError::RequestFailed {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PersistenceError::Rejected {
            collection: collection.to_string(),
            status: status.as_u16(),
            body: body.chars().take(300).collect(),
        })
    }
}

#[async_trait]
impl ResultStore for RestResultStore {
    fn name(&self) -> &str {
        "postgrest"
    }

    async fn insert(&self, collection: &str, record: Value) -> Result<(), PersistenceError> {
        let builder = self
            .authed(self.client.post(self.table_url(collection)))
            .header("Prefer", "return=minimal")
            .json(&record);
        self.send_write(collection, builder).await
    }

    async fn upsert(
        &self,
        collection: &str,
        record: Value,
        conflict_key: &str,
    ) -> Result<(), PersistenceError> {
        let builder = self
            .authed(self.client.post(self.table_url(collection)))
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&record);
        self.send_write(collection, builder).await
    }

    async fn fetch_one(
        &self,
        collection: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<Value>, PersistenceError> {
        let filter = format!("eq.{value}");
        let response = self
            .authed(self.client.get(self.table_url(collection)))
            .query(&[(key, filter.as_str()), ("limit", "1")])
            .send()
            .await
            .map_err(|e| PersistenceError::RequestFailed {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(PersistenceError::Rejected {
                    collection: collection.to_string(),
                    status: s.as_u16(),
                    body: body.chars().take(300).collect(),
                });
            }
            _ => {}
        }

        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| PersistenceError::InvalidResponse {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;
        Ok(rows.into_iter().next())
    }
}

// ── In-process store ────────────────────────────────────────────────

/// Keeps records in memory. Used when no datastore is configured.
#[derive(Default)]
pub struct MemoryResultStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one collection.
    pub async fn records(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, collection: &str, record: Value) -> Result<(), PersistenceError> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        record: Value,
        conflict_key: &str,
    ) -> Result<(), PersistenceError> {
        let mut collections = self.collections.write().await;
        let rows = collections.entry(collection.to_string()).or_default();
        let key = record.get(conflict_key).cloned();
        match rows
            .iter_mut()
            .find(|row| key.is_some() && row.get(conflict_key) == key.as_ref())
        {
            Some(existing) => {
                if let (Some(target), Some(source)) = (existing.as_object_mut(), record.as_object()) {
                    for (k, v) in source {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
            None => rows.push(record),
        }
        Ok(())
    }

    async fn fetch_one(
        &self,
        collection: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<Value>, PersistenceError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|rows| {
            rows.iter()
                .find(|row| row.get(key).and_then(Value::as_str) == Some(value))
                .cloned()
        }))
    }
}
