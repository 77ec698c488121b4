//! Document retrieval against a search index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use voxrag_core::config::Config;
use voxrag_core::error::{PipelineError, Result};
use voxrag_core::types::{QueryType, RetrievedDocument, SearchMode, SearchOptions};

const SERVICE: &str = "search";
const SEARCH_API_VERSION: &str = "2023-07-01-preview";

/// Index statistics, reported by the `health` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<RetrievedDocument>>;

    async fn index_stats(&self) -> Result<IndexHealth>;
}

pub struct AzureSearchBackend {
    client: reqwest::Client,
    endpoint: String,
    index: String,
    api_key: String,
}

impl AzureSearchBackend {
    pub fn new(
        endpoint: &str,
        index: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index: index.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config
            .search_endpoint()
            .ok_or_else(|| PipelineError::Config("Search endpoint is not configured".into()))?;
        let index = config
            .search_index()
            .ok_or_else(|| PipelineError::Config("Search index is not configured".into()))?;
        let key = config
            .search_key()
            .ok_or_else(|| PipelineError::Config("Search API key is not configured".into()))?;
        Self::new(&endpoint, index, key, config.search_timeout())
    }

    fn transport_error(e: reqwest::Error) -> PipelineError {
        PipelineError::from_transport(
            SERVICE,
            e.is_timeout(),
            &e.to_string(),
            PipelineError::RetrievalUnavailable,
        )
    }
}

fn request_body(query: &str, options: &SearchOptions) -> serde_json::Value {
    let mut body = json!({
        "search": query,
        "top": options.top_k,
        "searchMode": match options.search_mode {
            SearchMode::Any => "any",
            SearchMode::All => "all",
        },
        "queryType": match options.query_type {
            QueryType::Simple => "simple",
            QueryType::Full => "full",
        },
    });
    if let Some(select) = &options.select {
        body["select"] = json!(select);
    }
    if let Some(filter) = &options.filter {
        body["filter"] = json!(filter);
    }
    body
}

/// Parse an Azure AI Search response, highest score first.
fn parse_search_results(body: &serde_json::Value, max: usize) -> Vec<RetrievedDocument> {
    let empty = vec![];
    let hits = body["value"].as_array().unwrap_or(&empty);
    let mut docs: Vec<RetrievedDocument> = hits
        .iter()
        .map(|hit| RetrievedDocument {
            content: ["content", "text", "document"]
                .iter()
                .find_map(|k| hit[*k].as_str())
                .unwrap_or("")
                .to_string(),
            source: hit["metadata"]["source"]
                .as_str()
                .or_else(|| hit["source"].as_str())
                .unwrap_or("Unknown source")
                .to_string(),
            score: hit["@search.score"].as_f64().unwrap_or(0.0),
        })
        .collect();
    docs.sort_by(|a, b| b.score.total_cmp(&a.score));
    docs.truncate(max);
    docs
}

#[async_trait]
impl SearchBackend for AzureSearchBackend {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<RetrievedDocument>> {
        let url = format!(
            "{}/indexes/{}/docs/search?api-version={SEARCH_API_VERSION}",
            self.endpoint, self.index
        );
        debug!(index = %self.index, top = options.top_k, "search_request");

        let resp = self
            .client
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&request_body(query, options))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_provider_status(
                SERVICE,
                status.as_u16(),
                &body,
                PipelineError::RetrievalUnavailable,
            ));
        }

        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        Ok(parse_search_results(&body, options.top_k))
    }

    async fn index_stats(&self) -> Result<IndexHealth> {
        let url = format!(
            "{}/indexes/{}/stats?api-version={SEARCH_API_VERSION}",
            self.endpoint, self.index
        );
        let resp = self
            .client
            .get(&url)
            .header("api-key", &self.api_key)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_provider_status(
                SERVICE,
                status.as_u16(),
                &body,
                PipelineError::RetrievalUnavailable,
            ));
        }
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        Ok(IndexHealth {
            healthy: true,
            document_count: body["documentCount"].as_u64(),
            storage_size: body["storageSize"].as_u64(),
            error: None,
        })
    }
}

/// Retrieval stage: never fails, degrades to an empty list.
#[derive(Clone)]
pub struct Retriever {
    backend: Option<Arc<dyn SearchBackend>>,
}

impl Retriever {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A retriever with no index behind it; every query returns no documents.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub async fn retrieve(&self, query: &str, options: &SearchOptions) -> Vec<RetrievedDocument> {
        let Some(backend) = &self.backend else {
            debug!("retrieval_disabled");
            return Vec::new();
        };
        if query.trim().is_empty() {
            return Vec::new();
        }
        let started = Instant::now();
        match backend.search(query, options).await {
            Ok(docs) => {
                info!(
                    documents = docs.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retrieval_complete"
                );
                docs
            }
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.code(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retrieval_unavailable"
                );
                Vec::new()
            }
        }
    }

    pub async fn index_health(&self) -> IndexHealth {
        let Some(backend) = &self.backend else {
            return IndexHealth {
                healthy: false,
                document_count: None,
                storage_size: None,
                error: Some("Search is not configured".into()),
            };
        };
        match backend.index_stats().await {
            Ok(health) => health,
            Err(e) => IndexHealth {
                healthy: false,
                document_count: None,
                storage_size: None,
                error: Some(e.to_string()),
            },
        }
    }
}
