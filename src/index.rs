//! Similarity index over tool descriptions.
//!
//! Backs the `$smart` discovery mode. Tool text is embedded through an
//! OpenAI-compatible `/embeddings` endpoint (configured by
//! `systemConfig.smartRouting`) and ranked by cosine similarity against the
//! query embedding. The store itself is in-process; the provider sits behind
//! a trait so tests and alternative backends can swap it.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    catalog::{JsonObject, ToolInfo},
    error::{HubError, HubResult},
    settings::SmartRoutingConfig,
};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> HubResult<Vec<Vec<f32>>>;
}

/// OpenAI-compatible embeddings client.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    pub fn from_config(config: &SmartRoutingConfig) -> HubResult<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| HubError::ConfigInvalid("smartRouting.openaiApiKey missing".into()))?;
        let base_url = config
            .openai_api_base_url
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());
        let model = config
            .openai_api_embedding_model
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> HubResult<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: EmbeddingsResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Clone)]
struct IndexedTool {
    server: String,
    local_name: String,
    description: String,
    input_schema: Arc<JsonObject>,
    vector: Vec<f32>,
}

/// A similarity hit, with score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: Arc<JsonObject>,
    pub score: f32,
}

/// In-process vector index keyed by server.
///
/// Re-indexed by the catalog whenever a server's effective tool list changes;
/// a disabled index (no provider) refuses searches but accepts index calls as
/// no-ops so callers need not special-case it.
pub struct ToolIndex {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    entries: RwLock<HashMap<String, Vec<IndexedTool>>>,
}

impl ToolIndex {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider: Some(provider),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            provider: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Replace the indexed tools for one server with their current effective
    /// form (overlaid descriptions, enable gates already applied).
    pub async fn index_server(&self, server: &str, tools: &[ToolInfo]) {
        let Some(provider) = &self.provider else {
            return;
        };

        if tools.is_empty() {
            self.entries.write().remove(server);
            return;
        }

        let texts: Vec<String> = tools.iter().map(embedding_text).collect();
        let vectors = match provider.embed(&texts).await {
            Ok(vectors) if vectors.len() == tools.len() => vectors,
            Ok(vectors) => {
                warn!(
                    server = %server,
                    expected = tools.len(),
                    got = vectors.len(),
                    "Embedding provider returned wrong vector count, skipping index update"
                );
                return;
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Failed to embed tools, index is stale");
                return;
            }
        };

        let indexed: Vec<IndexedTool> = tools
            .iter()
            .zip(vectors)
            .map(|(tool, vector)| IndexedTool {
                server: tool.server.clone(),
                local_name: tool.local_name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                input_schema: Arc::clone(&tool.input_schema),
                vector,
            })
            .collect();

        debug!(server = %server, count = indexed.len(), "Indexed tools");
        self.entries.write().insert(server.to_string(), indexed);
    }

    pub fn remove_server(&self, server: &str) {
        self.entries.write().remove(server);
    }

    /// Rank indexed tools against the query.
    ///
    /// `scope`, when set, restricts candidates to those servers. Results are
    /// filtered by `threshold` and truncated to `limit`, best first.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        scope: Option<&[String]>,
    ) -> HubResult<Vec<SearchHit>> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            HubError::ConfigInvalid("smart routing is not enabled in systemConfig".into())
        })?;

        let query_vec = provider
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                HubError::ConfigInvalid("embedding provider returned no vector for query".into())
            })?;

        let entries = self.entries.read();
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter(|(server, _)| scope.map_or(true, |s| s.iter().any(|n| n == *server)))
            .flat_map(|(_, tools)| tools.iter())
            .map(|tool| SearchHit {
                server_name: tool.server.clone(),
                tool_name: tool.local_name.clone(),
                description: tool.description.clone(),
                input_schema: Arc::clone(&tool.input_schema),
                score: cosine_similarity(&query_vec, &tool.vector),
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn embedding_text(tool: &ToolInfo) -> String {
    match &tool.description {
        Some(description) => format!("{}: {}", tool.local_name, description),
        None => tool.local_name.clone(),
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
