use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use common::types::{Document, NodeType};
use vector_service::{CollectionService, SearchParams};

use crate::error::HandlerError;
use crate::registry::{HandlerContext, NodeHandler};

const TAG: &str = "faiss_search";

const TOP_K_MAX: u64 = 100;

#[derive(Debug, Deserialize)]
struct SearchConfig {
    collection_name: String,
    query: String,
    top_k: Option<u64>,
    score_threshold: Option<f32>,
    metadata_filter: Option<HashMap<String, Document>>,
}

/// Similarity search over one of the calling user's collections. The user
/// scope comes from the run context, never from the config.
pub struct FaissSearchHandler {
    collections: Arc<CollectionService>,
}

impl FaissSearchHandler {
    pub fn new(collections: Arc<CollectionService>) -> Self {
        Self { collections }
    }

    fn parse(&self, config: &Document) -> Result<SearchConfig, HandlerError> {
        let parsed: SearchConfig = serde_json::from_value(config.clone())
            .map_err(|e| HandlerError::invalid_config(TAG, e.to_string()))?;
        if parsed.collection_name.trim().is_empty() {
            return Err(HandlerError::invalid_config(TAG, "collection_name is required"));
        }
        if parsed.query.trim().is_empty() {
            return Err(HandlerError::invalid_config(TAG, "query is required"));
        }
        if let Some(top_k) = parsed.top_k {
            if top_k == 0 || top_k > TOP_K_MAX {
                return Err(HandlerError::invalid_config(
                    TAG,
                    format!("top_k must be between 1 and {}", TOP_K_MAX),
                ));
            }
        }
        if let Some(threshold) = parsed.score_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(HandlerError::invalid_config(
                    TAG,
                    "score_threshold must be between 0 and 1",
                ));
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl NodeHandler for FaissSearchHandler {
    fn type_tag(&self) -> NodeType {
        NodeType::FaissSearch
    }

    fn validate_config(&self, config: &Document) -> Result<(), HandlerError> {
        self.parse(config).map(|_| ())
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        config: &Document,
        _input: &Document,
    ) -> Result<Document, HandlerError> {
        let parsed = self.parse(config)?;
        let top_k = parsed.top_k.unwrap_or(5) as usize;

        let params = SearchParams {
            top_k,
            score_threshold: parsed.score_threshold,
            metadata_filter: parsed.metadata_filter,
        };
        let hits = self
            .collections
            .search(ctx.user_id, &parsed.collection_name, &parsed.query, &params)
            .await
            .map_err(|e| HandlerError::execution(TAG, e))?;

        let total_results = hits.len();
        Ok(json!({
            "results": hits,
            "query": parsed.query,
            "collection_name": parsed.collection_name,
            "total_results": total_results,
            "top_k": top_k,
            "score_threshold": parsed.score_threshold,
            "status": "success",
        }))
    }
}
