use serde::{Deserialize, Serialize};

/// Knobs the engine and handlers read at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for on-disk vector indices.
    pub vector_index_base_path: String,
    /// Fixed dimension of every vector in this deployment.
    pub embedding_dimension: usize,
    /// Fallback temperature when an llm_call config omits one.
    pub llm_default_temperature: f32,
    /// Fallback token limit when an llm_call config omits one.
    pub llm_default_max_tokens: u32,
    /// Fallback timeout when an http_request config omits one.
    pub http_default_timeout_seconds: u64,
    /// When true the validator reports disconnected components instead of
    /// rejecting the workflow.
    pub allow_disconnected_graphs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector_index_base_path: std::env::var("VECTOR_INDEX_BASE_PATH")
                .unwrap_or_else(|_| "./data/vector_indices".to_string()),
            embedding_dimension: std::env::var("EMBEDDING_DIMENSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(384),
            llm_default_temperature: std::env::var("LLM_DEFAULT_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.7),
            llm_default_max_tokens: std::env::var("LLM_DEFAULT_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            http_default_timeout_seconds: std::env::var("HTTP_DEFAULT_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            allow_disconnected_graphs: std::env::var("ALLOW_DISCONNECTED_GRAPHS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }
}
