use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

/// Text generation request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 256,
            top_p: None,
            top_k: None,
        }
    }
}

/// Generated text plus token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The model could not be reached at all; generation was never attempted.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The model was reached but generation failed.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The prompt exceeds the model's context window.
    #[error("prompt exceeds model context window: {0}")]
    ContextOverflow(String),
}

/// Capability boundary the llm_call handler depends on. Implementations are
/// injected; tests substitute mocks.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput, LlmError>;
}

/// HTTP client for an OpenAI-compatible chat completion endpoint.
///
/// The model behind the endpoint is a process-singleton resource, so calls
/// are serialized through a mutex; a run that reaches an llm_call node while
/// another run holds the model waits here.
pub struct AiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    serial: Mutex<()>,
}

impl AiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            serial: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TextGenerator for AiClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput, LlmError> {
        let _guard = self.serial.lock().await;

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": request.prompt
                }
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if let Some(top_p) = request.top_p {
            body["top_p"] = JsonValue::from(top_p);
        }
        if let Some(top_k) = request.top_k {
            body["top_k"] = JsonValue::from(top_k);
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ModelUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            // Overlong prompts come back as a 400 mentioning context length.
            if status.as_u16() == 400 && error_text.contains("context") {
                return Err(LlmError::ContextOverflow(error_text));
            }
            return Err(LlmError::GenerationFailed(error_text));
        }

        let response_json: JsonValue = response
            .json()
            .await
            .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;

        let text = response_json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        tracing::debug!(model = %self.model, output_chars = text.len(), "generation complete");

        Ok(GenerationOutput {
            text,
            model: response_json["model"]
                .as_str()
                .unwrap_or(&self.model)
                .to_string(),
            input_tokens: response_json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: response_json["usage"]["completion_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
        })
    }
}
