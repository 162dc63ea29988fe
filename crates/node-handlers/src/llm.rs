use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use ai_service::{GenerationRequest, TextGenerator};
use common::config::EngineConfig;
use common::types::{Document, NodeType};

use crate::error::HandlerError;
use crate::registry::{HandlerContext, NodeHandler};

const TAG: &str = "llm_call";

#[derive(Debug, Deserialize)]
struct LlmConfig {
    prompt_template: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
}

/// Runs a rendered prompt through the injected text generator.
pub struct LlmCallHandler {
    generator: Arc<dyn TextGenerator>,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl LlmCallHandler {
    pub fn new(generator: Arc<dyn TextGenerator>, config: &EngineConfig) -> Self {
        Self {
            generator,
            default_temperature: config.llm_default_temperature,
            default_max_tokens: config.llm_default_max_tokens,
        }
    }

    fn parse(&self, config: &Document) -> Result<LlmConfig, HandlerError> {
        let parsed: LlmConfig = serde_json::from_value(config.clone())
            .map_err(|e| HandlerError::invalid_config(TAG, e.to_string()))?;
        if parsed.prompt_template.trim().is_empty() {
            return Err(HandlerError::invalid_config(TAG, "prompt_template is required"));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl NodeHandler for LlmCallHandler {
    fn type_tag(&self) -> NodeType {
        NodeType::LlmCall
    }

    fn validate_config(&self, config: &Document) -> Result<(), HandlerError> {
        self.parse(config).map(|_| ())
    }

    async fn execute(
        &self,
        _ctx: &HandlerContext,
        config: &Document,
        _input: &Document,
    ) -> Result<Document, HandlerError> {
        let parsed = self.parse(config)?;
        let temperature = parsed.temperature.unwrap_or(self.default_temperature);
        let max_tokens = parsed.max_tokens.unwrap_or(self.default_max_tokens);

        // The dispatcher has already interpolated the template; what is left
        // in prompt_template is the final prompt.
        let request = GenerationRequest {
            prompt: parsed.prompt_template,
            temperature,
            max_tokens,
            top_p: parsed.top_p,
            top_k: parsed.top_k,
        };

        let output = self
            .generator
            .generate(request)
            .await
            .map_err(|e| HandlerError::execution(TAG, e))?;

        Ok(json!({
            "response": output.text,
            "model": output.model,
            "input_tokens": output.input_tokens,
            "output_tokens": output.output_tokens,
            "tokens_used": output.input_tokens + output.output_tokens,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "status": "success",
        }))
    }
}
