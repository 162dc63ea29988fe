use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use common::config::EngineConfig;
use common::types::{Document, NodeType};

use crate::error::HandlerError;
use crate::registry::{HandlerContext, NodeHandler};

const TAG: &str = "http_request";

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, thiserror::Error)]
pub enum HttpCallError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One outbound request, fully resolved.
#[derive(Debug, Clone)]
pub struct HttpCallRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Document>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub verify_tls: bool,
}

#[derive(Debug, Clone)]
pub struct HttpCallResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    /// JSON-decoded when the content type says JSON, plain text when UTF-8,
    /// base64 otherwise.
    pub body: Document,
    pub elapsed: Duration,
}

/// Transport boundary the http_request handler depends on.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, request: HttpCallRequest) -> Result<HttpCallResponse, HttpCallError>;
}

/// reqwest-backed client. Redirect policy and TLS verification vary per
/// request, so the inner client is built per call.
#[derive(Default)]
pub struct ReqwestHttpClient;

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn call(&self, request: HttpCallRequest) -> Result<HttpCallResponse, HttpCallError> {
        let redirect = if request.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .timeout(request.timeout)
            .redirect(redirect)
            .danger_accept_invalid_certs(!request.verify_tls)
            .build()
            .map_err(|e| HttpCallError::Transport(e.to_string()))?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| HttpCallError::Protocol(e.to_string()))?;

        let mut builder = client.request(method, &request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = match body {
                Document::String(text) => builder.body(text.clone()),
                other => builder.json(other),
            };
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpCallError::Timeout(request.timeout)
            } else {
                HttpCallError::Transport(e.to_string())
            }
        })?;
        let status_code = response.status().as_u16();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
        let is_json = headers
            .get("content-type")
            .is_some_and(|ct| ct.contains("json"));

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpCallError::Protocol(e.to_string()))?;
        let elapsed = started.elapsed();

        let body = if is_json {
            serde_json::from_slice(&bytes)
                .map_err(|e| HttpCallError::Protocol(format!("invalid JSON body: {}", e)))?
        } else {
            match std::str::from_utf8(&bytes) {
                Ok(text) => Document::String(text.to_string()),
                Err(_) => Document::String(BASE64.encode(&bytes)),
            }
        };

        Ok(HttpCallResponse {
            status_code,
            headers,
            body,
            elapsed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    method: Option<String>,
    headers: Option<HashMap<String, Document>>,
    query: Option<HashMap<String, Document>>,
    body: Option<Document>,
    timeout: Option<f64>,
    follow_redirects: Option<bool>,
    verify_ssl: Option<bool>,
}

/// Issues one HTTP request described by the rendered config.
pub struct HttpRequestHandler {
    client: Arc<dyn HttpClient>,
    default_timeout: Duration,
}

impl HttpRequestHandler {
    pub fn new(client: Arc<dyn HttpClient>, config: &EngineConfig) -> Self {
        Self {
            client,
            default_timeout: Duration::from_secs(config.http_default_timeout_seconds),
        }
    }

    fn parse(&self, config: &Document) -> Result<HttpConfig, HandlerError> {
        let parsed: HttpConfig = serde_json::from_value(config.clone())
            .map_err(|e| HandlerError::invalid_config(TAG, e.to_string()))?;
        if parsed.url.trim().is_empty() {
            return Err(HandlerError::invalid_config(TAG, "url is required"));
        }
        if let Some(method) = &parsed.method {
            if !METHODS.contains(&method.to_uppercase().as_str()) {
                return Err(HandlerError::invalid_config(
                    TAG,
                    format!("unsupported method '{}'", method),
                ));
            }
        }
        if let Some(timeout) = parsed.timeout {
            if timeout <= 0.0 {
                return Err(HandlerError::invalid_config(TAG, "timeout must be positive"));
            }
        }
        Ok(parsed)
    }
}

fn text_value(value: &Document) -> String {
    match value {
        Document::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    fn type_tag(&self) -> NodeType {
        NodeType::HttpRequest
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
        let method = parsed
            .method
            .map(|m| m.to_uppercase())
            .unwrap_or_else(|| "GET".to_string());
        let url = parsed.url.clone();

        let request = HttpCallRequest {
            method: method.clone(),
            url: url.clone(),
            headers: parsed
                .headers
                .unwrap_or_default()
                .iter()
                .map(|(k, v)| (k.clone(), text_value(v)))
                .collect(),
            query: parsed
                .query
                .unwrap_or_default()
                .iter()
                .map(|(k, v)| (k.clone(), text_value(v)))
                .collect(),
            body: parsed.body,
            timeout: parsed
                .timeout
                .map(Duration::from_secs_f64)
                .unwrap_or(self.default_timeout),
            follow_redirects: parsed.follow_redirects.unwrap_or(true),
            verify_tls: parsed.verify_ssl.unwrap_or(true),
        };

        let response = self
            .client
            .call(request)
            .await
            .map_err(|e| HandlerError::execution(TAG, e))?;

        Ok(json!({
            "status_code": response.status_code,
            "headers": response.headers,
            "body": response.body,
            "url": url,
            "method": method,
            "elapsed_ms": response.elapsed.as_millis() as u64,
            "status": "success",
        }))
    }
}
