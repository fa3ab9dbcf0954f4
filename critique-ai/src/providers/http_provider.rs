//! HTTP model provider
//!
//! Speaks either the OpenAI-compatible chat-completions format or the
//! Anthropic messages format. Transport and status failures are mapped onto
//! [`ProviderErrorKind`] so the gateway can decide what to retry.

use super::{Provider, ProviderError, ProviderErrorKind, ProviderRequest};
use crate::config::ProviderSpec;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const USER_AGENT: &str = concat!("critique-ai/", env!("CARGO_PKG_VERSION"));
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Wire format spoken by a provider endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    #[default]
    #[serde(alias = "openai")]
    OpenAiCompatible,
    Anthropic,
}

/// reqwest-backed provider
pub struct HttpProvider {
    name: String,
    flavor: ApiFlavor,
    base_url: String,
    api_key: String,
    max_tokens: u32,
    http_client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(spec: &ProviderSpec, api_key: String) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(spec.timeout_secs))
            .build()
            .map_err(|e| ProviderError::config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            name: spec.name.clone(),
            flavor: spec.flavor,
            base_url: spec.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_tokens: spec.max_tokens,
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        match self.flavor {
            ApiFlavor::OpenAiCompatible => format!("{}/chat/completions", self.base_url),
            ApiFlavor::Anthropic => format!("{}/messages", self.base_url),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        let body = build_body(self.flavor, request, self.max_tokens);
        let builder = self.http_client.post(self.endpoint()).json(&body);
        let builder = match self.flavor {
            ApiFlavor::OpenAiCompatible => builder.bearer_auth(&self.api_key),
            ApiFlavor::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        tracing::debug!(
            provider = %self.name,
            model = %request.model,
            images = request.image_payload.len(),
            "Calling model provider"
        );

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                classify_status(status),
                format!("HTTP {}: {}", status.as_u16(), truncate(&text, 300)),
            ));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid(format!("response is not JSON: {}", e)))?;
        extract_text(self.flavor, &value)
    }
}

/// Map an HTTP status onto an error kind
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 | 404 => ProviderErrorKind::Config,
        408 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::RateLimited,
        500..=599 => ProviderErrorKind::ServerError,
        _ => ProviderErrorKind::InvalidRequest,
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(ProviderErrorKind::Timeout, err.to_string())
    } else if err.is_builder() {
        ProviderError::config(err.to_string())
    } else {
        ProviderError::new(ProviderErrorKind::Network, err.to_string())
    }
}

/// Request body for the flavor
pub fn build_body(flavor: ApiFlavor, request: &ProviderRequest, max_tokens: u32) -> Value {
    match flavor {
        ApiFlavor::OpenAiCompatible => {
            let mut content = vec![json!({ "type": "text", "text": request.prompt })];
            content.extend(request.image_payload.iter().map(|url| {
                json!({ "type": "image_url", "image_url": { "url": url } })
            }));

            let mut messages = Vec::new();
            if let Some(system) = &request.system_prompt {
                messages.push(json!({ "role": "system", "content": system }));
            }
            messages.push(json!({ "role": "user", "content": content }));

            json!({
                "model": request.model,
                "max_tokens": max_tokens,
                "messages": messages,
            })
        }
        ApiFlavor::Anthropic => {
            let mut content: Vec<Value> = request
                .image_payload
                .iter()
                .map(|url| json!({ "type": "image", "source": { "type": "url", "url": url } }))
                .collect();
            content.push(json!({ "type": "text", "text": request.prompt }));

            let mut body = json!({
                "model": request.model,
                "max_tokens": max_tokens,
                "messages": [{ "role": "user", "content": content }],
            });
            if let Some(system) = &request.system_prompt {
                body["system"] = json!(system);
            }
            body
        }
    }
}

/// Pull the model text out of a response body
pub fn extract_text(flavor: ApiFlavor, body: &Value) -> Result<String, ProviderError> {
    let text = match flavor {
        ApiFlavor::OpenAiCompatible => body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string),
        ApiFlavor::Anthropic => body.get("content").and_then(Value::as_array).map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        }),
    };

    match text {
        Some(t) if !t.trim().is_empty() => Ok(t),
        _ => Err(ProviderError::invalid("response carries no model text")),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
