//! External model providers
//!
//! Everything that talks to an AI model goes through [`ProviderGateway`],
//! which adds bounded retry and a per-operation circuit breaker on top of a
//! [`Provider`] implementation.

pub mod circuit_breaker;
pub mod gateway;
pub mod http_provider;
pub mod output_adapter;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use gateway::{
    gateway_from_config, FanOutCall, FanOutResult, ProviderBinding, ProviderGateway, RetryPolicy,
};
pub use http_provider::{ApiFlavor, HttpProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Structured provider failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Network,
    Timeout,
    ServerError,
    RateLimited,
    /// Missing credentials, unknown model or binding
    Config,
    /// Provider rejected the request or returned unusable output
    InvalidRequest,
    /// Breaker open; the provider was not called
    CircuitOpen,
}

impl ProviderErrorKind {
    /// Kinds the gateway retries
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Network
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::ServerError => "server_error",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Config => "config",
            ProviderErrorKind::InvalidRequest => "invalid_request",
            ProviderErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider call failure
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Config, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_fatal_config(&self) -> bool {
        self.kind == ProviderErrorKind::Config
    }
}

/// One model call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    /// Image URLs (or data URIs) attached to the prompt
    pub image_payload: Vec<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
}

/// A model backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name used in operation keys and logs
    fn name(&self) -> &str;

    /// Send one request and return the raw model text
    async fn call(&self, request: &ProviderRequest) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ProviderErrorKind::Network.is_transient());
        assert!(ProviderErrorKind::Timeout.is_transient());
        assert!(ProviderErrorKind::ServerError.is_transient());
        assert!(ProviderErrorKind::RateLimited.is_transient());
        assert!(!ProviderErrorKind::Config.is_transient());
        assert!(!ProviderErrorKind::InvalidRequest.is_transient());
        assert!(!ProviderErrorKind::CircuitOpen.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::new(ProviderErrorKind::Timeout, "no answer in 30s");
        assert_eq!(err.to_string(), "timeout: no answer in 30s");
        assert!(ProviderError::config("missing key").is_fatal_config());
    }
}
