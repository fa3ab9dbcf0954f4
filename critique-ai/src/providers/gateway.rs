//! Provider gateway: retry, circuit breaking and fan-out

use super::circuit_breaker::{BreakerState, CircuitBreaker};
use super::{Provider, ProviderError, ProviderErrorKind, ProviderRequest};
use crate::config::{GatewayConfig, ProviderRole};
use crate::models::ProviderOutcome;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&GatewayConfig> for RetryPolicy {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// A provider registered for a role
#[derive(Clone)]
pub struct ProviderBinding {
    pub name: String,
    pub role: ProviderRole,
    pub model: String,
    pub provider: Arc<dyn Provider>,
}

impl ProviderBinding {
    pub fn new(role: ProviderRole, model: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            name: provider.name().to_string(),
            role,
            model: model.into(),
            provider,
        }
    }

    /// Binding whose calls always fail with a configuration error
    pub fn unconfigured(
        name: impl Into<String>,
        role: ProviderRole,
        model: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            provider: Arc::new(UnconfiguredProvider {
                name: name.clone(),
                reason: reason.into(),
            }),
            name,
            role,
            model: model.into(),
        }
    }

    pub fn operation_key(&self) -> String {
        format!("{}:{}", self.name, self.model)
    }
}

impl std::fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("model", &self.model)
            .finish()
    }
}

struct UnconfiguredProvider {
    name: String,
    reason: String,
}

#[async_trait]
impl Provider for UnconfiguredProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _request: &ProviderRequest) -> Result<String, ProviderError> {
        Err(ProviderError::config(self.reason.clone()))
    }
}

/// One call of a fan-out
#[derive(Debug, Clone)]
pub struct FanOutCall {
    /// Name of the bound provider, as reported on results
    pub provider: String,
    pub operation_key: String,
    pub subject_id: Option<String>,
    pub request: ProviderRequest,
}

/// Settled result of one fan-out call
#[derive(Debug, Clone)]
pub struct FanOutResult {
    pub provider: String,
    pub outcome: ProviderOutcome,
    pub output: Option<String>,
}

/// Uniform entry point for every model call
pub struct ProviderGateway {
    bindings: Vec<ProviderBinding>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    policy: RetryPolicy,
    failure_threshold: u32,
    cool_down: Duration,
}

impl ProviderGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            bindings: Vec::new(),
            breakers: Mutex::new(HashMap::new()),
            policy: RetryPolicy::from(config),
            failure_threshold: config.failure_threshold,
            cool_down: config.cool_down(),
        }
    }

    pub fn register(&mut self, binding: ProviderBinding) {
        debug!(
            operation_key = %binding.operation_key(),
            role = ?binding.role,
            "Registered provider binding"
        );
        self.bindings.push(binding);
    }

    pub fn with_binding(mut self, binding: ProviderBinding) -> Self {
        self.register(binding);
        self
    }

    pub fn bindings_for(&self, role: ProviderRole) -> Vec<&ProviderBinding> {
        self.bindings.iter().filter(|b| b.role == role).collect()
    }

    pub fn binding_for(&self, role: ProviderRole) -> Option<&ProviderBinding> {
        self.bindings.iter().find(|b| b.role == role)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Breaker state for a key, `None` if the key was never invoked
    pub fn breaker_state(&self, operation_key: &str) -> Option<BreakerState> {
        self.lock_breakers()
            .get(operation_key)
            .map(|breaker| breaker.state())
    }

    fn breaker(&self, operation_key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock_breakers();
        breakers
            .entry(operation_key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.failure_threshold, self.cool_down))
            })
            .clone()
    }

    fn lock_breakers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invoke one provider operation with retry and circuit breaking
    pub async fn invoke(
        &self,
        operation_key: &str,
        request: &ProviderRequest,
    ) -> Result<String, ProviderError> {
        self.invoke_counted(operation_key, request).await.0
    }

    /// Invoke and record the outcome (latency, attempts, error kind)
    pub async fn invoke_tracked(
        &self,
        operation_key: &str,
        subject_id: Option<String>,
        request: &ProviderRequest,
    ) -> (Result<String, ProviderError>, ProviderOutcome) {
        let started = Instant::now();
        let (result, attempts) = self.invoke_counted(operation_key, request).await;
        let outcome = ProviderOutcome {
            operation_key: operation_key.to_string(),
            subject_id,
            succeeded: result.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
            error_kind: result.as_ref().err().map(|e| e.kind),
            error: result.as_ref().err().map(|e| e.message.clone()),
        };
        (result, outcome)
    }

    /// Run calls concurrently and wait for all of them to settle
    pub async fn fan_out(&self, calls: Vec<FanOutCall>) -> Vec<FanOutResult> {
        let futures = calls.into_iter().map(|call| async move {
            let (result, outcome) = self
                .invoke_tracked(&call.operation_key, call.subject_id, &call.request)
                .await;
            if let Err(err) = &result {
                warn!(
                    operation_key = %outcome.operation_key,
                    subject_id = ?outcome.subject_id,
                    error_kind = %err.kind,
                    "Fan-out call failed: {}",
                    err.message
                );
            }
            FanOutResult {
                provider: call.provider,
                outcome,
                output: result.ok(),
            }
        });
        futures::future::join_all(futures).await
    }

    async fn invoke_counted(
        &self,
        operation_key: &str,
        request: &ProviderRequest,
    ) -> (Result<String, ProviderError>, u32) {
        let Some(binding) = self
            .bindings
            .iter()
            .find(|b| b.operation_key() == operation_key)
        else {
            return (
                Err(ProviderError::config(format!(
                    "no provider bound to operation '{}'",
                    operation_key
                ))),
                0,
            );
        };

        let breaker = self.breaker(operation_key);
        let mut attempts = 0u32;

        loop {
            if !breaker.try_acquire() {
                return (
                    Err(ProviderError::new(
                        ProviderErrorKind::CircuitOpen,
                        format!("circuit open for '{}'", operation_key),
                    )),
                    attempts,
                );
            }

            attempts += 1;
            match binding.provider.call(request).await {
                Ok(text) => {
                    breaker.record_success();
                    if attempts > 1 {
                        debug!(operation_key, attempts, "Provider call succeeded after retry");
                    }
                    return (Ok(text), attempts);
                }
                Err(err) => {
                    breaker.record_failure();
                    if !err.is_transient() || attempts >= self.policy.max_attempts {
                        return (Err(err), attempts);
                    }
                    let delay = self.policy.delay_for(attempts - 1);
                    warn!(
                        operation_key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error_kind = %err.kind,
                        "Transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Build a gateway from `[[providers]]`, resolving each API key
///
/// A provider without a usable key is still registered, as an unconfigured
/// binding, so its stage fails with a configuration error instead of the
/// role silently disappearing.
pub async fn gateway_from_config(
    db: &sqlx::SqlitePool,
    config: &crate::config::TomlConfig,
) -> critique_common::Result<ProviderGateway> {
    let mut gateway = ProviderGateway::new(&config.gateway);

    for spec in &config.providers {
        let api_key = crate::config::resolve_provider_api_key(db, spec).await?;
        let binding = match api_key {
            Some(key) => match super::HttpProvider::new(spec, key) {
                Ok(provider) => ProviderBinding::new(spec.role, spec.model.clone(), Arc::new(provider)),
                Err(err) => {
                    warn!(provider = %spec.name, "Provider client unavailable: {}", err);
                    ProviderBinding::unconfigured(&spec.name, spec.role, spec.model.clone(), err.message)
                }
            },
            None => ProviderBinding::unconfigured(
                &spec.name,
                spec.role,
                spec.model.clone(),
                format!("no API key configured for provider '{}'", spec.name),
            ),
        };
        gateway.register(binding);
    }

    Ok(gateway)
}
