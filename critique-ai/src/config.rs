//! Configuration for critique-ai
//!
//! Two tiers, matching the rest of the service:
//! 1. **TOML bootstrap** (`critique-ai.toml`): port, root folder, logging,
//!    pipeline policy, gateway retry/breaker settings, provider bindings.
//! 2. **Database settings**: provider API keys, resolved Database → ENV → TOML.

use crate::models::Stage;
use crate::providers::ApiFlavor;
use critique_common::config::LoggingConfig;
use critique_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database (optional, see root folder resolution)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            port: default_port(),
            logging: LoggingConfig::default(),
            pipeline: PipelineConfig::default(),
            gateway: GatewayConfig::default(),
            scoring: ScoringConfig::default(),
            providers: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    5730
}

impl TomlConfig {
    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        let config: TomlConfig =
            critique_common::config::load_toml_config(path)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline
            .progress
            .validate()
            .map_err(Error::Config)?;

        if self.gateway.max_attempts == 0 {
            return Err(Error::Config("gateway.max_attempts must be at least 1".into()));
        }
        if self.gateway.failure_threshold == 0 {
            return Err(Error::Config(
                "gateway.failure_threshold must be at least 1".into(),
            ));
        }
        if self.pipeline.worker_count == 0 {
            return Err(Error::Config("pipeline.worker_count must be at least 1".into()));
        }

        let mut names = std::collections::HashSet::new();
        for spec in &self.providers {
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Config(format!(
                    "provider '{}' is defined more than once",
                    spec.name
                )));
            }
        }

        let ai_count = self
            .providers
            .iter()
            .filter(|p| p.role == ProviderRole::Ai)
            .count();
        if ai_count > 1 {
            return Err(Error::Config(format!(
                "exactly one ai provider may be configured, found {}",
                ai_count
            )));
        }
        Ok(())
    }
}

/// Progress values for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Progress reported when the stage starts
    pub floor: u8,
    /// Progress reported when the stage completes
    pub completed: u8,
}

/// Stage → progress policy table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgressPolicy {
    pub context: StageProgress,
    pub vision: StageProgress,
    pub ai: StageProgress,
    pub synthesis: StageProgress,
}

impl Default for StageProgressPolicy {
    fn default() -> Self {
        Self {
            context: StageProgress { floor: 5, completed: 20 },
            vision: StageProgress { floor: 25, completed: 55 },
            ai: StageProgress { floor: 60, completed: 80 },
            synthesis: StageProgress { floor: 85, completed: 100 },
        }
    }
}

impl StageProgressPolicy {
    pub fn for_stage(&self, stage: Stage) -> StageProgress {
        match stage {
            Stage::Context => self.context,
            Stage::Vision => self.vision,
            Stage::Ai => self.ai,
            Stage::Synthesis => self.synthesis,
            Stage::Completed => StageProgress { floor: 100, completed: 100 },
        }
    }

    /// Values must be non-decreasing along the pipeline and end at 100
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut previous = 0u8;
        for stage in Stage::PIPELINE {
            let p = self.for_stage(stage);
            if p.floor < previous || p.completed < p.floor {
                return Err(format!(
                    "progress policy for {} ({} → {}) is not monotonic",
                    stage, p.floor, p.completed
                ));
            }
            previous = p.completed;
        }
        if self.synthesis.completed != 100 {
            return Err("synthesis must complete at progress 100".to_string());
        }
        Ok(())
    }
}

/// Orchestrator policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub progress: StageProgressPolicy,

    /// Dedup window for identical analyses
    #[serde(default = "default_dedup_window_hours")]
    pub dedup_window_hours: u32,

    /// Event rows older than this are purged
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u32,

    /// Treat "every vision provider failed" as a stage failure
    #[serde(default)]
    pub escalate_total_vision_failure: bool,

    /// Stage worker tasks
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// A `started` event older than this with no outcome marks an abandoned stage
    #[serde(default = "default_stale_stage_after_secs")]
    pub stale_stage_after_secs: u64,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            progress: StageProgressPolicy::default(),
            dedup_window_hours: default_dedup_window_hours(),
            event_retention_days: default_event_retention_days(),
            escalate_total_vision_failure: false,
            worker_count: default_worker_count(),
            stale_stage_after_secs: default_stale_stage_after_secs(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl PipelineConfig {
    pub fn stale_stage_after(&self) -> Duration {
        Duration::from_secs(self.stale_stage_after_secs)
    }
}

fn default_dedup_window_hours() -> u32 {
    24
}

fn default_event_retention_days() -> u32 {
    60
}

fn default_worker_count() -> usize {
    4
}

fn default_stale_stage_after_secs() -> u64 {
    600
}

fn default_event_bus_capacity() -> usize {
    256
}

/// Provider gateway retry and circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Total attempts per invocation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures that open a breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before allowing a probe
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            cool_down_secs: default_cool_down_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down_secs() -> u64 {
    30
}

/// Quality score weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Points removed per failed provider call
    #[serde(default = "default_provider_dropout_penalty")]
    pub provider_dropout_penalty: f64,

    /// Cap on the total dropout penalty
    #[serde(default = "default_max_dropout_penalty")]
    pub max_dropout_penalty: f64,

    /// Confidence below this is penalized
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Penalty at zero confidence, scaled linearly up to `min_confidence`
    #[serde(default = "default_confidence_penalty")]
    pub confidence_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            provider_dropout_penalty: default_provider_dropout_penalty(),
            max_dropout_penalty: default_max_dropout_penalty(),
            min_confidence: default_min_confidence(),
            confidence_penalty: default_confidence_penalty(),
        }
    }
}

fn default_provider_dropout_penalty() -> f64 {
    15.0
}

fn default_max_dropout_penalty() -> f64 {
    30.0
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_confidence_penalty() -> f64 {
    10.0
}

/// What a provider binding is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Context,
    Vision,
    Ai,
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub role: ProviderRole,
    #[serde(default)]
    pub flavor: ApiFlavor,
    pub base_url: String,
    pub model: String,
    /// Lowest-priority key source
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl ProviderSpec {
    /// Circuit breaker / gateway key: `provider:model`
    pub fn operation_key(&self) -> String {
        format!("{}:{}", self.name, self.model)
    }

    /// Settings table key for this provider's API key
    pub fn settings_key(&self) -> String {
        format!("provider.{}.api_key", self.name)
    }
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    2048
}

/// Resolve a provider API key
///
/// **Priority:** Database → ENV → TOML. Returns `None` when no tier has a
/// usable key; the binding is then registered as unconfigured and calls fail
/// with a fatal configuration error.
pub async fn resolve_provider_api_key(
    db: &Pool<Sqlite>,
    spec: &ProviderSpec,
) -> Result<Option<String>> {
    let db_key = crate::db::settings::get_setting::<String>(db, &spec.settings_key())
        .await?
        .filter(|k| is_valid_key(k));
    let env_key = spec
        .api_key_env
        .as_ref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|k| is_valid_key(k));
    let toml_key = spec.api_key.clone().filter(|k| is_valid_key(k));

    let sources: Vec<&str> = [
        db_key.as_ref().map(|_| "database"),
        env_key.as_ref().map(|_| "environment"),
        toml_key.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            provider = %spec.name,
            "API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    let resolved = db_key.or(env_key).or(toml_key);
    match sources.first() {
        Some(source) => info!(provider = %spec.name, "API key loaded from {}", source),
        None => warn!(provider = %spec.name, "No API key configured"),
    }
    Ok(resolved)
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TomlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.dedup_window_hours, 24);
        assert_eq!(config.pipeline.event_retention_days, 60);
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.gateway.failure_threshold, 5);
    }

    #[test]
    fn test_default_progress_floors() {
        let policy = StageProgressPolicy::default();
        assert_eq!(policy.for_stage(Stage::Context).floor, 5);
        assert_eq!(policy.for_stage(Stage::Vision).floor, 25);
        assert_eq!(policy.for_stage(Stage::Ai).floor, 60);
        assert_eq!(policy.for_stage(Stage::Synthesis).floor, 85);
        assert_eq!(policy.for_stage(Stage::Completed).floor, 100);
    }

    #[test]
    fn test_non_monotonic_policy_rejected() {
        let mut policy = StageProgressPolicy::default();
        policy.ai.floor = 10;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_parse_toml_with_providers() {
        let toml_str = r#"
            port = 6000

            [pipeline]
            escalate_total_vision_failure = true

            [gateway]
            max_attempts = 2

            [[providers]]
            name = "openai"
            role = "vision"
            base_url = "https://api.openai.com/v1"
            model = "gpt-4o"
            api_key_env = "OPENAI_API_KEY"

            [[providers]]
            name = "claude"
            role = "ai"
            flavor = "anthropic"
            base_url = "https://api.anthropic.com/v1"
            model = "claude-sonnet"
        "#;
        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 6000);
        assert!(config.pipeline.escalate_total_vision_failure);
        assert_eq!(config.pipeline.worker_count, 4);
        assert_eq!(config.gateway.max_attempts, 2);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].flavor, ApiFlavor::OpenAiCompatible);
        assert_eq!(config.providers[1].flavor, ApiFlavor::Anthropic);
        assert_eq!(config.providers[1].operation_key(), "claude:claude-sonnet");
    }

    #[test]
    fn test_two_ai_providers_rejected() {
        let mut config = TomlConfig::default();
        for name in ["a", "b"] {
            config.providers.push(ProviderSpec {
                name: name.to_string(),
                role: ProviderRole::Ai,
                flavor: ApiFlavor::default(),
                base_url: "http://localhost".to_string(),
                model: "m".to_string(),
                api_key: None,
                api_key_env: None,
                timeout_secs: 10,
                max_tokens: 100,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("sk-123"));
        assert!(!is_valid_key("   "));
        assert!(!is_valid_key(""));
    }
}
