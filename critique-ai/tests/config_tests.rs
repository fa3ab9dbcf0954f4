//! Bootstrap config and provider credential tests

mod helpers;

use critique_ai::config::{resolve_provider_api_key, ProviderRole, ProviderSpec, TomlConfig};
use critique_ai::db::settings;
use critique_ai::providers::{gateway_from_config, ApiFlavor, ProviderErrorKind, ProviderRequest};
use helpers::create_test_db;
use serial_test::serial;
use tempfile::TempDir;

const KEY_ENV: &str = "CRITIQUE_TEST_AI_KEY";

fn ai_spec(api_key: Option<&str>) -> ProviderSpec {
    ProviderSpec {
        name: "claude".to_string(),
        role: ProviderRole::Ai,
        flavor: ApiFlavor::Anthropic,
        base_url: "https://api.example.com/v1".to_string(),
        model: "review-large".to_string(),
        api_key: api_key.map(str::to_string),
        api_key_env: Some(KEY_ENV.to_string()),
        timeout_secs: 30,
        max_tokens: 1024,
    }
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = TomlConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.port, 5730);
    assert!(config.providers.is_empty());
    assert!(!config.pipeline.escalate_total_vision_failure);
}

#[test]
fn test_toml_overrides_and_providers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("critique-ai.toml");
    std::fs::write(
        &path,
        r#"
port = 6100

[logging]
level = "debug"

[pipeline]
escalate_total_vision_failure = true
event_retention_days = 30

[gateway]
max_attempts = 4

[[providers]]
name = "vision-local"
role = "vision"
flavor = "openai"
base_url = "http://127.0.0.1:11434/v1"
model = "llava"

[[providers]]
name = "claude"
role = "ai"
flavor = "anthropic"
base_url = "https://api.example.com/v1"
model = "review-large"
api_key_env = "CRITIQUE_TEST_AI_KEY"
"#,
    )
    .unwrap();

    let config = TomlConfig::load(&path).unwrap();
    assert_eq!(config.port, 6100);
    assert_eq!(config.logging.level, "debug");
    assert!(config.pipeline.escalate_total_vision_failure);
    assert_eq!(config.pipeline.event_retention_days, 30);
    // Untouched keys keep their defaults
    assert_eq!(config.pipeline.dedup_window_hours, 24);
    assert_eq!(config.gateway.max_attempts, 4);
    assert_eq!(config.providers.len(), 2);
    assert_eq!(config.providers[0].flavor, ApiFlavor::OpenAiCompatible);
    assert_eq!(config.providers[1].role, ProviderRole::Ai);
    assert_eq!(config.providers[1].timeout_secs, 60);
}

#[test]
fn test_second_ai_provider_is_rejected() {
    let mut config = TomlConfig::default();
    config.providers.push(ai_spec(Some("k1")));
    let mut second = ai_spec(Some("k2"));
    second.name = "other".to_string();
    config.providers.push(second);

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("exactly one ai provider"));
}

#[test]
fn test_malformed_toml_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "port = \"not a number\"").unwrap();
    assert!(TomlConfig::load(&path).is_err());
}

#[tokio::test]
#[serial]
async fn test_api_key_priority_database_env_toml() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let spec = ai_spec(Some("from-toml"));

    std::env::remove_var(KEY_ENV);
    let key = resolve_provider_api_key(&pool, &spec).await.unwrap();
    assert_eq!(key.as_deref(), Some("from-toml"));

    std::env::set_var(KEY_ENV, "from-env");
    let key = resolve_provider_api_key(&pool, &spec).await.unwrap();
    assert_eq!(key.as_deref(), Some("from-env"));

    settings::set_provider_api_key(&pool, "claude", "from-db".to_string())
        .await
        .unwrap();
    let key = resolve_provider_api_key(&pool, &spec).await.unwrap();
    assert_eq!(key.as_deref(), Some("from-db"));
    assert_eq!(
        settings::get_provider_api_key(&pool, "claude")
            .await
            .unwrap()
            .as_deref(),
        Some("from-db")
    );

    std::env::remove_var(KEY_ENV);
}

#[tokio::test]
#[serial]
async fn test_blank_keys_are_ignored() {
    let (_dir, pool) = create_test_db().await.unwrap();
    std::env::set_var(KEY_ENV, "   ");

    let key = resolve_provider_api_key(&pool, &ai_spec(Some(""))).await.unwrap();
    assert!(key.is_none());

    std::env::remove_var(KEY_ENV);
}

#[tokio::test]
#[serial]
async fn test_provider_without_key_is_registered_unconfigured() {
    let (_dir, pool) = create_test_db().await.unwrap();
    std::env::remove_var(KEY_ENV);

    let mut config = TomlConfig::default();
    config.providers.push(ai_spec(None));
    let gateway = gateway_from_config(&pool, &config).await.unwrap();

    let binding = gateway
        .binding_for(ProviderRole::Ai)
        .expect("ai role stays bound");
    assert_eq!(binding.name, "claude");

    let err = gateway
        .invoke(&binding.operation_key(), &ProviderRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::Config);
    assert!(err.message.contains("no API key configured"));
}

#[tokio::test]
#[serial]
async fn test_provider_with_key_gets_http_client() {
    let (_dir, pool) = create_test_db().await.unwrap();
    std::env::set_var(KEY_ENV, "sk-test");

    let mut config = TomlConfig::default();
    config.providers.push(ai_spec(None));
    let gateway = gateway_from_config(&pool, &config).await.unwrap();

    let binding = gateway.binding_for(ProviderRole::Ai).unwrap();
    assert_eq!(binding.name, "claude");
    assert_eq!(binding.model, "review-large");
    assert_eq!(binding.operation_key(), "claude:review-large");

    std::env::remove_var(KEY_ENV);
}
