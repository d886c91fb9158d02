use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const ENGINE_JSON: &str = "engine.json";
const REMOTE_JSON: &str = "remote.json";
const SUPPORTED_SCHEMA: u64 = 1;

const REMOTE_URL_KEYS: &[&str] = &["TASKTIMER_REMOTE_URL", "TIMER_REMOTE_URL"];
const API_KEY_KEYS: &[&str] = &["TASKTIMER_API_KEY", "TIMER_API_KEY"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 60,
            sweep_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationSettings {
    pub timeout_seconds: u64,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub confirmation: ConfirmationSettings,
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_seconds.max(1))
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: default_poll_interval_ms(),
            api_key: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            ENGINE_JSON,
            serde_json::json!({
                "schema": 1,
                "retry": {
                    "maxAttempts": 3,
                    "baseDelayMs": 1000,
                    "maxDelayMs": 30000,
                    "jitterMs": 1000
                },
                "cache": {
                    "ttlSeconds": 60,
                    "sweepIntervalSeconds": 30
                },
                "confirmation": {
                    "timeoutSeconds": 120
                }
            }),
        ),
        (
            REMOTE_JSON,
            serde_json::json!({
                "schema": 1,
                "baseUrl": null,
                "pollIntervalMs": 2000
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_engine_config(config_dir: &Path) -> Result<EngineConfig, InfraError> {
    let path = config_dir.join(ENGINE_JSON);
    let config: EngineConfig = serde_json::from_value(read_config(&path)?)?;
    if config.retry.max_attempts == 0 {
        return Err(InfraError::InvalidConfig(format!(
            "retry.maxAttempts must be >= 1 in {}",
            path.display()
        )));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(InfraError::InvalidConfig(format!(
            "retry.baseDelayMs must not exceed retry.maxDelayMs in {}",
            path.display()
        )));
    }
    Ok(config)
}

pub fn load_remote_config(config_dir: &Path) -> Result<RemoteConfig, InfraError> {
    load_remote_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

/// Reads `remote.json` and applies environment overrides resolved through `lookup`.
pub fn load_remote_config_with_lookup<F>(
    config_dir: &Path,
    lookup: F,
) -> Result<RemoteConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: RemoteConfig =
        serde_json::from_value(read_config(&config_dir.join(REMOTE_JSON))?)?;
    config.base_url = config
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);

    if let Some(url) = optional_lookup_value(&lookup, REMOTE_URL_KEYS) {
        config.base_url = Some(url);
    }
    config.api_key = optional_lookup_value(&lookup, API_KEY_KEYS);
    Ok(config)
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}
