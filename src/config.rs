//! Configuration module for Guideline Core.
//!
//! Loads configuration from YAML files and environment variables. Values are
//! read once at startup and treated as immutable for the process lifetime.

use std::collections::HashMap;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::domain::RuleDescriptor;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Content limits and rule execution bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum characters of normalized text.
    pub max_text_chars: usize,
    /// Maximum characters of the normalized prompt.
    pub max_prompt_chars: usize,
    /// Maximum raw image payload size in bytes.
    pub max_image_bytes: usize,
    /// Longest edge of the canonical image after downscaling.
    pub max_image_dimension: u32,
    /// Per-rule execution timeout.
    pub rule_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_text_chars: 20_000,
            max_prompt_chars: 4_000,
            max_image_bytes: 10 * 1024 * 1024,
            max_image_dimension: 1024,
            rule_timeout_ms: 5_000,
        }
    }
}

/// Verdict cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Time-to-live for cached verdicts.
    pub ttl_secs: u64,
    /// Maximum number of cached verdicts.
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            capacity: 10_000,
        }
    }
}

/// Audit recorder configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Upper bound on the synchronous first write attempt.
    pub write_timeout_ms: u64,
    /// Capacity of the retry queue.
    pub queue_capacity: usize,
    pub retry_max_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 250,
            queue_capacity: 1_024,
            retry_max_attempts: 6,
            retry_base_backoff_ms: 100,
            retry_max_backoff_ms: 5_000,
        }
    }
}

/// Rule registry refresh configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often active rule descriptors are reloaded from the store.
    pub refresh_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { refresh_secs: 60 }
    }
}

/// Guideline rules seeded at startup, plus threshold overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule descriptors published into the registry on startup.
    pub seed: Vec<RuleDescriptor>,
    /// Per-rule confidence thresholds, keyed by rule key.
    pub thresholds: HashMap<String, f64>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            seed: RuleDescriptor::defaults(),
            thresholds: HashMap::new(),
        }
    }
}

/// Classifier (Llama Guard via OpenRouter) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub openrouter_api_key: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openrouter_api_key: String::new(),
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (GUIDELINE__*)
    /// 2. config/local.yaml (if exists)
    /// 3. config/default.yaml
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("GUIDELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
