// Pipeline configuration
// Layered: built-in defaults, then an optional docflow.toml, then DOCFLOW__* env vars

//! # Configuration
//!
//! ```toml
//! [llm]
//! model = "google/gemini-2.0-flash-001"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [stages]
//! extraction_timeout_secs = 60
//! ```
//!
//! Every key can be overridden from the environment with double-underscore
//! nesting, e.g. `DOCFLOW__RETRY__MAX_ATTEMPTS=5`. The API key may also come
//! from `OPEN_ROUTER_API_KEY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::workflow::{EngineConfig, RetryPolicy};
use crate::{PipelineError, Result};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "docflow.toml";

/// Fallback environment variable for the text-understanding API key
pub const API_KEY_ENV: &str = "OPEN_ROUTER_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            model: "google/gemini-2.0-flash-001".to_string(),
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

/// Per-attempt wall-clock budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub extraction_timeout_secs: u64,
    pub persistence_timeout_secs: u64,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            extraction_timeout_secs: 60,
            persistence_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for JSON run files; runs stay in memory when unset
    pub runs_dir: Option<PathBuf>,
    /// JSON snapshot of Document Records; records stay in memory when unset
    pub documents_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub stages: StagesConfig,
    pub fetch: FetchConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

impl PipelineConfig {
    /// Load configuration from `path` (or `docflow.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut loaded: PipelineConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("DOCFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        loaded.apply_api_key_fallback(std::env::var(API_KEY_ENV).ok());
        Ok(loaded)
    }

    /// Use `fallback` as the API key unless one is configured already
    pub fn apply_api_key_fallback(&mut self, fallback: Option<String>) {
        if self.llm.api_key.as_deref().map_or(true, str::is_empty) {
            self.llm.api_key = fallback.filter(|key| !key.is_empty());
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::from(&self.retry),
            extraction_timeout: Duration::from_secs(self.stages.extraction_timeout_secs),
            persistence_timeout: Duration::from_secs(self.stages.persistence_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch.timeout_secs),
        }
    }
}
