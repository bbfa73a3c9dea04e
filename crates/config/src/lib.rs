//! On-disk configuration for the orchestration layer: one TOML file, loaded
//! with per-section defaults so an empty or partial file is always valid.
//!
//! Same `#[serde(default)]` per-section struct layout and `load_from`/
//! `save_to` pair backed by `toml::from_str`/`toml::to_string_pretty`.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub binary_path: String,
    pub model_path: String,
    pub extra_args: Vec<String>,
    pub host: String,
    /// `0` means let the supervisor allocate an ephemeral port.
    pub port: u16,
    pub health_poll_interval_ms: u64,
    pub startup_timeout_secs: u64,
    pub max_restart_attempts: u32,
    /// Prefixes forwarded stdout/stderr lines.
    pub label: String,
    /// When true, the child's stdout/stderr are discarded instead of
    /// line-scanned and logged.
    pub quiet: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary_path: "llama-server".to_string(),
            model_path: String::new(),
            extra_args: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            health_poll_interval_ms: 500,
            startup_timeout_secs: 120,
            max_restart_attempts: 3,
            label: "inference".to_string(),
            quiet: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub supervisor: SupervisorConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // Embedding health wait defaults to 60s (vs 120s for inference),
            // and it isn't auto-restarted on crash (open question noted in
            // DESIGN.md).
            supervisor: SupervisorConfig {
                startup_timeout_secs: 60,
                label: "embedding".to_string(),
                max_restart_attempts: 0,
                ..SupervisorConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub ctx_size: usize,
    pub response_budget: usize,
    pub tools_budget: usize,
    pub chars_per_token: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ctx_size: 8192,
            response_budget: 1024,
            tools_budget: 512,
            chars_per_token: 3.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub data_dir: String,
    pub search_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/memory".to_string(),
            search_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "local".to_string(),
            max_iterations: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub supervisor: SupervisorConfig,
    pub embedding: EmbeddingConfig,
    pub context: ContextConfig,
    pub memory: MemoryConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Loads `path` if present, falling back to defaults for any section
    /// (or the whole file) it doesn't specify. `ORC_INFERENCE_BASE_URL` and
    /// `ORC_MODEL_PATH`, when set, override the corresponding config values
    /// so a deployment can point at a model without editing the file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(model_path) = env::var("ORC_MODEL_PATH") {
            if !model_path.is_empty() {
                config.supervisor.model_path = model_path;
            }
        }
        if let Ok(log_level) = env::var("ORC_LOG_LEVEL") {
            if !log_level.is_empty() {
                config.telemetry.log_level = log_level;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_context_budget() {
        let config = AppConfig::default();
        assert_eq!(config.context.ctx_size, 8192);
        assert!(config.context.response_budget < config.context.ctx_size);
    }

    #[test]
    fn embedding_health_wait_defaults_shorter_than_inference_and_does_not_auto_restart() {
        let config = AppConfig::default();
        assert_eq!(config.supervisor.startup_timeout_secs, 120);
        assert_eq!(config.embedding.supervisor.startup_timeout_secs, 60);
        assert_eq!(config.embedding.supervisor.max_restart_attempts, 0);
    }

    #[test]
    fn load_from_missing_path_returns_defaults() {
        let config = AppConfig::load_from("/nonexistent/config.toml").unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.supervisor.model_path = "models/model.gguf".to_string();
        config.server.port = 9090;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.supervisor.model_path, "models/model.gguf");
        assert_eq!(loaded.server.port, 9090);
    }

    #[test]
    fn partial_toml_file_falls_back_to_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nport = 1234\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.context.ctx_size, 8192);
    }
}
