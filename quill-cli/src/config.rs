//! CLI configuration.
//!
//! Loaded once from a TOML file under the user config directory and frozen
//! for the lifetime of the process; the engine receives an immutable
//! snapshot via [`Config::engine_config`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use quill_common::security::default_mask_patterns;
use quill_common::{Error, Result};

use crate::engine::EngineConfig;

/// Environment variable overriding the backend host.
pub const HOST_ENV: &str = "QUILL_HOST";

fn default_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

fn default_budget() -> usize {
    8192
}

fn default_keep_last_n() -> usize {
    6
}

fn default_true() -> bool {
    true
}

fn default_summary_prompt() -> String {
    EngineConfig::default().summary_prompt
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Quill configuration file schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend base URL
    #[serde(default = "default_host")]
    pub host: String,
    /// Model used for new sessions
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Token budget for material sent to the backend
    #[serde(default = "default_budget")]
    pub context_budget: usize,
    /// Most recent messages kept verbatim during summarization
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
    #[serde(default = "default_true")]
    pub autosummarize: bool,
    /// Distinct model for summarization (main model when unset)
    #[serde(default)]
    pub summary_model: Option<String>,
    #[serde(default = "default_summary_prompt")]
    pub summary_prompt: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Persist after every committed exchange
    #[serde(default = "default_true")]
    pub autosave: bool,
    /// Print the elapsed/tokens/rate line after each reply
    #[serde(default = "default_true")]
    pub show_metrics: bool,
    /// Encrypt persisted session records
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Mask sensitive text in persisted records
    #[serde(default)]
    pub mask_sensitive: bool,
    #[serde(default = "default_mask_patterns")]
    pub mask_patterns: Vec<String>,
    /// Session storage directory (defaults under the user data dir)
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            default_model: None,
            system_prompt: default_system_prompt(),
            context_budget: default_budget(),
            keep_last_n: default_keep_last_n(),
            autosummarize: true,
            summary_model: None,
            summary_prompt: default_summary_prompt(),
            temperature: None,
            request_timeout_secs: default_timeout_secs(),
            autosave: true,
            show_metrics: true,
            encryption_enabled: false,
            mask_sensitive: false,
            mask_patterns: default_mask_patterns(),
            sessions_dir: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location, falling back to
    /// defaults when no file exists. `QUILL_HOST` overrides the host.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            toml::from_str(&raw)
                .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?
        } else {
            Self::default()
        };

        if let Ok(host) = std::env::var(HOST_ENV) {
            if !host.trim().is_empty() {
                config.host = host;
            }
        }

        Ok(config)
    }

    /// Platform directories for config and data.
    pub fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("", "", "quill")
            .ok_or_else(|| Error::Config("cannot determine a home directory".into()))
    }

    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Resolved session storage directory.
    pub fn sessions_dir(&self) -> Result<PathBuf> {
        match &self.sessions_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("sessions")),
        }
    }

    /// Immutable engine options derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            system_prompt: self.system_prompt.clone(),
            budget: self.context_budget,
            keep_last_n: self.keep_last_n,
            autosummarize: self.autosummarize,
            summary_model: self.summary_model.clone(),
            summary_prompt: self.summary_prompt.clone(),
            temperature: self.temperature,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            autosave: self.autosave,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "http://localhost:11434");
        assert_eq!(config.context_budget, 8192);
        assert_eq!(config.keep_last_n, 6);
        assert!(config.autosummarize);
        assert!(!config.encryption_enabled);
        assert!(!config.mask_patterns.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            default_model = "llama3"
            context_budget = 4096
            encryption_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.default_model.as_deref(), Some("llama3"));
        assert_eq!(config.context_budget, 4096);
        assert!(config.encryption_enabled);
        // Untouched fields keep their defaults.
        assert_eq!(config.keep_last_n, 6);
        assert_eq!(config.host, "http://localhost:11434");
    }

    #[test]
    fn test_engine_config_mapping() {
        let config = Config {
            context_budget: 2048,
            summary_model: Some("phi3".into()),
            request_timeout_secs: 10,
            ..Config::default()
        };

        let engine = config.engine_config();
        assert_eq!(engine.budget, 2048);
        assert_eq!(engine.summary_model.as_deref(), Some("phi3"));
        assert_eq!(engine.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("nope.toml"))).unwrap();
        assert_eq!(config.context_budget, 8192);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "context_budget = \"many\"").unwrap();
        assert!(matches!(
            Config::load(Some(&path)).unwrap_err(),
            Error::Config(_)
        ));
    }
}
