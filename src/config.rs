//! Layered configuration for the course generator.
//!
//! Reads `.coursegen/coursegen.toml` when present, then applies environment
//! overrides. CLI flags are applied last by the binary.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3150
//!
//! [database]
//! path = ".coursegen/coursegen.db"
//!
//! [worker]
//! concurrency = 4
//! job_timeout_secs = 200
//!
//! [ledger]
//! lookup_retries = 5
//! lookup_delay_ms = 200
//!
//! [provider]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! temperature = 0.7
//! request_timeout_secs = 120
//!
//! [limits]
//! max_modules = 2
//! max_lessons = 2
//! max_blocks = 10
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::logging::LoggingConfig;

pub const CONFIG_DIR: &str = ".coursegen";
pub const CONFIG_FILE: &str = "coursegen.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("coursegen.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Number of parallel stage workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Hard timeout per job; a timed-out job leaves its Task in progress
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_job_timeout_secs() -> u64 {
    200
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

/// Bounded retry window for the task read-after-write race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    #[serde(default = "default_lookup_retries")]
    pub lookup_retries: u32,
    #[serde(default = "default_lookup_delay_ms")]
    pub lookup_delay_ms: u64,
}

fn default_lookup_retries() -> u32 {
    5
}

fn default_lookup_delay_ms() -> u64 {
    200
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            lookup_retries: default_lookup_retries(),
            lookup_delay_ms: default_lookup_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Only ever read from `COURSEGEN_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            api_key: None,
        }
    }
}

/// Caps applied to every plan the provider returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,
    #[serde(default = "default_max_lessons")]
    pub max_lessons: usize,
    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,
}

fn default_max_modules() -> usize {
    2
}

fn default_max_lessons() -> usize {
    2
}

fn default_max_blocks() -> usize {
    10
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_modules: default_max_modules(),
            max_lessons: default_max_lessons(),
            max_blocks: default_max_blocks(),
        }
    }
}

/// The complete coursegen.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourseGenConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CourseGenConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse coursegen.toml")
    }

    /// Load `<project_dir>/.coursegen/coursegen.toml`, or defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `COURSEGEN_*` overrides. The lookup is injected so tests never
    /// touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("COURSEGEN_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(port) = lookup("COURSEGEN_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid COURSEGEN_PORT '{}'", port))?;
        }
        if let Some(workers) = lookup("COURSEGEN_WORKERS") {
            self.worker.concurrency = workers
                .parse()
                .with_context(|| format!("Invalid COURSEGEN_WORKERS '{}'", workers))?;
        }
        if let Some(url) = lookup("COURSEGEN_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = lookup("COURSEGEN_PROVIDER_MODEL") {
            self.provider.model = model;
        }
        if let Some(key) = lookup("COURSEGEN_API_KEY")
            && !key.trim().is_empty()
        {
            self.provider.api_key = Some(key);
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.worker.concurrency == 0 {
            warnings.push("worker.concurrency is 0; no jobs will run".to_string());
        }
        if self.ledger.lookup_retries == 0 {
            warnings.push("ledger.lookup_retries is 0; task lookups never retry".to_string());
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            warnings.push(format!(
                "provider.temperature {} is outside 0.0..=2.0",
                self.provider.temperature
            ));
        }
        if self.limits.max_modules == 0
            || self.limits.max_lessons == 0
            || self.limits.max_blocks == 0
        {
            warnings.push("limits must all be at least 1".to_string());
        }
        warnings
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize coursegen.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_empty() -> Result<()> {
        let config = CourseGenConfig::parse("")?;
        assert_eq!(config.server.port, 3150);
        assert_eq!(config.worker.job_timeout_secs, 200);
        assert_eq!(config.ledger.lookup_retries, 5);
        assert_eq!(config.ledger.lookup_delay_ms, 200);
        assert_eq!(config.limits.max_modules, 2);
        assert_eq!(config.limits.max_lessons, 2);
        assert_eq!(config.limits.max_blocks, 10);
        assert!(config.provider.api_key.is_none());
        assert!(config.validate().is_empty());
        Ok(())
    }

    #[test]
    fn test_partial_sections_keep_defaults() -> Result<()> {
        let config = CourseGenConfig::parse(
            r#"
[worker]
concurrency = 8

[limits]
max_blocks = 4
"#,
        )?;
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.job_timeout_secs, 200);
        assert_eq!(config.limits.max_blocks, 4);
        assert_eq!(config.limits.max_modules, 2);
        Ok(())
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let env: HashMap<&str, &str> = [
            ("COURSEGEN_DB_PATH", "/tmp/courses.db"),
            ("COURSEGEN_PORT", "8080"),
            ("COURSEGEN_WORKERS", "2"),
            ("COURSEGEN_PROVIDER_MODEL", "local-model"),
            ("COURSEGEN_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut config = CourseGenConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()))?;

        assert_eq!(config.database.path, PathBuf::from("/tmp/courses.db"));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.provider.model, "local-model");
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
        Ok(())
    }

    #[test]
    fn test_invalid_port_env_is_rejected() {
        let mut config = CourseGenConfig::default();
        let result = config.apply_env(|key| {
            (key == "COURSEGEN_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_api_key_never_serialized() -> Result<()> {
        let mut config = CourseGenConfig::default();
        config.provider.api_key = Some("sk-secret".to_string());
        let rendered = toml::to_string_pretty(&config)?;
        assert!(!rendered.contains("sk-secret"));
        Ok(())
    }

    #[test]
    fn test_load_or_default_reads_project_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR))?;
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            "[server]\nport = 4000\n",
        )?;
        let config = CourseGenConfig::load(&dir.path().join(CONFIG_DIR).join(CONFIG_FILE))?;
        assert_eq!(config.server.port, 4000);
        Ok(())
    }

    #[test]
    fn test_validate_flags_zero_limits() {
        let mut config = CourseGenConfig::default();
        config.limits.max_lessons = 0;
        config.worker.concurrency = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
    }
}
