//! Layered configuration for the review service.
//!
//! Settings are resolved once at startup, lowest precedence first:
//! built-in defaults, the TOML file, `DOCREVIEW_*` environment variables
//! (a `.env` file is loaded into the environment by `main`), then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! cors_permissive = false
//!
//! [database]
//! path = ".docreview/issues.db"
//!
//! [documents]
//! dir = "documents"
//!
//! [backend]
//! api_url = "https://api-inference.huggingface.co/models"
//! model_name = "microsoft/Phi-3-mini-4k-instruct"
//! max_new_tokens = 2048
//! temperature = 0.7
//! batch_size = 10
//! wait_for_model = true
//! request_timeout_secs = 30
//! # loading_timeout_secs = 600   # unset waits indefinitely for a loading model
//! consolidate = false
//! min_consolidator_score = 3
//!
//! [logging]
//! level = "info"
//! json = false
//! # dir = ".docreview/logs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default configuration file, read when present and no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "docreview.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub documents: DocumentSettings,
    pub backend: BackendSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Allow any origin (local UI development).
    pub cors_permissive: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".docreview/issues.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentSettings {
    pub dir: PathBuf,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("documents"),
        }
    }
}

/// Text-generation backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub api_url: String,
    pub model_name: String,
    pub api_token: Option<String>,
    pub max_new_tokens: u32,
    pub temperature: f64,
    /// Paragraphs sent per backend iteration.
    pub batch_size: usize,
    /// Ask the backend to hold the request while the model loads.
    pub wait_for_model: bool,
    pub request_timeout_secs: u64,
    /// Upper bound while waiting for a loading model. `None` waits indefinitely.
    pub loading_timeout_secs: Option<u64>,
    /// Run the consolidator pass over agent findings.
    pub consolidate: bool,
    pub min_consolidator_score: i64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api-inference.huggingface.co/models".to_string(),
            model_name: "microsoft/Phi-3-mini-4k-instruct".to_string(),
            api_token: None,
            max_new_tokens: 2048,
            temperature: 0.7,
            batch_size: 10,
            wait_for_model: true,
            request_timeout_secs: 30,
            loading_timeout_secs: None,
            consolidate: false,
            min_consolidator_score: 3,
        }
    }
}

impl BackendSettings {
    /// Timeout for one backend call. Waiting on a loading model uses the
    /// separate (possibly unbounded) loading timeout.
    pub fn call_timeout(&self) -> Option<Duration> {
        if self.wait_for_model {
            self.loading_timeout_secs.map(Duration::from_secs)
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }

    pub fn model_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            self.model_name.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// Directory for daily-rolling log files. Console only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl Settings {
    /// Resolve settings from the file (explicit path, or the default file if
    /// present) and the process environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML configuration")
    }

    /// Overlay `DOCREVIEW_*` variables obtained through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e))
        }

        if let Some(v) = lookup("DOCREVIEW_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("DOCREVIEW_PORT") {
            self.server.port = parsed("DOCREVIEW_PORT", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_CORS_PERMISSIVE") {
            self.server.cors_permissive = parsed("DOCREVIEW_CORS_PERMISSIVE", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DOCREVIEW_DOCUMENTS_DIR") {
            self.documents.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DOCREVIEW_HF_API_URL") {
            self.backend.api_url = v;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_MODEL_NAME") {
            self.backend.model_name = v;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_API_TOKEN") {
            self.backend.api_token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = lookup("DOCREVIEW_HF_MAX_NEW_TOKENS") {
            self.backend.max_new_tokens = parsed("DOCREVIEW_HF_MAX_NEW_TOKENS", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_TEMPERATURE") {
            self.backend.temperature = parsed("DOCREVIEW_HF_TEMPERATURE", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_BATCH_SIZE") {
            self.backend.batch_size = parsed("DOCREVIEW_HF_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_WAIT_FOR_MODEL") {
            self.backend.wait_for_model = parsed("DOCREVIEW_HF_WAIT_FOR_MODEL", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_REQUEST_TIMEOUT_SECS") {
            self.backend.request_timeout_secs = parsed("DOCREVIEW_HF_REQUEST_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_LOADING_TIMEOUT_SECS") {
            self.backend.loading_timeout_secs =
                Some(parsed("DOCREVIEW_HF_LOADING_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = lookup("DOCREVIEW_HF_CONSOLIDATE") {
            self.backend.consolidate = parsed("DOCREVIEW_HF_CONSOLIDATE", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_HF_MIN_CONSOLIDATOR_SCORE") {
            self.backend.min_consolidator_score =
                parsed("DOCREVIEW_HF_MIN_CONSOLIDATOR_SCORE", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("DOCREVIEW_LOG_JSON") {
            self.logging.json = parsed("DOCREVIEW_LOG_JSON", v)?;
        }
        if let Some(v) = lookup("DOCREVIEW_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let backend = &self.backend;
        if backend.batch_size == 0 {
            anyhow::bail!("backend.batch_size must be at least 1");
        }
        if !(0.0..=2.0).contains(&backend.temperature) {
            anyhow::bail!(
                "backend.temperature must be between 0.0 and 2.0, got {}",
                backend.temperature
            );
        }
        if backend.api_url.trim().is_empty() {
            anyhow::bail!("backend.api_url must not be empty");
        }
        if backend.model_name.trim().is_empty() {
            anyhow::bail!("backend.model_name must not be empty");
        }
        Ok(())
    }
}
