//! Resolution of endpoint, credentials and batching thresholds.
//!
//! Every value is resolved independently with the precedence
//! explicit builder value > environment variable > config file > built-in default.
//! The config file is TOML with an `[opik]` table:
//!
//! ```toml
//! [opik]
//! url_override = "http://localhost:5173/api"
//! workspace = "research"
//! batch_max_size = 50
//! flush_interval_ms = 500
//! backpressure = "block"
//! ```
//!
//! The file is `$HOME/.opik.toml`, or whatever `OPIK_CONFIG_PATH` names. The INI-style
//! `~/.opik.config` written by other Opik SDKs is not read. Its `[opik]` keys carry over
//! unchanged once string values are quoted.
//!
//! The environment is read through a lookup function so tests never touch process state.

use crate::config::{BackpressurePolicy, BatchingConfig, DEFAULT_FLUSH_TIMEOUT, DEFAULT_PROJECT_NAME};
use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_URL_OVERRIDE: &str = "OPIK_URL_OVERRIDE";
pub const ENV_API_KEY: &str = "OPIK_API_KEY";
pub const ENV_WORKSPACE: &str = "OPIK_WORKSPACE";
pub const ENV_PROJECT_NAME: &str = "OPIK_PROJECT_NAME";
pub const ENV_FLUSH_TIMEOUT: &str = "OPIK_DEFAULT_FLUSH_TIMEOUT";
pub const ENV_BATCH_MAX_SIZE: &str = "OPIK_BATCH_MAX_SIZE";
pub const ENV_FLUSH_INTERVAL_MS: &str = "OPIK_FLUSH_INTERVAL_MS";
pub const ENV_MAX_BUFFERED_EVENTS: &str = "OPIK_MAX_BUFFERED_EVENTS";
pub const ENV_MAX_RETRIES: &str = "OPIK_MAX_RETRIES";
pub const ENV_BACKPRESSURE: &str = "OPIK_BACKPRESSURE";
pub const ENV_CONFIG_PATH: &str = "OPIK_CONFIG_PATH";

pub const DEFAULT_URL: &str = "https://www.comet.com/opik/api";
pub const DEFAULT_WORKSPACE: &str = "default";
pub const DEFAULT_CONFIG_FILE: &str = ".opik.toml";

/// Fully resolved client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub url: String,
    pub api_key: Option<String>,
    pub workspace: String,
    pub project_name: String,
    /// Bound for `Client::end`.
    pub flush_timeout: Duration,
    pub batching: BatchingConfig,
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Resolve from the process environment and the default config file only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().resolve()
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct FileSettings {
    url_override: Option<String>,
    api_key: Option<String>,
    workspace: Option<String>,
    project_name: Option<String>,
    /// Seconds.
    default_flush_timeout: Option<u64>,
    batch_max_size: Option<usize>,
    flush_interval_ms: Option<u64>,
    max_buffered_events: Option<usize>,
    max_retries: Option<u32>,
    backpressure: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    opik: FileSettings,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Collects explicit values, then resolves the rest from the environment and config file.
#[derive(Clone, Default)]
pub struct SettingsBuilder {
    url: Option<String>,
    api_key: Option<String>,
    workspace: Option<String>,
    project_name: Option<String>,
    flush_timeout: Option<Duration>,
    max_batch_size: Option<usize>,
    flush_interval: Option<Duration>,
    max_buffered_events: Option<usize>,
    max_retries: Option<u32>,
    backpressure: Option<BackpressurePolicy>,
    config_path: Option<PathBuf>,
    base: Option<BatchingConfig>,
    env: Option<EnvLookup>,
}

impl fmt::Debug for SettingsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsBuilder")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("workspace", &self.workspace)
            .field("project_name", &self.project_name)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl SettingsBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn max_buffered_events(mut self, cap: usize) -> Self {
        self.max_buffered_events = Some(cap);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = Some(policy);
        self
    }

    /// Read this file instead of `$OPIK_CONFIG_PATH` or `~/.opik.toml`.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Starting point for batching fields that have no environment or file key
    /// (byte bound, timeouts, backoff), and the default layer for the rest.
    pub fn batching(mut self, base: BatchingConfig) -> Self {
        self.base = Some(base);
        self
    }

    /// Replace the process environment with `lookup`.
    pub fn env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Some(Arc::new(lookup));
        self
    }

    fn env_var(&self, name: &str) -> Option<String> {
        let value = match &self.env {
            Some(lookup) => lookup(name),
            None => std::env::var(name).ok(),
        };
        value.filter(|value| !value.trim().is_empty())
    }

    fn env_parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.env_var(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .map_err(|e| ConfigError::Env { name: name.to_string(), reason: e.to_string() })
            })
            .transpose()
    }

    fn load_file(&self) -> Result<FileSettings, ConfigError> {
        let (path, required) = if let Some(path) = &self.config_path {
            (path.clone(), true)
        } else if let Some(path) = self.env_var(ENV_CONFIG_PATH) {
            (PathBuf::from(path), true)
        } else if let Some(home) = self.env_var("HOME") {
            (Path::new(&home).join(DEFAULT_CONFIG_FILE), false)
        } else {
            return Ok(FileSettings::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let file: ConfigFile = toml::from_str(&text)?;
                tracing::debug!(path = %path.display(), "loaded config file");
                Ok(file.opik)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                Ok(FileSettings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let file = self.load_file()?;
        let base = self.base.clone().unwrap_or_default();

        let file_backpressure = file
            .backpressure
            .as_deref()
            .map(|s| s.parse::<BackpressurePolicy>().map_err(ConfigError::InvalidValue))
            .transpose()?;

        let batching = BatchingConfig {
            max_batch_size: pick(
                self.max_batch_size,
                self.env_parse(ENV_BATCH_MAX_SIZE)?,
                file.batch_max_size,
                base.max_batch_size,
            ),
            flush_interval: pick(
                self.flush_interval,
                self.env_parse::<u64>(ENV_FLUSH_INTERVAL_MS)?.map(Duration::from_millis),
                file.flush_interval_ms.map(Duration::from_millis),
                base.flush_interval,
            ),
            max_buffered_events: pick(
                self.max_buffered_events,
                self.env_parse(ENV_MAX_BUFFERED_EVENTS)?,
                file.max_buffered_events,
                base.max_buffered_events,
            ),
            max_retries: pick(
                self.max_retries,
                self.env_parse(ENV_MAX_RETRIES)?,
                file.max_retries,
                base.max_retries,
            ),
            backpressure: pick(
                self.backpressure,
                self.env_parse(ENV_BACKPRESSURE)?,
                file_backpressure,
                base.backpressure,
            ),
            ..base
        };
        batching.validate()?;

        Ok(Settings {
            url: pick(
                self.url.clone(),
                self.env_var(ENV_URL_OVERRIDE),
                file.url_override,
                DEFAULT_URL.to_string(),
            ),
            api_key: self.api_key.clone().or_else(|| self.env_var(ENV_API_KEY)).or(file.api_key),
            workspace: pick(
                self.workspace.clone(),
                self.env_var(ENV_WORKSPACE),
                file.workspace,
                DEFAULT_WORKSPACE.to_string(),
            ),
            project_name: pick(
                self.project_name.clone(),
                self.env_var(ENV_PROJECT_NAME),
                file.project_name,
                DEFAULT_PROJECT_NAME.to_string(),
            ),
            flush_timeout: pick(
                self.flush_timeout,
                self.env_parse::<u64>(ENV_FLUSH_TIMEOUT)?.map(Duration::from_secs),
                file.default_flush_timeout.map(Duration::from_secs),
                DEFAULT_FLUSH_TIMEOUT,
            ),
            batching,
        })
    }
}

fn pick<T>(explicit: Option<T>, env: Option<T>, file: Option<T>, default: T) -> T {
    explicit.or(env).or(file).unwrap_or(default)
}
