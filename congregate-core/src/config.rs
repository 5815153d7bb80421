//! Run configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.congregate/
//!   config.yaml     (this file: optional when the environment supplies secrets)
//!   cursors.json    (cursor store, owned by congregate-sync)
//! ```
//!
//! Secrets may come from the environment instead of the file:
//! `PCO_APP_ID`, `PCO_SECRET`, `FIBERY_HOST`, `FIBERY_SPACE`, `FIBERY_TOKEN`.
//! Environment values win over file values.
//!
//! The resolved [`SyncConfig`] is immutable for the duration of a run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fields::FieldMap;
use crate::types::Direction;

pub const DEFAULT_PCO_BASE_URL: &str = "https://api.planningcenteronline.com/people/v2";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Planning Center (Source A) connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcoConfig {
    pub base_url: String,
    pub app_id: String,
    pub secret: String,
    /// Page size for list endpoints.
    pub per_page: u32,
}

impl Default for PcoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PCO_BASE_URL.to_string(),
            app_id: String::new(),
            secret: String::new(),
            per_page: 100,
        }
    }
}

/// Fibery (Source B) connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FiberyConfig {
    /// Workspace host, e.g. `yourcompany.fibery.io`. A full `http(s)://` base is accepted.
    pub host: String,
    /// Space holding the People and Household databases.
    pub space: String,
    pub token: String,
    /// `q/limit` per query page.
    pub page_limit: u32,
}

impl Default for FiberyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            space: String::new(),
            token: String::new(),
            page_limit: 1000,
        }
    }
}

impl FiberyConfig {
    /// The command endpoint, `https://<host>/api/commands`.
    pub fn api_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/api/commands")
        } else {
            format!("https://{host}/api/commands")
        }
    }
}

/// Engine behaviour for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Guardrail: records processed per entity kind per run.
    pub max_per_run: usize,
    /// Whether Fibery edits are asserted back into PCO.
    pub reverse: Direction,
    /// Always refresh the fields added after the initial rollout.
    pub backfill_new_fields: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_per_run: 500,
            reverse: Direction::Disabled,
            backfill_new_fields: false,
        }
    }
}

/// Retry and timeout policy for every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Retry ceiling for 5xx and connection failures.
    pub retries: u32,
    /// Base of the exponential backoff, in milliseconds.
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 500,
            timeout_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub pco: PcoConfig,
    pub fibery: FiberyConfig,
    pub sync: RunConfig,
    pub transport: TransportConfig,
}

impl SyncConfig {
    /// Parse YAML text. `path` is only used for error context.
    pub fn from_yaml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay secrets from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("PCO_APP_ID") {
            self.pco.app_id = v;
        }
        if let Some(v) = get("PCO_SECRET") {
            self.pco.secret = v;
        }
        if let Some(v) = get("FIBERY_HOST") {
            self.fibery.host = v;
        }
        if let Some(v) = get("FIBERY_SPACE") {
            self.fibery.space = v;
        }
        if let Some(v) = get("FIBERY_TOKEN") {
            self.fibery.token = v;
        }
    }

    /// Reject configurations a run cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.pco.app_id, "pco.app_id", "PCO_APP_ID")?;
        require(&self.pco.secret, "pco.secret", "PCO_SECRET")?;
        require(&self.fibery.host, "fibery.host", "FIBERY_HOST")?;
        require(&self.fibery.space, "fibery.space", "FIBERY_SPACE")?;
        require(&self.fibery.token, "fibery.token", "FIBERY_TOKEN")?;

        if !self.pco.base_url.starts_with("http://") && !self.pco.base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid {
                key: "pco.base_url",
                reason: format!("'{}' is not an http(s) URL", self.pco.base_url),
            });
        }
        positive(self.pco.per_page as u64, "pco.per_page")?;
        positive(self.fibery.page_limit as u64, "fibery.page_limit")?;
        positive(self.sync.max_per_run as u64, "sync.max_per_run")?;
        positive(self.transport.timeout_secs, "transport.timeout_secs")?;

        self.field_map().map(|_| ())
    }

    /// The space-qualified field table for this configuration.
    pub fn field_map(&self) -> Result<FieldMap, ConfigError> {
        FieldMap::new(&self.fibery.space)
    }
}

fn require(value: &str, key: &'static str, env: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing { key, env });
    }
    Ok(())
}

fn positive(value: u64, key: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// `<home>/.congregate/`
pub fn congregate_dir_at(home: &Path) -> PathBuf {
    home.join(".congregate")
}

/// `<home>/.congregate/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    congregate_dir_at(home).join("config.yaml")
}

/// Load the default config under `home`, overlay the process environment, and validate.
///
/// A missing file is not an error: the environment may carry everything.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    load_at_with(home, process_env)
}

/// [`load_at`] with secrets looked up through `env` instead of the process environment.
pub fn load_at_with<F>(home: &Path, env: F) -> Result<SyncConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let path = config_path_at(home);
    let config = if path.exists() {
        read(&path)?
    } else {
        SyncConfig::default()
    };
    finish(config, env)
}

/// `load_at` convenience wrapper using `dirs::home_dir()`.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

/// Load an explicitly named config file. The file must exist.
pub fn load_from(path: &Path) -> Result<SyncConfig, ConfigError> {
    load_from_with(path, process_env)
}

/// [`load_from`] with secrets looked up through `env`.
pub fn load_from_with<F>(path: &Path, env: F) -> Result<SyncConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    finish(read(path)?, env)
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn finish<F>(mut config: SyncConfig, env: F) -> Result<SyncConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    config.apply_env(env);
    config.validate()?;
    Ok(config)
}

fn read(path: &Path) -> Result<SyncConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    SyncConfig::from_yaml_str(&contents, path)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
