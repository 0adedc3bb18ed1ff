//! Startup configuration.
//!
//! # Responsibility
//! - Parse the TOML configuration supplied at process start.
//! - Fail fast when required settings are absent or invalid.
//!
//! # Invariants
//! - `[remote] url` and `[sync_rules]` are required; their absence is a
//!   startup error, never a runtime one.
//! - Credentials embedded in the remote URL never reach logs.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_BATCH_SIZE: u32 = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration loading error. All variants are startup-fatal.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Missing(&'static str),
    Invalid { key: &'static str, message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Missing(key) => write!(f, "missing required config `{key}`"),
            Self::Invalid { key, message } => write!(f, "invalid config `{key}`: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Missing(_) | Self::Invalid { .. } => None,
        }
    }
}

/// Structured-table inclusion/exclusion policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncRules {
    /// Empty means every declared table.
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl SyncRules {
    /// Exclusion wins over inclusion.
    pub fn allows(&self, table: &str) -> bool {
        if self.exclude_tables.iter().any(|name| name == table) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.iter().any(|name| name == table)
    }
}

/// Remote replication endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
}

impl RemoteConfig {
    /// URL with any `user:password@` section masked.
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        let authority_end = rest.find('/').unwrap_or(rest.len());
        match rest[..authority_end].rfind('@') {
            Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
            None => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// `None` keeps the store in memory.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorConfig {
    pub debounce: Duration,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub batch_size: u32,
    pub poll_interval: Duration,
}

/// Fully validated application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub sync_rules: SyncRules,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub editor: EditorConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    remote: Option<RawRemote>,
    sync_rules: Option<SyncRules>,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    logging: RawLogging,
    #[serde(default)]
    editor: RawEditor,
    #[serde(default)]
    replication: RawReplication,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRemote {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorage {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLogging {
    level: Option<String>,
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEditor {
    debounce_ms: Option<u64>,
    history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReplication {
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    batch_size: Option<u32>,
    poll_interval_ms: Option<u64>,
}

impl AppConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let raw: RawConfig = toml::from_str(text).map_err(ConfigError::Parse)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> ConfigResult<Self> {
        let url = raw
            .remote
            .and_then(|remote| remote.url)
            .ok_or(ConfigError::Missing("remote.url"))?;
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(ConfigError::Missing("remote.url"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "remote.url",
                message: "expected an http:// or https:// URL".to_string(),
            });
        }

        let sync_rules = raw.sync_rules.ok_or(ConfigError::Missing("sync_rules"))?;

        let history_limit = raw.editor.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if history_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "editor.history_limit",
                message: "must be at least 1".to_string(),
            });
        }

        let backoff_base_ms = raw
            .replication
            .backoff_base_ms
            .unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        let backoff_max_ms = raw
            .replication
            .backoff_max_ms
            .unwrap_or(DEFAULT_BACKOFF_MAX_MS);
        if backoff_base_ms == 0 || backoff_max_ms < backoff_base_ms {
            return Err(ConfigError::Invalid {
                key: "replication.backoff_max_ms",
                message: format!(
                    "backoff must satisfy 0 < base ({backoff_base_ms}) <= max ({backoff_max_ms})"
                ),
            });
        }

        let batch_size = raw.replication.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "replication.batch_size",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            remote: RemoteConfig { url },
            sync_rules,
            storage: StorageConfig {
                db_path: raw.storage.db_path,
            },
            logging: LoggingConfig {
                level: raw.logging.level,
                dir: raw.logging.dir,
            },
            editor: EditorConfig {
                debounce: Duration::from_millis(
                    raw.editor.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
                ),
                history_limit,
            },
            replication: ReplicationConfig {
                backoff_base: Duration::from_millis(backoff_base_ms),
                backoff_max: Duration::from_millis(backoff_max_ms),
                batch_size,
                poll_interval: Duration::from_millis(
                    raw.replication
                        .poll_interval_ms
                        .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
        })
    }
}
