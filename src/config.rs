//! Configuration types for the sync server.

use crate::error::{Result, SyncError};
use crate::protocol::SnapshotKind;
use crate::store::AddCollisionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "TIMELINE_SYNC_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Durable storage settings.
    pub storage: StorageConfig,
    /// Routing and fan-out settings.
    pub sync: RouterConfig,
}

/// HTTP/WebSocket listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 3000,
        }
    }
}

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// JSON file on local disk.
    #[default]
    File,
    /// Single remote object addressed by URL.
    Http,
    /// Process memory only.
    Memory,
}

impl StorageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "http" | "blob" => Some(Self::Http),
            "memory" | "none" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    /// File backend path.
    pub path: PathBuf,
    /// Object URL for the `http` backend.
    pub url: Option<String>,
    /// Bearer token for the `http` backend.
    pub token: Option<String>,
    /// Request timeout for the `http` backend, in seconds.
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::File,
            path: PathBuf::from("./tasks.json"),
            url: None,
            token: None,
            timeout_secs: 10,
        }
    }
}

/// Router and fan-out behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Tag placed on snapshots fanned out after a mutation.
    pub broadcast_kind: SnapshotKind,
    /// What `add` does when the id already exists.
    pub add_collision: AddCollisionPolicy,
    /// Frames buffered per connection before it is dropped as too slow.
    pub outbound_capacity: usize,
    /// Requests buffered in front of the router task.
    pub request_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            broadcast_kind: SnapshotKind::Update,
            add_collision: AddCollisionPolicy::Merge,
            outbound_capacity: 256,
            request_capacity: 1024,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the effective configuration from the process environment.
    ///
    /// Reads the file named by `TIMELINE_SYNC_CONFIG` if set, then applies
    /// the individual environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error for an unreadable config file or an invalid override.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(Path::new(path.trim()))?,
            None => Self::default(),
        };
        config.apply_env_with(lookup)?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if a value cannot be parsed.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| SyncError::Config(format!("PORT is not a valid port: {port}")))?;
        }
        if let Some(kind) = get("TIMELINE_STORAGE") {
            self.storage.backend = StorageKind::parse(&kind).ok_or_else(|| {
                SyncError::Config(format!(
                    "TIMELINE_STORAGE must be file, http or memory, got {kind}"
                ))
            })?;
        }
        if let Some(path) = get("TIMELINE_DATA_FILE") {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(url) = get("TIMELINE_BLOB_URL") {
            self.storage.url = Some(url);
        }
        if let Some(token) = get("TIMELINE_BLOB_TOKEN") {
            self.storage.token = Some(token);
        }
        if let Some(kind) = get("TIMELINE_BROADCAST_KIND") {
            self.sync.broadcast_kind = SnapshotKind::parse_broadcast(&kind).ok_or_else(|| {
                SyncError::Config(format!(
                    "TIMELINE_BROADCAST_KIND must be update or sync, got {kind}"
                ))
            })?;
        }
        if let Some(policy) = get("TIMELINE_ADD_COLLISION") {
            self.sync.add_collision = AddCollisionPolicy::parse(&policy).ok_or_else(|| {
                SyncError::Config(format!(
                    "TIMELINE_ADD_COLLISION must be merge or overwrite, got {policy}"
                ))
            })?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.sync.broadcast_kind == SnapshotKind::Init {
            return Err(SyncError::Config(
                "sync.broadcast_kind cannot be `init`".to_owned(),
            ));
        }
        if self.sync.outbound_capacity == 0 || self.sync.request_capacity == 0 {
            return Err(SyncError::Config(
                "queue capacities must be greater than zero".to_owned(),
            ));
        }
        if self.storage.backend == StorageKind::Http && self.storage.url.is_none() {
            return Err(SyncError::Config(
                "http storage requires TIMELINE_BLOB_URL or `storage.url`".to_owned(),
            ));
        }
        Ok(())
    }

    /// `host:port` string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
