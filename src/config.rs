//! Node configuration.
//!
//! Mirrors the YAML surface in SPEC_FULL.md §D. Follows the same shape as
//! the router configuration this crate's component wiring is grounded on:
//! a plain data struct, named presets for common deployment shapes, a
//! fluent builder, and a `validate()` pass that enforces cross-field
//! invariants the type system can't express on its own.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Topology mode a node runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyMode {
    /// A coordinator-or-client role against an authoritative registry.
    Centralized,
    /// A gossip-based peer mesh with no authoritative node.
    Decentralized,
}

/// Encryption envelope requested for the duplex transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    /// Standard TLS.
    Tls,
    /// Noise protocol framework.
    Noise,
}

/// Network-level configuration (spec §6 `network.*` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Human-readable network name, echoed in `get_network_info`.
    pub name: String,
    /// Topology mode this node runs in.
    pub mode: TopologyMode,
    /// This node's id. Generated if absent at load time.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Bind host for the duplex transport listener.
    pub host: String,
    /// Bind port for the duplex transport listener.
    pub port: u16,
    /// Transport variant. Only `duplex` is implemented.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Seed peers to dial on startup in decentralized mode.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Whether the wire is carried over an encrypted channel.
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Which encryption envelope to use, if enabled.
    #[serde(default)]
    pub encryption_type: Option<EncryptionType>,
    /// Whether periodic discovery/gossip is enabled.
    #[serde(default)]
    pub discovery_enabled: bool,
    /// Gossip digest exchange interval, in seconds.
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Maximum simultaneous connections this node accepts.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-send deadline, in seconds.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Heartbeat emission interval, in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Retry attempts for outbound dial operations.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u8,
}

fn default_transport() -> String {
    "duplex".to_string()
}
fn default_discovery_interval_secs() -> u64 {
    5
}
fn default_max_connections() -> usize {
    500
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u8 {
    3
}

/// Configuration for one enabled mod (spec §6 `mods[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModSection {
    /// The mod's registration name.
    pub name: String,
    /// Whether this mod is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Mod-specific configuration, interpreted by that mod.
    #[serde(default)]
    pub config: serde_yaml::Value,
}

fn default_true() -> bool {
    true
}

/// Thread Messaging mod configuration, parsed out of a [`ModSection::config`]
/// value when `name == "thread_messaging"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessagingConfig {
    /// Channels created at startup regardless of auto-create.
    #[serde(default)]
    pub default_channels: Vec<String>,
    /// Maximum attachment size, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    /// Structural thread-depth cap. Validated to equal the fixed invariant.
    #[serde(default = "default_max_thread_depth")]
    pub max_thread_depth: u8,
    /// Per-channel history cap, in root messages.
    #[serde(default = "default_max_message_history")]
    pub max_message_history: usize,
    /// The reaction strings agents may apply.
    #[serde(default = "default_supported_reactions")]
    pub supported_reactions: Vec<String>,
    /// Whether a channel is created automatically on first message to an
    /// unknown channel name.
    #[serde(default = "default_true")]
    pub auto_create_channels: bool,
    /// Node-wide cap on total attachment bytes retained at once. Attachments
    /// have no automatic eviction (spec §3), so this is the only backstop
    /// against unbounded growth; an upload past this cap fails
    /// `quota_exhausted` rather than silently evicting older files.
    #[serde(default = "default_max_attachment_storage_bytes")]
    pub max_attachment_storage_bytes: u64,
}

fn default_max_file_size() -> usize {
    crate::domain_types::MAX_ENVELOPE_BYTES
}
fn default_max_attachment_storage_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_max_thread_depth() -> u8 {
    crate::domain_types::MAX_THREAD_DEPTH
}
fn default_max_message_history() -> usize {
    5000
}
fn default_supported_reactions() -> Vec<String> {
    vec!["like", "heart", "laugh", "sad", "angry", "thumbs_up", "thumbs_down"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ThreadMessagingConfig {
    fn default() -> Self {
        Self {
            default_channels: Vec::new(),
            max_file_size: default_max_file_size(),
            max_thread_depth: default_max_thread_depth(),
            max_message_history: default_max_message_history(),
            supported_reactions: default_supported_reactions(),
            auto_create_channels: true,
            max_attachment_storage_bytes: default_max_attachment_storage_bytes(),
        }
    }
}

/// Optional snapshot persistence configuration (spec §6 "Persisted state
/// layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSection {
    /// Whether periodic snapshotting is active. Default off, matching the
    /// spec's durability non-goal.
    #[serde(default)]
    pub enabled: bool,
    /// Path to the single snapshot file.
    #[serde(default = "default_snapshot_path")]
    pub path: String,
    /// Snapshot interval, in seconds.
    #[serde(default = "default_snapshot_interval_secs")]
    pub interval_secs: u64,
}

fn default_snapshot_path() -> String {
    "parley.snapshot.json".to_string()
}
fn default_snapshot_interval_secs() -> u64 {
    300
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_snapshot_path(),
            interval_secs: default_snapshot_interval_secs(),
        }
    }
}

/// Output format for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable text, suitable for a terminal.
    Text,
    /// Newline-delimited JSON, suitable for log aggregation.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    /// Log output format.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// `tracing-subscriber` env-filter directive string.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}
fn default_log_filter() -> String {
    "parley=info".to_string()
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_filter: default_log_filter(),
        }
    }
}

/// The full node configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `network.*` keys.
    pub network: NetworkSection,
    /// `mods[]` entries.
    #[serde(default)]
    pub mods: Vec<ModSection>,
    /// `snapshot.*` keys.
    #[serde(default)]
    pub snapshot: SnapshotSection,
    /// `observability.*` keys.
    #[serde(default)]
    pub observability: ObservabilitySection,
}

impl NetworkConfig {
    /// A configuration tuned for local development: small caps, verbose
    /// text logging, snapshotting off.
    #[must_use]
    pub fn development() -> Self {
        Self {
            network: NetworkSection {
                name: "dev-network".to_string(),
                mode: TopologyMode::Centralized,
                node_id: None,
                host: "127.0.0.1".to_string(),
                port: 7420,
                transport: default_transport(),
                bootstrap_nodes: Vec::new(),
                encryption_enabled: false,
                encryption_type: None,
                discovery_enabled: false,
                discovery_interval_secs: default_discovery_interval_secs(),
                max_connections: 50,
                connection_timeout_secs: default_connection_timeout_secs(),
                heartbeat_interval_secs: 5,
                retry_attempts: default_retry_attempts(),
            },
            mods: vec![default_thread_messaging_section()],
            snapshot: SnapshotSection::default(),
            observability: ObservabilitySection {
                log_format: LogFormat::Text,
                log_filter: "parley=debug".to_string(),
            },
        }
    }

    /// A configuration tuned for production: full resource caps, JSON
    /// logging, periodic snapshotting on.
    #[must_use]
    pub fn production() -> Self {
        Self {
            network: NetworkSection {
                name: "production".to_string(),
                mode: TopologyMode::Centralized,
                node_id: None,
                host: "0.0.0.0".to_string(),
                port: 7420,
                transport: default_transport(),
                bootstrap_nodes: Vec::new(),
                encryption_enabled: true,
                encryption_type: Some(EncryptionType::Tls),
                discovery_enabled: false,
                discovery_interval_secs: default_discovery_interval_secs(),
                max_connections: default_max_connections(),
                connection_timeout_secs: default_connection_timeout_secs(),
                heartbeat_interval_secs: default_heartbeat_interval_secs(),
                retry_attempts: default_retry_attempts(),
            },
            mods: vec![default_thread_messaging_section()],
            snapshot: SnapshotSection {
                enabled: true,
                ..SnapshotSection::default()
            },
            observability: ObservabilitySection {
                log_format: LogFormat::Json,
                log_filter: "parley=info".to_string(),
            },
        }
    }

    /// A configuration for automated tests: an ephemeral port (`0`), tiny
    /// caps, fast heartbeats, snapshotting off.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            network: NetworkSection {
                name: "test-network".to_string(),
                mode: TopologyMode::Centralized,
                node_id: Some("test-node".to_string()),
                host: "127.0.0.1".to_string(),
                port: 0,
                transport: default_transport(),
                bootstrap_nodes: Vec::new(),
                encryption_enabled: false,
                encryption_type: None,
                discovery_enabled: false,
                discovery_interval_secs: 1,
                max_connections: 16,
                connection_timeout_secs: 5,
                heartbeat_interval_secs: 1,
                retry_attempts: 1,
            },
            mods: vec![default_thread_messaging_section()],
            snapshot: SnapshotSection::default(),
            observability: ObservabilitySection {
                log_format: LogFormat::Text,
                log_filter: "parley=trace".to_string(),
            },
        }
    }

    /// Starts a fluent builder seeded from [`NetworkConfig::development`].
    #[must_use]
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder {
            config: Self::development(),
        }
    }

    /// Loads and validates a configuration document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails [`NetworkConfig::validate`].
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes this configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self).map_err(ConfigError::Parse)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// This node's configured heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.network.heartbeat_interval_secs)
    }

    /// The [`Duration`] past which a non-responding peer is reaped: twice
    /// the heartbeat interval, per spec §4.1.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    /// This node's configured discovery/gossip interval as a [`Duration`].
    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.network.discovery_interval_secs)
    }

    /// Finds this configuration's Thread Messaging settings, falling back
    /// to defaults if the mod is absent from `mods[]` (it is always
    /// implicitly enabled per SPEC_FULL §D).
    #[must_use]
    pub fn thread_messaging_config(&self) -> ThreadMessagingConfig {
        self.mods
            .iter()
            .find(|m| m.name == "thread_messaging" && m.enabled)
            .and_then(|m| serde_yaml::from_value(m.config.clone()).ok())
            .unwrap_or_default()
    }

    /// Validates cross-field invariants that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.name.trim().is_empty() {
            return Err(ConfigError::Invalid("network.name must not be empty".into()));
        }
        if self.network.mode == TopologyMode::Decentralized && self.network.bootstrap_nodes.is_empty()
        {
            return Err(ConfigError::Invalid(
                "decentralized mode requires at least one bootstrap node".into(),
            ));
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "network.max_connections must be at least 1".into(),
            ));
        }
        if self.network.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "network.heartbeat_interval must be at least 1 second".into(),
            ));
        }
        if self.network.encryption_enabled && self.network.encryption_type.is_none() {
            return Err(ConfigError::Invalid(
                "network.encryption_type is required when encryption_enabled is true".into(),
            ));
        }
        let thread_cfg = self.thread_messaging_config();
        if thread_cfg.max_thread_depth != crate::domain_types::MAX_THREAD_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "mods.thread_messaging.max_thread_depth is a structural invariant fixed at {}, not configurable",
                crate::domain_types::MAX_THREAD_DEPTH
            )));
        }
        if thread_cfg.max_file_size == 0 {
            return Err(ConfigError::Invalid(
                "mods.thread_messaging.max_file_size must be at least 1 byte".into(),
            ));
        }
        let has_enabled_mod = self.mods.iter().any(|m| m.enabled) || self.mods.is_empty();
        if !has_enabled_mod {
            return Err(ConfigError::Invalid(
                "at least one mod must be enabled (thread_messaging is implicit if mods is empty)"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn default_thread_messaging_section() -> ModSection {
    ModSection {
        name: "thread_messaging".to_string(),
        enabled: true,
        config: serde_yaml::to_value(ThreadMessagingConfig::default()).unwrap_or(serde_yaml::Value::Null),
    }
}

/// Fluent builder for [`NetworkConfig`], seeded from a preset and refined
/// field by field.
pub struct NetworkConfigBuilder {
    config: NetworkConfig,
}

impl NetworkConfigBuilder {
    /// Sets the network name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.network.name = name.into();
        self
    }

    /// Sets the topology mode.
    #[must_use]
    pub fn mode(mut self, mode: TopologyMode) -> Self {
        self.config.network.mode = mode;
        self
    }

    /// Sets the bind host and port.
    #[must_use]
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.network.host = host.into();
        self.config.network.port = port;
        self
    }

    /// Sets the bootstrap peer list (decentralized mode).
    #[must_use]
    pub fn bootstrap_nodes(mut self, nodes: Vec<String>) -> Self {
        self.config.network.bootstrap_nodes = nodes;
        self
    }

    /// Sets the maximum simultaneous connections.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.network.max_connections = max;
        self
    }

    /// Sets the heartbeat interval, in seconds.
    #[must_use]
    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.network.heartbeat_interval_secs = secs;
        self
    }

    /// Finishes the builder, validating the resulting configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the built configuration fails [`NetworkConfig::validate`].
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_preset_validates() {
        NetworkConfig::development().validate().unwrap();
    }

    #[test]
    fn production_preset_validates() {
        NetworkConfig::production().validate().unwrap();
    }

    #[test]
    fn testing_preset_validates() {
        NetworkConfig::testing().validate().unwrap();
    }

    #[test]
    fn decentralized_without_bootstrap_nodes_is_rejected() {
        let mut config = NetworkConfig::development();
        config.network.mode = TopologyMode::Decentralized;
        config.network.bootstrap_nodes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn thread_depth_cannot_be_raised_by_configuration() {
        let mut config = NetworkConfig::development();
        let mut thread_cfg = config.thread_messaging_config();
        thread_cfg.max_thread_depth = 9;
        config.mods[0].config = serde_yaml::to_value(thread_cfg).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_roundtrips_into_valid_config() {
        let config = NetworkConfig::builder()
            .name("test")
            .bind("127.0.0.1", 9000)
            .max_connections(10)
            .build()
            .unwrap();
        assert_eq!(config.network.name, "test");
        assert_eq!(config.network.port, 9000);
    }

    #[test]
    fn load_and_save_round_trip(){
        let dir = std::env::temp_dir();
        let path = dir.join(format!("parley-config-test-{}.yaml", std::process::id()));
        let config = NetworkConfig::testing();
        config.save_to_file(&path).unwrap();
        let loaded = NetworkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.network.name, config.network.name);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn heartbeat_timeout_is_double_the_interval() {
        let config = NetworkConfig::testing();
        assert_eq!(config.heartbeat_timeout(), config.heartbeat_interval() * 2);
    }
}
