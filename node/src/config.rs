//! Node configuration.
//!
//! Sources are layered: built-in defaults, an optional TOML file, then
//! `LETSLIVE_*` environment variables (`__` separates nested keys, e.g.
//! `LETSLIVE_DHT__K=16`). The binary applies CLI overrides last.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ::config::{Config, Environment, File as ConfigFile};
use letslive_dag::DagConfig;
use letslive_p2p::{
    peer_info_from_p2p_addr, DhtConfig, ExchangeConfig, Keypair, Multiaddr, PeerInfo,
    MAX_BLOCK_LEN,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::NodeError;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "LETSLIVE";

/// File name of the node key inside the data directory.
pub const IDENTITY_FILE: &str = "identity.key";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Entry point of the network: listens and never dials out at startup.
    Bootstrap,
    #[default]
    Normal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = NodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(NodeError::Configuration(format!(
                "unknown log format '{other}', expected pretty or json"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Key file. Defaults to `<data_dir>/identity.key`; with neither set the
    /// node runs under a fresh identity.
    pub path: Option<PathBuf>,
    pub create_if_missing: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    pub k: usize,
    pub alpha: usize,
    pub max_rounds: usize,
    pub rpc_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub provider_ttl_secs: u64,
    pub republish_interval_secs: u64,
    pub max_providers: usize,
}

impl Default for DhtSettings {
    fn default() -> Self {
        let defaults = DhtConfig::default();
        Self {
            k: defaults.k,
            alpha: defaults.alpha,
            max_rounds: defaults.max_rounds,
            rpc_timeout_secs: defaults.rpc_timeout.as_secs(),
            refresh_interval_secs: defaults.refresh_interval.as_secs(),
            provider_ttl_secs: defaults.provider_ttl.as_secs(),
            republish_interval_secs: defaults.republish_interval.as_secs(),
            max_providers: defaults.max_providers,
        }
    }
}

impl DhtSettings {
    pub fn to_dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.k,
            alpha: self.alpha,
            max_rounds: self.max_rounds,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            provider_ttl: Duration::from_secs(self.provider_ttl_secs),
            republish_interval: Duration::from_secs(self.republish_interval_secs),
            max_providers: self.max_providers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub request_timeout_secs: u64,
    pub max_in_flight: usize,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        let defaults = ExchangeConfig::default();
        Self {
            request_timeout_secs: defaults.request_timeout.as_secs(),
            max_in_flight: defaults.max_in_flight,
        }
    }
}

impl ExchangeSettings {
    pub fn to_exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_in_flight: self.max_in_flight,
        }
    }
}

/// Dial policy towards the bootstrap node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub dial_timeout_secs: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            dial_timeout_secs: 10,
        }
    }
}

impl BootstrapSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Full node configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: Role,
    pub listen_addresses: Vec<String>,
    /// `/…/p2p/<PeerId>` address of the bootstrap node. Required for
    /// [`Role::Normal`].
    pub bootstrap_address: Option<String>,
    /// Directory of the persistent block store. Unset keeps blocks in memory.
    pub data_dir: Option<PathBuf>,
    pub identity: IdentityConfig,
    pub dag: DagConfig,
    pub dht: DhtSettings,
    pub exchange: ExchangeSettings,
    pub bootstrap: BootstrapSettings,
    /// Announce every block of an added file on the DHT.
    pub provide_on_add: bool,
    /// Extra provider lookups per block before giving up.
    pub fetch_retries: u32,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Normal,
            listen_addresses: vec!["/ip4/0.0.0.0/tcp/4001".to_string()],
            bootstrap_address: None,
            data_dir: None,
            identity: IdentityConfig::default(),
            dag: DagConfig::default(),
            dht: DhtSettings::default(),
            exchange: ExchangeSettings::default(),
            bootstrap: BootstrapSettings::default(),
            provide_on_add: true,
            fetch_retries: 3,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl NodeConfig {
    /// Load from `path` (must exist when given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        Self::load_with_env(path, None)
    }

    /// As [`NodeConfig::load`], reading environment overrides from `env`
    /// instead of the process environment when it is `Some`.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, NodeError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(NodeError::Configuration(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("listen_addresses")
                .source(env),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the node cannot start with.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.listen_addresses.is_empty() {
            return Err(NodeError::Configuration(
                "at least one listen address is required".to_string(),
            ));
        }
        self.listen_multiaddrs()?;

        match self.role {
            Role::Normal => {
                self.bootstrap_peer()?;
            }
            Role::Bootstrap => {
                if let Some(address) = &self.bootstrap_address {
                    info!(%address, "bootstrap role ignores bootstrap_address");
                }
            }
        }

        self.dag
            .validate()
            .and_then(|()| self.dag.check_block_limit(MAX_BLOCK_LEN))
            .map_err(|err| NodeError::Configuration(err.to_string()))?;

        let dht = &self.dht;
        if dht.k == 0 || dht.alpha == 0 || dht.max_rounds == 0 || dht.max_providers == 0 {
            return Err(NodeError::Configuration(
                "dht.k, dht.alpha, dht.max_rounds and dht.max_providers must be positive"
                    .to_string(),
            ));
        }
        if dht.alpha > dht.k {
            return Err(NodeError::Configuration(format!(
                "dht.alpha ({}) must not exceed dht.k ({})",
                dht.alpha, dht.k
            )));
        }
        if dht.rpc_timeout_secs == 0 || dht.refresh_interval_secs == 0 {
            return Err(NodeError::Configuration(
                "dht timeouts and intervals must be positive".to_string(),
            ));
        }
        if dht.republish_interval_secs == 0 || dht.republish_interval_secs >= dht.provider_ttl_secs
        {
            return Err(NodeError::Configuration(format!(
                "dht.republish_interval_secs ({}) must be positive and below dht.provider_ttl_secs ({})",
                dht.republish_interval_secs, dht.provider_ttl_secs
            )));
        }

        if self.exchange.max_in_flight == 0 || self.exchange.request_timeout_secs == 0 {
            return Err(NodeError::Configuration(
                "exchange.max_in_flight and exchange.request_timeout_secs must be positive"
                    .to_string(),
            ));
        }

        let bootstrap = &self.bootstrap;
        if bootstrap.max_attempts == 0 || bootstrap.dial_timeout_secs == 0 {
            return Err(NodeError::Configuration(
                "bootstrap.max_attempts and bootstrap.dial_timeout_secs must be positive"
                    .to_string(),
            ));
        }
        if bootstrap.initial_backoff_ms > bootstrap.max_backoff_ms {
            return Err(NodeError::Configuration(format!(
                "bootstrap.initial_backoff_ms ({}) exceeds bootstrap.max_backoff_ms ({})",
                bootstrap.initial_backoff_ms, bootstrap.max_backoff_ms
            )));
        }

        if self.log_level.trim().is_empty() {
            return Err(NodeError::Configuration(
                "log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.listen_addresses
            .iter()
            .map(|value| {
                value.trim().parse::<Multiaddr>().map_err(|err| {
                    NodeError::Configuration(format!("invalid listen address '{value}': {err}"))
                })
            })
            .collect()
    }

    /// The bootstrap node parsed from `bootstrap_address`.
    pub fn bootstrap_peer(&self) -> Result<PeerInfo, NodeError> {
        let raw = self
            .bootstrap_address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                NodeError::Configuration(
                    "a normal node requires bootstrap_address (or run with the bootstrap role)"
                        .to_string(),
                )
            })?;
        let address: Multiaddr = raw.parse().map_err(|err| {
            NodeError::Configuration(format!("invalid bootstrap address '{raw}': {err}"))
        })?;
        peer_info_from_p2p_addr(&address).map_err(|err| {
            NodeError::Configuration(format!("invalid bootstrap address '{raw}': {err}"))
        })
    }

    /// Where the node key lives, if anywhere.
    pub fn identity_path(&self) -> Option<PathBuf> {
        self.identity.path.clone().or_else(|| {
            self.data_dir
                .as_ref()
                .map(|data_dir| data_dir.join(IDENTITY_FILE))
        })
    }

    /// Load the node key, creating it when missing and allowed. `None` means
    /// no key file is configured and the host generates an ephemeral one.
    pub fn load_identity(&self) -> Result<Option<Keypair>, NodeError> {
        let Some(path) = self.identity_path() else {
            return Ok(None);
        };
        load_or_create_keypair(&path, self.identity.create_if_missing).map(Some)
    }
}

/// Default data directory of the binary: `<platform data dir>/letslive`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("letslive"))
}

/// Read a protobuf-encoded keypair from `path`, or write a new ed25519 one.
pub fn load_or_create_keypair(path: &Path, create_if_missing: bool) -> Result<Keypair, NodeError> {
    if path.exists() {
        let bytes = fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes).map_err(|err| {
            NodeError::Configuration(format!("invalid identity file {}: {err}", path.display()))
        })?;
        info!(path = %path.display(), peer_id = %keypair.public().to_peer_id(), "loaded node identity");
        return Ok(keypair);
    }

    if !create_if_missing {
        return Err(NodeError::Configuration(format!(
            "identity file {} does not exist and identity.create_if_missing is false",
            path.display()
        )));
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|err| NodeError::Configuration(format!("cannot encode identity: {err}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encoded)?;
    info!(path = %path.display(), peer_id = %keypair.public().to_peer_id(), "created node identity");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn boot_address() -> (String, letslive_p2p::PeerId) {
        let peer_id = Keypair::generate_ed25519().public().to_peer_id();
        (format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_id}"), peer_id)
    }

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_need_a_bootstrap_address() {
        let config = NodeConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config, NodeConfig::default());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
        assert!(err.to_string().contains("bootstrap_address"), "{err}");
    }

    #[test]
    fn bootstrap_role_validates_without_address() {
        let config = NodeConfig {
            role: Role::Bootstrap,
            ..NodeConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn file_values_and_env_overrides_layer() {
        let (boot, boot_id) = boot_address();
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
role = "normal"
bootstrap_address = "{boot}"
listen_addresses = ["/ip4/127.0.0.1/tcp/0"]
fetch_retries = 1

[dht]
k = 8
alpha = 2

[dag]
chunk_size = 1024
"#
        )
        .unwrap();

        let config = NodeConfig::load_with_env(
            Some(file.path()),
            env(&[
                ("LETSLIVE_DHT__K", "12"),
                ("LETSLIVE_LOG_FORMAT", "json"),
                ("LETSLIVE_PROVIDE_ON_ADD", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.role, Role::Normal);
        assert_eq!(config.dht.k, 12);
        assert_eq!(config.dht.alpha, 2);
        assert_eq!(config.dag.chunk_size, 1024);
        assert_eq!(config.dag.max_fanout, letslive_dag::DEFAULT_MAX_FANOUT);
        assert_eq!(config.fetch_retries, 1);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.provide_on_add);
        config.validate().unwrap();

        let peer = config.bootstrap_peer().unwrap();
        assert_eq!(peer.peer_id, boot_id);
        assert_eq!(peer.addrs.len(), 1);
    }

    fn fixture_config(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join(name)
    }

    #[test]
    fn shipped_configs_load() {
        let boot = NodeConfig::load_with_env(Some(&fixture_config("bootstrap.toml")), env(&[]))
            .unwrap();
        assert_eq!(boot.role, Role::Bootstrap);
        assert_eq!(boot.data_dir, Some(PathBuf::from("./data/bootstrap")));
        boot.validate().unwrap();

        let (address, _) = boot_address();
        let node = NodeConfig::load_with_env(
            Some(&fixture_config("node.toml")),
            env(&[("LETSLIVE_BOOTSTRAP_ADDRESS", address.as_str())]),
        )
        .unwrap();
        assert_eq!(node.role, Role::Normal);
        assert_eq!(node.dag, DagConfig::default());
        assert_eq!(node.bootstrap_address.as_deref(), Some(address.as_str()));
        node.validate().unwrap();
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = NodeConfig::load_with_env(Some(&dir.path().join("absent.toml")), env(&[]))
            .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[test]
    fn rejects_malformed_addresses() {
        let mut config = NodeConfig {
            bootstrap_address: Some("/ip4/127.0.0.1/tcp/4001".to_string()),
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NodeError::Configuration(_))
        ));

        config.bootstrap_address = Some("not-a-multiaddr".to_string());
        assert!(matches!(
            config.validate(),
            Err(NodeError::Configuration(_))
        ));

        config.bootstrap_address = Some(boot_address().0);
        config.listen_addresses = vec!["tcp://0.0.0.0:4001".to_string()];
        assert!(matches!(
            config.validate(),
            Err(NodeError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let base = NodeConfig {
            role: Role::Bootstrap,
            ..NodeConfig::default()
        };

        let mut config = base.clone();
        config.dht.alpha = config.dht.k + 1;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.dag.max_fanout = 1;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.bootstrap.initial_backoff_ms = 10_000;
        config.bootstrap.max_backoff_ms = 100;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.dht.republish_interval_secs = config.dht.provider_ttl_secs;
        assert!(config.validate().is_err());

        let mut config = base;
        config.exchange.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn blocks_must_fit_one_exchange_frame() {
        let base = NodeConfig {
            role: Role::Bootstrap,
            ..NodeConfig::default()
        };

        let mut config = base.clone();
        config.dag.chunk_size = MAX_BLOCK_LEN;
        config.validate().unwrap();

        config.dag.chunk_size = 4 * 1024 * 1024;
        let err = config.validate().unwrap_err();
        assert!(
            matches!(&err, NodeError::Configuration(msg) if msg.contains("chunk_size")),
            "{err}"
        );

        let mut config = base;
        config.dag.max_fanout = 100_000;
        let err = config.validate().unwrap_err();
        assert!(
            matches!(&err, NodeError::Configuration(msg) if msg.contains("max_fanout")),
            "{err}"
        );
    }

    #[test]
    fn identity_is_created_once_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..NodeConfig::default()
        };

        let first = config.load_identity().unwrap().unwrap();
        assert!(dir.path().join(IDENTITY_FILE).exists());
        let second = config.load_identity().unwrap().unwrap();
        assert_eq!(
            first.public().to_peer_id(),
            second.public().to_peer_id()
        );
    }

    #[test]
    fn missing_identity_without_create_fails() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig {
            identity: IdentityConfig {
                path: Some(dir.path().join("node.key")),
                create_if_missing: false,
            },
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.load_identity(),
            Err(NodeError::Configuration(_))
        ));
    }

    #[test]
    fn no_identity_path_means_ephemeral() {
        assert!(NodeConfig::default().load_identity().unwrap().is_none());
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
