//! Configuration file for the kadlink CLI.

use kadlink_core::config::{DhtConfig, NodeConfig};
use kadlink_core::{Address, Keypair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// kadlink CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and listener
    pub node: NodeSection,
    /// Authentication
    pub auth: AuthSection,
    /// Discovery
    pub dht: DhtSection,
    /// Streams
    pub stream: StreamSection,
    /// Logging
    pub logging: LoggingSection,
}

/// Node identity and listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// 32-byte identity seed (hex). A fresh identity is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    /// Listen host
    pub host: String,
    /// Listen port (0 picks one)
    pub port: u16,
    /// Accept every PoR request without asking
    pub auto_accept: bool,
}

/// Authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Seconds allowed for both sides to decide
    pub timeout_secs: u64,
    /// Lifetime of our proof in seconds
    pub proof_validity_secs: u64,
    /// Owner seed (hex) signing our proof. The node signs its own proof when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_seed: Option<String>,
    /// Metadata sent with our proof
    pub metadata: HashMap<String, String>,
}

/// Discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    /// Serve and issue DHT requests
    pub enabled: bool,
    /// Bucket size
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Per-query timeout in seconds
    pub query_timeout_secs: u64,
    /// Bootstrap peer addresses
    pub bootstrap: Vec<String>,
    /// Dial lookup candidates we are not yet connected to
    pub dial_unknown_peers: bool,
}

/// Streams
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Live streams allowed per connection
    pub max_streams_per_connection: usize,
    /// Seconds to wait for a stream's data
    pub read_timeout_secs: u64,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level when `RUST_LOG` is unset
    pub level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            seed: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            auto_accept: true,
        }
    }
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            proof_validity_secs: 24 * 60 * 60,
            owner_seed: None,
            metadata: HashMap::new(),
        }
    }
}

impl Default for DhtSection {
    fn default() -> Self {
        let engine = DhtConfig::default();
        Self {
            enabled: engine.enabled,
            k: engine.k,
            alpha: engine.alpha,
            query_timeout_secs: 5,
            bootstrap: Vec::new(),
            dial_unknown_peers: false,
        }
    }
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            max_streams_per_connection: 256,
            read_timeout_secs: 30,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("kadlink/config.toml")
    }

    /// Load config from the default path, or the defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        if self.node.host.is_empty() {
            anyhow::bail!("Listen host must not be empty");
        }
        if let Some(seed) = &self.node.seed {
            parse_seed(seed, "node.seed")?;
        }
        self.to_node_config()?.validate()?;
        Ok(())
    }

    /// Identity from the configured seed, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is not 32 bytes of hex.
    pub fn keypair(&self) -> anyhow::Result<Option<Keypair>> {
        self.node
            .seed
            .as_deref()
            .map(|seed| Ok(Keypair::from_hex_seed(seed)?))
            .transpose()
    }

    /// Map onto the engine configuration
    ///
    /// # Errors
    ///
    /// Returns an error for malformed bootstrap addresses or owner seed.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::default();

        config.auth.timeout = Duration::from_secs(self.auth.timeout_secs);
        config.auth.proof_validity = Duration::from_secs(self.auth.proof_validity_secs);
        config.auth.metadata = self.auth.metadata.clone();
        if let Some(seed) = &self.auth.owner_seed {
            config.auth.owner_seed = Some(*parse_seed(seed, "auth.owner_seed")?);
        }

        config.dht.enabled = self.dht.enabled;
        config.dht.k = self.dht.k;
        config.dht.alpha = self.dht.alpha;
        config.dht.query_timeout = Duration::from_secs(self.dht.query_timeout_secs);
        config.dht.dial_unknown_peers = self.dht.dial_unknown_peers;
        config.dht.bootstrap_peers = self
            .dht
            .bootstrap
            .iter()
            .map(|addr| {
                Address::parse(addr)
                    .map_err(|e| anyhow::anyhow!("Bootstrap peer '{}': {}", addr, e))
            })
            .collect::<anyhow::Result<_>>()?;

        config.stream.max_streams_per_connection = self.stream.max_streams_per_connection;
        config.stream.default_read_timeout = Duration::from_secs(self.stream.read_timeout_secs);
        Ok(config)
    }
}

fn parse_seed(seed: &str, name: &str) -> anyhow::Result<Zeroizing<[u8; 32]>> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    hex::decode_to_slice(seed.trim(), &mut bytes[..])
        .map_err(|e| anyhow::anyhow!("{} must be 32 bytes of hex: {}", name, e))?;
    Ok(bytes)
}
