use serde::Deserialize;
use thiserror::Error;

use std::path::Path;
use std::time::Duration;

use crate::blockchain::ChainSettings;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "ABBUCOIN_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Node configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory of the sled database
    pub data_dir: String,

    pub host: String,
    pub port: u16,

    /// Leading zero hex digits required in block hashes
    pub difficulty: usize,

    pub block_reward: u64,

    /// Period of the automatic mining tick
    pub mine_interval_secs: u64,

    pub session_ttl_secs: i64,

    /// Cap on one proof-of-work search, 0 disables it
    pub max_mining_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "data/ledger".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3000,
            difficulty: 2,
            block_reward: 50,
            mine_interval_secs: 60,
            session_ttl_secs: 3600,
            max_mining_secs: 30,
        }
    }
}

impl NodeConfig {
    /// Loads from `$ABBUCOIN_CONFIG`, or `config.toml`. A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // a SHA-256 hex digest has 64 digits
        if self.difficulty > 64 {
            return Err(ConfigError::Invalid(format!(
                "difficulty {} exceeds 64",
                self.difficulty
            )));
        }
        if self.block_reward == 0 {
            return Err(ConfigError::Invalid("block_reward must be positive".to_string()));
        }
        if self.mine_interval_secs == 0 {
            return Err(ConfigError::Invalid("mine_interval_secs must be positive".to_string()));
        }
        if self.session_ttl_secs <= 0 {
            return Err(ConfigError::Invalid("session_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            difficulty: self.difficulty,
            block_reward: self.block_reward,
            session_ttl_secs: self.session_ttl_secs,
            max_mining_time: match self.max_mining_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn mine_interval(&self) -> Duration {
        Duration::from_secs(self.mine_interval_secs)
    }
}
