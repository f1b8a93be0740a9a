//! The configuration the core consumes.
//!
//! Loading flags and environment variables is the front-end collaborator's
//! job; the core reads a [`ServerConfig`], either from a TOML file or from
//! the cluster's `config` key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, PeerDesc};
use crate::security::kms::LocalKms;
use crate::security::{random_bytes, KeyType};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub cluster: ClusterConfig,
    pub database: DatabaseConfig,
    pub kms: KmsConfig,
    /// Address the transport listener binds to.
    pub addr: String,
    /// Whether joining a nonexistent room creates it.
    pub allow_room_creation: bool,
    /// Seconds between server pings.
    pub ping_interval_secs: u64,
}

impl ServerConfig {
    pub fn load_from_str(data: &str) -> Result<Self> {
        toml::from_str(data).map_err(|e| Error::Config(format!("config: {e}")))
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("config: {path}: {e}")))?;
        Self::load_from_str(&data)
    }

    /// Load the shared configuration blob published under the cluster's
    /// `config` key.
    pub async fn load_from_cluster(cluster: &Arc<dyn Cluster>) -> Result<Self> {
        let blob = cluster
            .get_value("config")
            .await?
            .ok_or_else(|| Error::Config("config: no config key in cluster".to_string()))?;
        Self::load_from_str(&blob)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    pub server_id: String,
    #[serde(skip)]
    pub era: String,
    #[serde(skip)]
    pub version: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_id: "singleton".to_string(),
            era: String::new(),
            version: String::new(),
        }
    }
}

impl ClusterConfig {
    /// This server's cluster identity. The era is drawn fresh at every
    /// process start, invalidating presence rows from earlier runs.
    pub fn describe_self(&self) -> PeerDesc {
        PeerDesc {
            id: self.server_id.clone(),
            era: if self.era.is_empty() {
                hex::encode(random_bytes(8))
            } else {
                self.era.clone()
            },
            version: if self.version.is_empty() {
                env!("CARGO_PKG_VERSION").to_string()
            } else {
                self.version.clone()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DatabaseConfig {
    /// Path of the relational store; `:memory:` keeps it in process.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KmsConfig {
    /// Path to a file containing the 256-bit local master key.
    pub key_file: Option<String>,
}

impl KmsConfig {
    pub fn get(&self) -> Result<LocalKms> {
        match &self.key_file {
            Some(path) => {
                let master_key = std::fs::read(path)
                    .map_err(|e| Error::Config(format!("kms: {path}: {e}")))?;
                if master_key.len() != KeyType::Aes256.key_size() {
                    return Err(Error::Config(format!(
                        "kms: key must be exactly {} bytes in size",
                        KeyType::Aes256.key_size()
                    )));
                }
                LocalKms::new(master_key)
            }
            None => Err(Error::NoMasterKey),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            database: DatabaseConfig::default(),
            kms: KmsConfig::default(),
            addr: "127.0.0.1:8080".to_string(),
            allow_room_creation: true,
            ping_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config = ServerConfig::load_from_str(
            r#"
            addr = "0.0.0.0:9000"

            [cluster]
            server-id = "s1"

            [database]
            path = "/tmp/parlor.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.cluster.server_id, "s1");
        assert_eq!(config.database.path, "/tmp/parlor.db");
        assert!(config.allow_room_creation);
        assert_eq!(config.ping_interval_secs, 30);
    }

    #[test]
    fn describe_self_draws_a_fresh_era() {
        let cluster = ClusterConfig {
            server_id: "s1".into(),
            era: String::new(),
            version: String::new(),
        };
        let a = cluster.describe_self();
        let b = cluster.describe_self();
        assert_eq!(a.id, "s1");
        assert_ne!(a.era, b.era);
    }
}
