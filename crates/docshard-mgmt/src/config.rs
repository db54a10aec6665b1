//! Cluster description loaded by the CLI.

use std::collections::BTreeSet;
use std::path::Path;

use docshard_meta::auth::{ActionType, Resource};
use docshard_meta::config::CoordinatorConfig;
use serde::{Deserialize, Serialize};

/// One shard of the in-process cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    /// Shard id, e.g. `shard0000`
    pub id: String,
    /// Replica set connection string
    pub host: String,
    /// Zones the shard serves
    #[serde(default)]
    pub zones: Vec<String>,
}

/// A privilege granted to a user before the script runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantSpec {
    /// User name
    pub user: String,
    /// Database the user is defined in
    pub db: String,
    /// What the grant covers
    pub resource: Resource,
    /// Allowed actions
    pub actions: Vec<ActionType>,
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    /// Name this coordinator uses for the balancer lease
    pub instance: String,
    /// Members of the config replica set
    pub config_replicas: usize,
    /// Shards added at bootstrap
    pub shards: Vec<ShardSpec>,
    /// Privilege grants; when empty every command is allowed
    pub grants: Vec<GrantSpec>,
    /// Balancer, split, migration and retry tuning
    pub coordinator: CoordinatorConfig,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            instance: String::from("config-0"),
            config_replicas: 3,
            shards: vec![
                ShardSpec {
                    id: String::from("shard0000"),
                    host: String::from("rs0/localhost:27018"),
                    zones: Vec::new(),
                },
                ShardSpec {
                    id: String::from("shard0001"),
                    host: String::from("rs1/localhost:27019"),
                    zones: Vec::new(),
                },
            ],
            grants: Vec::new(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl MgmtConfig {
    /// Loads a `.toml` or `.json` config and validates it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MgmtConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks replica count, shard list and coordinator settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.coordinator.validate()?;
        if self.config_replicas == 0 {
            anyhow::bail!("config_replicas must be at least 1");
        }
        if self.shards.is_empty() {
            anyhow::bail!("at least one shard is required");
        }
        let mut seen = BTreeSet::new();
        for shard in &self.shards {
            if shard.id.is_empty() {
                anyhow::bail!("shard id must not be empty");
            }
            if !seen.insert(shard.id.as_str()) {
                anyhow::bail!("duplicate shard id: {}", shard.id);
            }
        }
        Ok(())
    }
}
