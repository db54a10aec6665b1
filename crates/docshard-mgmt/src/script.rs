//! Admin command scripts.
//!
//! A script is either a JSON array of commands or one JSON command per line.
//! Blank lines and lines starting with `#` are skipped in the line form.
//! Shard key literals are JSON numbers and strings; `"$minKey"` and
//! `"$maxKey"` name the range sentinels.

use std::path::Path;

use docshard_meta::types::ShardKeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors from reading or parsing a script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// A line of a line-form script is not a valid command.
    #[error("line {line}: {source}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// An array-form script is not a valid command list.
    #[error("invalid script: {0}")]
    Invalid(#[from] serde_json::Error),

    /// A JSON literal that is not an integer or string.
    #[error("invalid shard key value {0}")]
    InvalidKey(Value),

    /// The script file could not be read.
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),
}

/// One admin command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum AdminCommand {
    /// Adds a shard to the inventory
    AddShard {
        /// Shard id
        id: String,
        /// Replica set connection string
        host: String,
    },
    /// Enables sharding on a database
    EnableSharding {
        /// Database name
        db: String,
    },
    /// Shards a collection on a single ascending key field
    ShardCollection {
        /// `db.coll`
        ns: String,
        /// Shard key field
        key: String,
    },
    /// Splits the chunk containing `middle` at `middle`
    Split {
        /// `db.coll`
        ns: String,
        /// Split point
        middle: Value,
    },
    /// Splits at several points, grouped per chunk
    SplitPoints {
        /// `db.coll`
        ns: String,
        /// Split points, any order
        points: Vec<Value>,
    },
    /// Moves the chunk containing `find` to shard `to`
    MoveChunk {
        /// `db.coll`
        ns: String,
        /// Any key inside the chunk
        find: Value,
        /// Recipient shard
        to: String,
    },
    /// Turns the balancer on
    BalancerStart,
    /// Turns the balancer off
    BalancerStop,
    /// Turns automatic splitting on
    EnableAutoSplit,
    /// Turns automatic splitting off
    DisableAutoSplit,
    /// Tags a shard with a zone
    AddShardToZone {
        /// Shard id
        shard: String,
        /// Zone name
        zone: String,
    },
    /// Removes a zone tag from a shard
    RemoveShardFromZone {
        /// Shard id
        shard: String,
        /// Zone name
        zone: String,
    },
    /// Pins `[min, max)` to `zone`, or unpins it when `zone` is absent
    UpdateZoneKeyRange {
        /// `db.coll`
        ns: String,
        /// Inclusive lower bound
        min: Value,
        /// Exclusive upper bound
        max: Value,
        /// Zone name
        zone: Option<String>,
    },
    /// Drops a sharded collection
    Drop {
        /// `db.coll`
        ns: String,
    },
    /// Writes documents with the given shard keys to whichever shard owns them
    Insert {
        /// `db.coll`
        ns: String,
        /// One document per key
        keys: Vec<Value>,
    },
    /// Runs one balancer round
    RunBalancer,
    /// Reports sharding status
    Status,
}

impl AdminCommand {
    /// Command name as written in scripts
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::AddShard { .. } => "addShard",
            AdminCommand::EnableSharding { .. } => "enableSharding",
            AdminCommand::ShardCollection { .. } => "shardCollection",
            AdminCommand::Split { .. } => "split",
            AdminCommand::SplitPoints { .. } => "splitPoints",
            AdminCommand::MoveChunk { .. } => "moveChunk",
            AdminCommand::BalancerStart => "balancerStart",
            AdminCommand::BalancerStop => "balancerStop",
            AdminCommand::EnableAutoSplit => "enableAutoSplit",
            AdminCommand::DisableAutoSplit => "disableAutoSplit",
            AdminCommand::AddShardToZone { .. } => "addShardToZone",
            AdminCommand::RemoveShardFromZone { .. } => "removeShardFromZone",
            AdminCommand::UpdateZoneKeyRange { .. } => "updateZoneKeyRange",
            AdminCommand::Drop { .. } => "drop",
            AdminCommand::Insert { .. } => "insert",
            AdminCommand::RunBalancer => "runBalancer",
            AdminCommand::Status => "status",
        }
    }
}

/// Converts a JSON literal into a shard key value.
pub fn parse_key(value: &Value) -> Result<ShardKeyValue, ScriptError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(ShardKeyValue::Int)
            .ok_or_else(|| ScriptError::InvalidKey(value.clone())),
        Value::String(s) => Ok(match s.as_str() {
            "$minKey" => ShardKeyValue::MinKey,
            "$maxKey" => ShardKeyValue::MaxKey,
            _ => ShardKeyValue::Str(s.clone()),
        }),
        _ => Err(ScriptError::InvalidKey(value.clone())),
    }
}

/// Parses a script in array or line form.
pub fn parse_script(contents: &str) -> Result<Vec<AdminCommand>, ScriptError> {
    if contents.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(contents)?);
    }
    let mut commands = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let command = serde_json::from_str(line).map_err(|source| ScriptError::Parse {
            line: i + 1,
            source,
        })?;
        commands.push(command);
    }
    Ok(commands)
}

/// Reads and parses a script file.
pub fn load_script(path: &Path) -> Result<Vec<AdminCommand>, ScriptError> {
    let contents = std::fs::read_to_string(path)?;
    parse_script(&contents)
}
