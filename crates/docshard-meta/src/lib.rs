#![warn(missing_docs)]

//! docshard metadata subsystem: chunk maps, replicated config store, split planning, balancer, chunk migration

pub mod admin;
pub mod auth;
pub mod balancer;
pub mod chunk_map;
pub mod config;
pub mod config_store;
pub mod kvstore;
pub mod lease;
pub mod memory_shard;
pub mod migration;
pub mod replication;
pub mod retry;
pub mod router;
pub mod split;
pub mod status;
pub mod types;

pub use admin::{AdminService, CommandReply, ErrorReply};
pub use chunk_map::{Chunk, ChunkMap};
pub use config::CoordinatorConfig;
pub use config_store::ConfigStore;
pub use types::{
    ChunkRange, ChunkVersion, CollectionVersion, Epoch, ErrorKind, MetaError, Namespace,
    ShardId, ShardKeyPattern, ShardKeyValue,
};
