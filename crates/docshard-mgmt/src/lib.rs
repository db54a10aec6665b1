#![warn(missing_docs)]

//! docshard management subsystem: admin CLI, cluster bootstrap, command scripts, sharding status

pub mod cli;
pub mod cluster;
pub mod config;
pub mod script;

pub use cluster::Cluster;
pub use config::MgmtConfig;
