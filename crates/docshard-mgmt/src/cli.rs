//! Command-line interface.

use crate::cluster::Cluster;
use crate::config::MgmtConfig;
use crate::script::load_script;
use anyhow::Result;
use clap::{Parser, Subcommand};
use docshard_meta::auth::Principal;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// docshard-mgmt arguments.
#[derive(Parser)]
#[command(name = "docshard-mgmt")]
#[command(about = "docshard chunk metadata coordinator CLI", long_about = None)]
pub struct Cli {
    /// Cluster config file (.toml or .json); defaults are used when omitted
    #[arg(short, long, env = "DOCSHARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// User the commands run as
    #[arg(short, long, default_value = "admin")]
    pub user: String,

    /// Database the user is defined in
    #[arg(long, default_value = "admin")]
    pub user_db: String,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Boot an in-process cluster and run an admin command script against it
    Run {
        /// Script to run, JSON array or one command per line
        script: PathBuf,
        /// Print every reply and the final status as one JSON document
        #[arg(long)]
        json: bool,
        /// Keep the balancer loop running in the background while the script runs
        #[arg(long)]
        background_balancer: bool,
        /// Skip the sharding status printout at the end
        #[arg(long)]
        no_status: bool,
    },
    /// Validate a config file and print it with defaults filled in
    CheckConfig,
}

impl Cli {
    /// Executes the chosen subcommand.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Run {
                ref script,
                json,
                background_balancer,
                no_status,
            } => {
                self.run_script(&config, script, json, background_balancer, no_status)
                    .await
            }
            Command::CheckConfig => {
                config.validate()?;
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }

    fn load_config(&self) -> Result<MgmtConfig> {
        match &self.config {
            Some(path) => MgmtConfig::from_file(path),
            None => {
                tracing::debug!("no config file given, using defaults");
                Ok(MgmtConfig::default())
            }
        }
    }

    async fn run_script(
        &self,
        config: &MgmtConfig,
        script: &Path,
        json: bool,
        background_balancer: bool,
        no_status: bool,
    ) -> Result<()> {
        let commands = load_script(script)?;
        let cluster = Cluster::bootstrap(config).await?;
        let principal = Principal::new(self.user.clone(), self.user_db.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let balancer = background_balancer
            .then(|| cluster.admin().balancer().clone().spawn(shutdown_rx));

        let steps = cluster.run_script(&principal, commands).await;

        if let Some(handle) = balancer {
            shutdown_tx.send(true)?;
            handle.await?;
        }

        let failures = steps.iter().filter(|s| !s.reply.ok).count();
        let status = cluster.status(&principal);

        if json {
            let doc = serde_json::json!({
                "steps": steps,
                "status": status.as_ref().ok(),
                "failures": failures,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        } else {
            for step in &steps {
                println!("> {}", serde_json::to_string(&step.command)?);
                println!("{}", serde_json::to_string(&step.reply)?);
            }
            if !no_status {
                match &status {
                    Ok(status) => print!("{}", status),
                    Err(e) => println!("status unavailable: {}", e),
                }
            }
            println!("{} commands, {} failed", steps.len(), failures);
        }
        Ok(())
    }
}
