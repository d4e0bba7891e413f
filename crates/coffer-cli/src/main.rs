//! Coffer CLI - per-agent encrypted vault
//!
//! Usage:
//!   coffer init                  - Create the master key and vault metadata
//!   coffer status                - Show vault status
//!   coffer write <agent> <path>  - Encrypt and store a value
//!   coffer read <agent> <path>   - Decrypt and print a value
//!   coffer list [agent]          - List agents or an agent's files
//!   coffer rotate <agent>|--due  - Rotate agent keys

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use coffer_core::{VaultConfig, VaultService};
use coffer_crypto::KeychainProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coffer")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Per-agent envelope-encrypted vault", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Vault directory (overrides the config file)
    #[arg(long, global = true, env = "COFFER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Keychain service holding the master key
    #[arg(long, global = true, env = "COFFER_KEYCHAIN_SERVICE")]
    keychain_service: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the vault (master key in the system keychain)
    Init,

    /// Show vault status
    Status,

    /// Encrypt and store a value for an agent
    Write {
        agent: String,
        path: String,
        /// Value to store; read from stdin when omitted
        #[arg(long)]
        value: Option<String>,
    },

    /// Decrypt and print a stored value
    Read { agent: String, path: String },

    /// List agents, or the files of one agent
    List { agent: Option<String> },

    /// Rotate agent keys, re-encrypting their files
    Rotate {
        #[arg(required_unless_present = "due", conflicts_with = "due")]
        agent: Option<String>,
        /// Rotate every key older than keyRotationDays
        #[arg(long)]
        due: bool,
    },
}

impl Cli {
    fn vault_config(&self) -> anyhow::Result<VaultConfig> {
        let mut config = match &self.config {
            Some(path) => VaultConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => VaultConfig::default(),
        };
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(service) = &self.keychain_service {
            config.keychain_service = service.clone();
        }
        Ok(config)
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let vault = VaultService::new(cli.vault_config()?, Arc::new(KeychainProvider::new()));

    match cli.command {
        // Reads the directory only; never touches the keychain
        Commands::Status => print_json(&vault.status()?),
        command => {
            vault.start().context("starting vault")?;
            let result = run(&vault, command);
            vault.stop();
            result
        }
    }
}

fn run(vault: &VaultService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init | Commands::Status => {
            println!("Vault ready at {}", vault.layout().root().display());
            print_json(&vault.status()?)?;
        }

        Commands::Write { agent, path, value } => {
            let value = match value {
                Some(value) => value,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf).context("reading value from stdin")?;
                    buf
                }
            };
            vault.encrypt_and_store(&agent, &path, value)?;
            println!("Stored {} for {}", path, agent);
        }

        Commands::Read { agent, path } => match vault.decrypt_and_read_string(&agent, &path)? {
            Some(value) => println!("{}", value),
            None => bail!("{} not found for agent {}", path, agent),
        },

        Commands::List { agent: None } => {
            for agent in vault.list_agents()? {
                println!("{}", agent);
            }
        }

        Commands::List { agent: Some(agent) } => {
            for path in vault.list_files(&agent)? {
                println!("{}", path);
            }
        }

        Commands::Rotate { agent, due } => {
            let agents = if due { vault.keys_due_for_rotation()? } else { agent.into_iter().collect() };
            if agents.is_empty() {
                println!("No keys due for rotation");
            }
            for agent in agents {
                let report = vault.rotate_agent_key(&agent)?;
                println!(
                    "Rotated {}: {} re-encrypted, {} skipped",
                    report.agent_id, report.migrated, report.skipped
                );
            }
        }
    }

    Ok(())
}
