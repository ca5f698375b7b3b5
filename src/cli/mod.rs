//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the HTTP front door (`serve`, the default)
//! - Pairing a number from the terminal (`pair`)
//! - Checking a stored session id (`validate`)

mod pair;
mod serve;
mod validate;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::pairing::{CredentialStore, HttpCredentialBackend, PairingOrchestrator};
use crate::transport::scripted::ScriptedTransport;
use crate::transport::{BridgeTransport, MessagingTransport};

pub use pair::run_pair_command;
pub use serve::run_serve_command;
pub use validate::run_validate_command;

#[derive(Parser, Debug)]
#[command(name = "pairgate")]
#[command(about = "Links messaging accounts by pairing code and stores their session credentials")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Emit logs as JSON lines (also enabled by LOG_FORMAT=json)
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the HTTP pairing API (default if no subcommand given)
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Pair a phone number and print events as JSON lines
    Pair {
        /// Phone number with country code
        #[arg(short, long)]
        number: String,

        /// Restart on early disconnects and keep the linked session open
        #[arg(long)]
        keep_alive: bool,

        /// Use the in-process scripted transport instead of the bridge
        #[arg(long)]
        dry_run: bool,
    },

    /// Check that a stored session id can be fetched from the backend
    Validate {
        /// Session id as returned by pairing
        session_id: String,
    },
}

/// Run the selected command.
pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => run_serve_command(config, port).await,
        Command::Pair {
            number,
            keep_alive,
            dry_run,
        } => run_pair_command(config, number, keep_alive, dry_run).await,
        Command::Validate { session_id } => run_validate_command(config, session_id).await,
    }
}

/// Wire a store and orchestrator from configuration.
pub(crate) fn build_orchestrator(config: &Config, dry_run: bool) -> PairingOrchestrator {
    let transport: Arc<dyn MessagingTransport> = if dry_run {
        Arc::new(ScriptedTransport::new())
    } else {
        Arc::new(BridgeTransport::new(config.bridge.clone()))
    };
    let store = Arc::new(build_store(config));
    PairingOrchestrator::new(transport, store, config.pairing.clone())
}

pub(crate) fn build_store(config: &Config) -> CredentialStore {
    CredentialStore::new(
        config.pairing.sessions_root.clone(),
        Arc::new(HttpCredentialBackend::new(config.backend.clone())),
    )
}
