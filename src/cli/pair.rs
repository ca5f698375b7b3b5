//! `pair` command.

use crate::config::Config;
use crate::pairing::{PairingEvent, PairingRequest};

/// Pair `number`, printing each event as a JSON line.
pub async fn run_pair_command(
    config: Config,
    number: String,
    keep_alive: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let orchestrator = super::build_orchestrator(&config, dry_run);
    let mut events = orchestrator.start(PairingRequest::new(number).keep_alive(keep_alive));

    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        match event {
            PairingEvent::Error { error } => anyhow::bail!("Pairing failed: {}", error),
            PairingEvent::Session { .. } if keep_alive => {
                eprintln!("Session linked and kept open. Press Ctrl-C to exit.");
                tokio::signal::ctrl_c().await?;
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}
