//! `validate` command.

use serde_json::json;

use crate::config::Config;

/// Fetch `session_id` from the backend and report whether it is usable.
pub async fn run_validate_command(config: Config, session_id: String) -> anyhow::Result<()> {
    let store = super::build_store(&config);
    match store.download_bundle(&session_id).await {
        Ok(_) => {
            println!("{}", json!({ "valid": true }));
            Ok(())
        }
        Err(e) => {
            println!("{}", json!({ "valid": false, "error": e.to_string() }));
            anyhow::bail!("Session {} is not valid: {}", session_id, e)
        }
    }
}
