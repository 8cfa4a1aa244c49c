//! Key generation command
//!
//! Prints a fresh Ed25519 secret key and the node id derived from it.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use weave_protocol::Identity;

/// Arguments for the keygen command
#[derive(Args, Debug, Default)]
pub struct KeygenArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the keygen command
pub fn execute_keygen_command(args: KeygenArgs) -> Result<()> {
    let identity = Identity::generate().context("Failed to generate key pair")?;
    println!("{}", render(&identity, args.json));
    Ok(())
}

fn render(identity: &Identity, as_json: bool) -> String {
    if as_json {
        json!({
            "node_id": identity.node_id(),
            "secret_key": identity.secret_hex(),
        })
        .to_string()
    } else {
        format!(
            "🔑 Node id:    {}\n🔒 Secret key: {}\n\nKeep the secret key private. Pass it with --secret-key or WEAVE_SECRET_KEY.",
            identity.node_id(),
            identity.secret_hex()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_output_round_trips_identity() {
        let identity = Identity::generate().unwrap();
        let output: serde_json::Value = serde_json::from_str(&render(&identity, true)).unwrap();

        let secret = output["secret_key"].as_str().unwrap();
        let restored = Identity::from_secret_hex(secret).unwrap();
        assert_eq!(restored.node_id(), output["node_id"].as_str().unwrap());
    }

    #[test]
    fn test_text_output_mentions_both_keys() {
        let identity = Identity::generate().unwrap();
        let text = render(&identity, false);
        assert!(text.contains(identity.node_id()));
        assert!(text.contains(&identity.secret_hex()));
    }
}
