//! Configuration for nostr-cli.
//!
//! Grounded on `gossipd::config::Config`: a `clap::Parser` struct with
//! `env` fallbacks for secrets and a `validate` pass run after parsing.

use clap::Parser;
use std::path::PathBuf;

/// nostr-cli - fetch then publish against a set of relays
#[derive(Parser, Debug, Clone)]
#[command(name = "nostr-cli")]
#[command(about = "Demonstration client for the Ndk host facade")]
pub struct Config {
    /// Relay URLs to connect to (comma-separated)
    #[arg(short, long, value_delimiter = ',', default_value = "wss://relay.damus.io")]
    pub relays: Vec<String>,

    /// Data directory for the disk cache
    #[arg(short, long, default_value = "./data/nostr-cli")]
    pub data_dir: PathBuf,

    /// Hex-encoded secret key. Generates an ephemeral keypair if omitted.
    #[arg(long, env = "NOSTR_CLI_SECKEY")]
    pub secret_key: Option<String>,

    /// Kinds to fetch in the demonstration query (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "1")]
    pub fetch_kinds: Vec<u32>,

    /// Limit on the demonstration fetch
    #[arg(long, default_value = "20")]
    pub fetch_limit: usize,

    /// Content to sign and publish in the demonstration
    #[arg(long, default_value = "hello from nostr-cli")]
    pub publish_content: String,

    /// Skip the publish half of the demonstration
    #[arg(long)]
    pub no_publish: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.relays.is_empty() {
            anyhow::bail!("at least one relay is required");
        }
        if let Some(sk) = &self.secret_key {
            if hex::decode(sk).map(|b| b.len()) != Ok(32) {
                anyhow::bail!("secret-key must be 32 bytes of hex");
            }
        }
        Ok(())
    }
}
