//! nostr-cli - demonstration client for the Ndk host facade
//!
//! Connects to the configured relays, runs one cache-first fetch, and
//! (unless disabled) signs and publishes one note through the outbox.

mod config;

use clap::Parser;
use config::Config;
use nostr_core::{Filter, Secp256k1Crypto};
use nostr_engine::{LocalSigner, Ndk, NdkConfig, Signer, Strategy};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("nostr_cli=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("nostr-cli v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let crypto: Arc<dyn nostr_core::Crypto> = match &config.secret_key {
        Some(hex_key) => {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&hex::decode(hex_key)?);
            Arc::new(Secp256k1Crypto::from_secret_bytes(&bytes)?)
        }
        None => Arc::new(Secp256k1Crypto::generate()),
    };
    let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(crypto.clone(), None));
    info!(pubkey = %signer.public_key().to_hex(), "using identity");

    let ndk_config = NdkConfig {
        relays: config.relays.clone(),
        disk_cache_path: config.data_dir.clone(),
        ..NdkConfig::default()
    };
    let ndk = Ndk::new(ndk_config, Some(signer), Some(crypto)).await?;

    let shutdown = {
        let ndk = ndk.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            ndk.shutdown().await;
        })
    };

    let filter = Filter::new().kinds(config.fetch_kinds.clone()).limit(config.fetch_limit);
    let events = ndk.fetch(vec![filter], Strategy::CacheFirst, None).await?;
    info!(count = events.len(), "fetch complete");
    for event in &events {
        info!(id = %event.id.to_hex(), pubkey = %event.pubkey.to_hex(), "event");
    }

    if !config.no_publish {
        let record = ndk.sign_and_publish(1, config.publish_content.clone(), vec![], None).await?;
        info!(status = ?record.aggregate(), "publish submitted");
    }

    ndk.shutdown().await;
    shutdown.abort();
    Ok(())
}
