//! hashgraphd - hashgraph consensus node
//!
//! Gossips events with the roster, orders them by virtual voting and logs
//! every decided round.

use anyhow::Context;
use clap::Parser;
use hashgraphd::config::{Config, RosterFile};
use hashgraph_net::TlsIdentity;
use hashgraphd::{Node, NodeOptions};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let level = if config.verbose { "hashgraphd=debug" } else { "hashgraphd=info" };
    let filter = match level.parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!(
        "hashgraphd v{} - hashgraph consensus node",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let platform = config.load_platform_config()?;
    let (roster, peers) = RosterFile::load(&config.roster)?.into_roster()?;
    let tls = TlsIdentity::load(&config.tls_cert, &config.tls_key)
        .with_context(|| format!("Failed to load TLS identity {}", config.tls_cert.display()))?;

    let node = Node::new(NodeOptions {
        node_id: config.node_id(),
        listen: config.listen,
        data_dir: config.data_dir.clone(),
        roster: Arc::new(roster),
        peers,
        key_seed: config.key_seed()?,
        tls,
        platform,
    })
    .context("Failed to initialize node")?;
    info!("Node {} public key {}", node.node_id(), hex::encode(node.public_key()));

    let shutdown = node.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown.send(());
        }
    });

    let mut rounds = node.subscribe_rounds();
    tokio::spawn(async move {
        loop {
            match rounds.recv().await {
                Ok(round) => info!(
                    "Consensus round {}: {} events, timestamp {}",
                    round.round,
                    round.events.len(),
                    round.consensus_timestamp()
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Round log skipped {} rounds", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    node.run().await?;
    Ok(())
}
