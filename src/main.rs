//! Binary entry point for the sjcoin node.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;

use sjcoin::chain::Chain;
use sjcoin::config::{self, NodeConfig, CHAIN_FILE, PERSIST_INTERVAL, WALLET_FILE};
use sjcoin::miner::{self, MinerControl};
use sjcoin::network::Relay;
use sjcoin::wallet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cfg = NodeConfig::parse();

    let wallet = wallet::load_or_generate(WALLET_FILE).context("could not obtain a wallet")?;

    let chain = match Chain::load(CHAIN_FILE) {
        Ok(mut chain) => {
            chain.rebuild();
            log::info!("loaded chain at block {}", chain.head().id);
            chain
        }
        Err(e) => {
            log::warn!("could not load chain file: {}, starting fresh", e);
            Chain::new()
        }
    };

    let miner_control = Arc::new(MinerControl::new());
    let relay = Relay::new(chain, wallet, cfg.local, Arc::clone(&miner_control));

    if cfg.relay_enable {
        let bind_addr = format!("0.0.0.0:{}", cfg.relay_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("could not bind relay on {}", bind_addr))?;
        log::info!("relay listening on {}", bind_addr);
        tokio::spawn(Arc::clone(&relay).accept_loop(listener));
    }

    let peers = config::load_peer_file(&cfg.peer_file)
        .with_context(|| format!("could not load peer file {}", cfg.peer_file))?;
    if !peers.is_empty() {
        log::info!("dialing {} configured peers", peers.len());
        Arc::clone(&relay).dial_peers(peers);
    }

    if let Err(e) = relay.announce_self() {
        log::warn!("could not announce wallet: {}", e);
    }

    let persist_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PERSIST_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = persist_relay.persist_chain(CHAIN_FILE) {
                log::warn!("could not persist chain: {}", e);
            }
        }
    });

    let status_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tick.tick().await;
            let (floating_txs, floating_regs) = status_relay.floating_counts();
            log::info!(
                "head={} peers={} floating_txs={} floating_regs={}",
                status_relay.head_id(),
                status_relay.peer_count(),
                floating_txs,
                floating_regs
            );
        }
    });

    if cfg.miner_enable {
        tokio::spawn(miner::run(
            Arc::clone(&relay),
            Arc::clone(&miner_control),
            cfg.mining_threads,
        ));
    }

    log::info!("node running, press Ctrl+C to stop");
    signal::ctrl_c().await?;

    log::info!("shutdown signal received");
    miner_control.shutdown();
    relay.shutdown();
    if let Err(e) = relay.persist_chain(CHAIN_FILE) {
        log::warn!("final chain persist failed: {}", e);
    }
    Ok(())
}
