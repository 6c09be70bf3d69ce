// Swap Collector: Uniswap V2 Pair and Swap Ingestion
//
// This binary:
// 1. Discovers factory pairs that touch an allow-listed token
// 2. Backfills each new pair's swap history through a worker pool
// 3. Catches up and then follows the tip for all subscribed pairs
// 4. Stores trades with unit price, oracle prices and volume in PostgreSQL
//
// Architecture:
//   JSON-RPC -> Range Scanner -> Discovery / Extractor -> Job Queue -> Workers -> PostgreSQL

use std::sync::Arc;
use swap_collector::{Config, Pipeline, PgStore, RpcLedger};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("Network: {}", config.network);
    info!("Factory: {:#x}", config.contracts.factory);
    info!(
        "Allowed tokens: {}",
        config
            .contracts
            .allowed_tokens
            .iter()
            .map(|token| format!("{token:#x}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "Block range: {}, backfill range: {}, start block: {:?}",
        config.block_range, config.backfill_range, config.start_block
    );

    let ledger = Arc::new(RpcLedger::connect(&config.rpc_url)?);
    let store = Arc::new(PgStore::connect(&config.database_url).await?);

    let cancel = CancellationToken::new();
    let pipeline = Arc::new(Pipeline::new(config, ledger, store, cancel.clone()));
    tokio::spawn(handle_signals(pipeline.clone(), cancel));
    pipeline.run().await?;

    info!("Collector stopped");
    Ok(())
}

/// First SIGINT/SIGTERM stops the pipeline and lets running jobs finish,
/// a second one interrupts running backfills.
async fn handle_signals(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    shutdown_signal().await;
    info!("Shutdown requested, finishing in-flight work (signal again to interrupt backfills)");
    cancel.cancel();

    shutdown_signal().await;
    warn!("Second shutdown signal, interrupting running backfills");
    pipeline.abort_jobs();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
