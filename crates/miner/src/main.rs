use auctioneer::chaos::{AddressProvider, ChaosController, WalletAddresses};
use auctioneer::config::{schedule_value_parser, ChaosSchedule};
use clap::Parser;
use hsd_client::{ChainService, NodeClient, WalletClient, WalletService};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::EnvFilter;

/// Mines and invalidates blocks on a node without running any auctions.
#[derive(Parser)]
pub struct Args {
    #[clap(long, env = "HSD_NODE_URL", default_value("http://127.0.0.1:14037"))]
    url: String,

    #[clap(long, env = "HSD_WALLET_URL", default_value("http://127.0.0.1:14039"))]
    wallet_url: String,

    #[clap(long, env = "HSD_API_KEY")]
    api_key: Option<String>,

    /// Wallet receiving the coinbase outputs
    #[clap(long, default_value("primary"))]
    wallet: String,

    #[clap(long, value_parser = schedule_value_parser, default_value("dev"))]
    chaos: ChaosSchedule,

    /// Stop after this many ticks
    #[clap(long)]
    ticks: Option<u64>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let chain: Arc<dyn ChainService> = Arc::new(NodeClient::new(&args.url, args.api_key.clone())?);
    let wallet: Arc<dyn WalletService> =
        Arc::new(WalletClient::new(&args.wallet_url, args.api_key.as_deref()));
    let addresses: Arc<dyn AddressProvider> =
        Arc::new(WalletAddresses::new(wallet, args.wallet.as_str(), "default"));
    let controller = ChaosController::new(chain, addresses, args.chaos.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c");
            }
            shutdown.cancel();
        }
    });

    let mut ticker = tokio::time::interval(args.chaos.mine_interval());
    let mut ticks = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = controller.tick().await;
        ticks += 1;
        info!(
            "Tick {ticks}: mined {} blocks, invalidated {:?}",
            report.mined.len(),
            report.invalidated.map(|entry| entry.height)
        );
        if args.ticks.is_some_and(|limit| ticks >= limit) {
            break;
        }
    }
    Ok(())
}
