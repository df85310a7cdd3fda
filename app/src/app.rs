use crate::actor::ActorRegistry;
use crate::auction::AuctionContext;
use crate::bus::NotificationBus;
use crate::chaos::{spawn_mempool_miner, AddressProvider, ChaosController, DelayedRelay, WalletAddresses};
use crate::config::{
    schedule_value_parser, AuctionConfig, ChaosSchedule, FundingConfig, OrchestratorConfig,
};
use crate::funding::{FundingArbiter, WalletFunder};
use crate::grinder::{ActiveNames, NameGrinder};
use crate::metrics;
use crate::orchestrator::AuctionOrchestrator;
use crate::sync_barrier::{SyncBarrier, DEFAULT_POLL_INTERVAL};
use crate::task::TaskHandle;
use crate::watcher::{start_watcher, ChainWatcher, FundingWatcher, MempoolWatcher, NameWatcher};
use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use hsd_client::{ChainService, NodeClient, WalletClient, WalletService, COIN, MAX_NAME_LENGTH};
use std::str::FromStr;
use std::time::Duration;
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Blocks the chain watcher remembers below the tip.
const CHAIN_MEMORY: usize = 64;

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "Name auctions under chain chaos", long_about = None)]
pub struct App {
    #[arg(long, env = "HSD_NODE_URL", default_value = "http://127.0.0.1:14037")]
    node_url: String,

    #[arg(long, env = "HSD_WALLET_URL", default_value = "http://127.0.0.1:14039")]
    wallet_url: String,

    #[arg(long, env = "HSD_API_KEY")]
    api_key: Option<String>,

    /// Nodes that receive mined blocks after a random delay
    #[arg(long = "peer-node-url", value_name = "URL")]
    peer_node_urls: Vec<String>,

    /// Names are ground locally on regtest only
    #[arg(long, env = "HSD_NETWORK", default_value = "regtest")]
    network: String,

    #[arg(long, default_value_t = 1)]
    actors: usize,

    #[arg(long, default_value = "default")]
    account: String,

    #[arg(long, default_value = "primary")]
    funder_wallet: String,

    #[arg(long, default_value_t = COIN)]
    funding_amount: u64,

    #[arg(long = "funding-timeout", value_name = "SECONDS", default_value_t = 60)]
    funding_timeout: u64,

    #[arg(long, default_value_t = COIN)]
    min_open_balance: u64,

    #[arg(long, default_value_t = COIN)]
    min_bid_balance: u64,

    #[arg(long, default_value_t = COIN)]
    min_reveal_balance: u64,

    #[arg(long = "auction-lifetime", value_name = "SECONDS", default_value_t = 1800)]
    auction_lifetime: u64,

    /// Period of OPEN retries for names that were never opened
    #[arg(long = "open-retry", value_name = "SECONDS", default_value_t = 30)]
    open_retry: u64,

    #[arg(long = "interval-min", value_name = "SECONDS", default_value_t = 3)]
    interval_min: u64,

    #[arg(long = "interval-max", value_name = "SECONDS", default_value_t = 20)]
    interval_max: u64,

    #[arg(long, default_value_t = 1)]
    name_length_min: usize,

    #[arg(long, default_value_t = MAX_NAME_LENGTH)]
    name_length_max: usize,

    /// Auctioned once at startup, in addition to the scheduled ones
    #[arg(long = "name", value_name = "NAME")]
    names: Vec<String>,

    #[arg(long, default_value_t = 64)]
    max_active_auctions: usize,

    /// Auctions start once the chain is above this height
    #[arg(long, default_value_t = 5)]
    sync_height: u64,

    #[arg(long, default_value_t = 0)]
    prefund_blocks: u32,

    #[arg(
        long = "chaos",
        value_name = "SCHEDULE_OR_PATH",
        value_parser = schedule_value_parser,
        default_value = "dev"
    )]
    chaos: ChaosSchedule,

    #[arg(long, default_value_t = false)]
    no_chaos: bool,

    #[arg(long, default_value_t = false)]
    mine_on_mempool: bool,

    #[arg(long = "poll-interval", value_name = "MILLIS", default_value_t = 1000)]
    poll_interval: u64,

    #[arg(long)]
    metrics_port: Option<u16>,

    #[arg(long, env = "FULL_LOG_CONTEXT", default_value_t = false)]
    full_log_context: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        let shutdown = CancellationToken::new();
        tokio_runtime.block_on(run_until_ctrl_c(self.execute(shutdown.clone()), shutdown))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!(
                "auctioneer={rust_log_level},hsd_client={rust_log_level},miner={rust_log_level}"
            );
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    fn configs(&self) -> Result<(FundingConfig, AuctionConfig, OrchestratorConfig)> {
        let funding = FundingConfig {
            funder_wallet: self.funder_wallet.clone(),
            amount: self.funding_amount,
            timeout: Duration::from_secs(self.funding_timeout),
        };
        funding.validate()?;

        let auction = AuctionConfig {
            min_open_balance: self.min_open_balance,
            min_bid_balance: self.min_bid_balance,
            min_reveal_balance: self.min_reveal_balance,
            max_lifetime: Duration::from_secs(self.auction_lifetime),
            open_retry: Duration::from_secs(self.open_retry),
        };
        auction.validate()?;

        let orchestrator = OrchestratorConfig {
            interval: Duration::from_secs(self.interval_min)
                ..=Duration::from_secs(self.interval_max),
            name_length: self.name_length_min..=self.name_length_max,
            prefund_blocks: self.prefund_blocks,
            local_grinder: self.network == "regtest",
            max_active_auctions: self.max_active_auctions,
            names: self.names.clone(),
            ..Default::default()
        };
        orchestrator.validate()?;

        Ok((funding, auction, orchestrator))
    }

    async fn execute(self, shutdown: CancellationToken) -> Result<()> {
        let (funding, auction, orchestrator_config) = self.configs()?;
        let poll = Duration::from_millis(self.poll_interval.max(1));

        let chain: Arc<dyn ChainService> =
            Arc::new(NodeClient::new(&self.node_url, self.api_key.clone())?);
        let wallet: Arc<dyn WalletService> =
            Arc::new(WalletClient::new(&self.wallet_url, self.api_key.as_deref()));
        let bus = NotificationBus::default();
        let mut handles = Vec::new();

        if let Some(port) = self.metrics_port {
            handles.push(TaskHandle::spawn("metrics", &shutdown, move |token| async move {
                if let Err(err) = metrics::start_server(port, token).await {
                    error!("{err}");
                }
            }));
        }

        let mut registry = ActorRegistry::new();
        for i in 0..self.actors {
            registry.register(
                format!("actor-{i}"),
                self.account.as_str(),
                chain.clone(),
                wallet.clone(),
            );
        }
        let registry = Arc::new(registry);

        // coinbases go to the funder so it can pay the actors
        let coinbase: Arc<dyn AddressProvider> = Arc::new(WalletAddresses::new(
            wallet.clone(),
            funding.funder_wallet.as_str(),
            "default",
        ));

        handles.push(start_watcher(
            ChainWatcher::new(chain.clone(), bus.clone(), CHAIN_MEMORY),
            poll,
            &shutdown,
        ));
        handles.push(start_watcher(
            FundingWatcher::new(registry.clone(), bus.clone()),
            poll,
            &shutdown,
        ));

        if self.mine_on_mempool {
            let miner_addresses: Arc<dyn AddressProvider> = match registry.get(0) {
                Some(actor) => Arc::new(WalletAddresses::new(
                    wallet.clone(),
                    actor.wallet_id.as_str(),
                    actor.account.as_str(),
                )) as Arc<dyn AddressProvider>,
                None => coinbase.clone(),
            };
            handles.push(start_watcher(
                MempoolWatcher::new(chain.clone(), bus.clone()),
                poll,
                &shutdown,
            ));
            handles.push(spawn_mempool_miner(
                chain.clone(),
                miner_addresses,
                &bus,
                &shutdown,
            ));
        }

        if !self.no_chaos {
            let mut controller =
                ChaosController::new(chain.clone(), coinbase.clone(), self.chaos.clone());
            if !self.peer_node_urls.is_empty() {
                let mut peers: Vec<Arc<dyn ChainService>> = Vec::new();
                for url in &self.peer_node_urls {
                    peers.push(Arc::new(NodeClient::new(url, self.api_key.clone())?));
                }
                info!("Relaying blocks to {} peers", peers.len());
                controller = controller.with_relay(Arc::new(DelayedRelay::new(
                    chain.clone(),
                    peers,
                    self.chaos.relay_delay(),
                    &shutdown,
                )));
            }
            handles.push(Arc::new(controller).start(&shutdown));
        }

        let barrier = SyncBarrier::spawn(
            chain.clone(),
            self.sync_height,
            DEFAULT_POLL_INTERVAL,
            &shutdown,
        );
        match barrier.wait().await {
            Ok(height) => info!("Starting auctions at height {height}"),
            Err(err) => {
                info!("{err}");
                stop_all(handles).await;
                return Ok(());
            }
        }

        let names = ActiveNames::default();
        handles.push(start_watcher(
            NameWatcher::new(registry.clone(), names.clone(), bus.clone()),
            poll,
            &shutdown,
        ));

        let funder = Arc::new(WalletFunder::new(
            wallet.clone(),
            funding.funder_wallet.as_str(),
            funding.amount,
        ));
        let ctx = Arc::new(AuctionContext {
            bus: bus.clone(),
            arbiter: Arc::new(FundingArbiter::new(bus, funder, funding.timeout)),
            grinder: NameGrinder::new(
                orchestrator_config.name_length.clone(),
                orchestrator_config.local_grinder,
                orchestrator_config.name_attempts,
            ),
            names,
            config: auction,
        });
        let orchestrator = Arc::new(AuctionOrchestrator::new(
            registry,
            ctx,
            orchestrator_config,
        ));
        handles.extend(orchestrator.start(&shutdown).await);

        shutdown.cancelled().await;
        stop_all(handles).await;
        Ok(())
    }
}

async fn stop_all(handles: Vec<TaskHandle>) {
    info!("Stopping {} tasks", handles.len());
    for handle in handles {
        handle.stop().await;
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Drives `fut` until it finishes or a signal arrives. On a signal
/// `shutdown` is cancelled and `fut` is awaited again so it can stop its
/// tasks.
async fn run_until_ctrl_c<F, E>(fut: F, shutdown: CancellationToken) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = &mut fut => return res,
    }

    shutdown.cancel();
    fut.await
}
