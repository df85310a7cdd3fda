//! Chain chaos: batch mining, forced rollbacks and delayed block relay.

use crate::bus::{EventFilter, NotificationBus, NotificationEvent};
use crate::config::ChaosSchedule;
use crate::metrics::{
    CHAOS_BLOCKS_MINED, CHAOS_INVALIDATIONS, CHAOS_MINING_ERRORS, RELAY_DELAY, RELAY_DELIVERIES,
};
use crate::task::TaskHandle;
use async_trait::async_trait;
use hsd_client::{ChainEntry, ChainService, Error as ClientError, WalletService};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Source of addresses that receive mined coinbases.
#[async_trait]
pub trait AddressProvider: Send + Sync {
    async fn next_address(&self) -> Result<String, ClientError>;
}

/// Fresh receive address of a wallet account on every call.
pub struct WalletAddresses {
    wallet: Arc<dyn WalletService>,
    wallet_id: String,
    account: String,
}

impl WalletAddresses {
    pub fn new(
        wallet: Arc<dyn WalletService>,
        wallet_id: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            wallet,
            wallet_id: wallet_id.into(),
            account: account.into(),
        }
    }
}

#[async_trait]
impl AddressProvider for WalletAddresses {
    async fn next_address(&self) -> Result<String, ClientError> {
        self.wallet
            .create_address(&self.wallet_id, &self.account)
            .await
    }
}

/// Height of the block a tick invalidates.
pub fn fork_point(height: u64, depth: u64) -> u64 {
    height.saturating_sub(depth)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub mined: Vec<String>,
    pub invalidated: Option<ChainEntry>,
}

pub struct ChaosController {
    chain: Arc<dyn ChainService>,
    addresses: Arc<dyn AddressProvider>,
    schedule: ChaosSchedule,
    relay: Option<Arc<DelayedRelay>>,
}

impl ChaosController {
    pub fn new(
        chain: Arc<dyn ChainService>,
        addresses: Arc<dyn AddressProvider>,
        schedule: ChaosSchedule,
    ) -> Self {
        Self {
            chain,
            addresses,
            schedule,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<DelayedRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Ticks every `mineInterval` until `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: &CancellationToken) -> TaskHandle {
        let period = self.schedule.mine_interval();
        info!(
            "Chaos every {period:?}: {} blocks, invalidating {} below the tip",
            self.schedule.mine_batch, self.schedule.fork_depth
        );
        TaskHandle::repeating("chaos", cancel, period, move || {
            let controller = self.clone();
            async move {
                controller.tick().await;
            }
        })
    }

    pub async fn tick(&self) -> TickReport {
        let mined = self.mine().await;
        if let Some(relay) = &self.relay {
            for hash in &mined {
                relay.announce(hash).await;
            }
        }
        let invalidated = self.invalidate().await;
        TickReport { mined, invalidated }
    }

    async fn mine(&self) -> Vec<String> {
        let address = match self.addresses.next_address().await {
            Ok(address) => address,
            Err(err) => {
                warn!("No mining address: {err}");
                return Vec::new();
            }
        };
        match self
            .chain
            .mine_blocks(self.schedule.mine_batch, &address)
            .await
        {
            Ok(hashes) => {
                CHAOS_BLOCKS_MINED.inc_by(hashes.len() as u64);
                debug!("Mined {} blocks to {address}", hashes.len());
                hashes
            }
            Err(err) if err.is_rejected_block() => {
                CHAOS_MINING_ERRORS.with_label_values(&["rejected"]).inc();
                trace!("Discarding mining noise: {err}");
                Vec::new()
            }
            Err(err) => {
                CHAOS_MINING_ERRORS.with_label_values(&["other"]).inc();
                warn!("Mining failed: {err}");
                Vec::new()
            }
        }
    }

    async fn invalidate(&self) -> Option<ChainEntry> {
        let height = match self.chain.get_height().await {
            Ok(height) => height,
            Err(err) => {
                warn!("Height lookup failed: {err}");
                return None;
            }
        };
        let fork_height = fork_point(height, self.schedule.fork_depth);
        if fork_height == 0 {
            CHAOS_INVALIDATIONS.with_label_values(&["skipped"]).inc();
            trace!("Fork point would be genesis at height {height}");
            return None;
        }
        let entry = match self.chain.get_entry_by_height(fork_height).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                CHAOS_INVALIDATIONS.with_label_values(&["skipped"]).inc();
                trace!("No entry at fork point {fork_height}");
                return None;
            }
            Err(err) => {
                CHAOS_INVALIDATIONS.with_label_values(&["skipped"]).inc();
                debug!("Fork point {fork_height} lookup failed: {err}");
                return None;
            }
        };
        match self.chain.invalidate_block(&entry.hash).await {
            Ok(()) => {
                CHAOS_INVALIDATIONS.with_label_values(&["invalidated"]).inc();
                info!("Invalidated {} at height {}", entry.hash, entry.height);
                Some(entry)
            }
            Err(err) if err.is_missing_entry() => {
                CHAOS_INVALIDATIONS.with_label_values(&["skipped"]).inc();
                trace!("Fork point vanished: {err}");
                None
            }
            Err(err) => {
                CHAOS_INVALIDATIONS.with_label_values(&["failed"]).inc();
                warn!("Invalidation of {} failed: {err}", entry.hash);
                None
            }
        }
    }
}

/// Hands mined blocks to peer nodes, each after its own random delay.
pub struct DelayedRelay {
    source: Arc<dyn ChainService>,
    peers: Vec<Arc<dyn ChainService>>,
    window: RangeInclusive<Duration>,
    token: CancellationToken,
}

impl DelayedRelay {
    pub fn new(
        source: Arc<dyn ChainService>,
        peers: Vec<Arc<dyn ChainService>>,
        window: RangeInclusive<Duration>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            source,
            peers,
            window,
            token: cancel.child_token(),
        }
    }

    pub fn draw_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let (min, max) = (
            self.window.start().as_millis() as u64,
            self.window.end().as_millis() as u64,
        );
        Duration::from_millis(rng.gen_range(min..=max))
    }

    /// Schedules delivery of `hash` to every peer. Returns the delays drawn.
    pub async fn announce(&self, hash: &str) -> Vec<Duration> {
        if self.peers.is_empty() {
            return Vec::new();
        }
        let raw = match self.source.get_raw_block(hash).await {
            Ok(raw) => Arc::new(raw),
            Err(err) => {
                RELAY_DELIVERIES.with_label_values(&["unavailable"]).inc();
                debug!("Cannot relay {hash}: {err}");
                return Vec::new();
            }
        };

        let mut delays = Vec::with_capacity(self.peers.len());
        for (index, peer) in self.peers.iter().enumerate() {
            let delay = self.draw_delay(&mut rand::thread_rng());
            delays.push(delay);
            RELAY_DELAY.observe(delay.as_secs_f64());

            let (peer, raw, token) = (peer.clone(), raw.clone(), self.token.clone());
            let hash = hash.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match peer.submit_block(&raw).await {
                    Ok(()) => {
                        RELAY_DELIVERIES.with_label_values(&["delivered"]).inc();
                        trace!("Relayed {hash} to peer {index} after {delay:?}");
                    }
                    Err(err) => {
                        RELAY_DELIVERIES.with_label_values(&["rejected"]).inc();
                        debug!("Peer {index} refused {hash}: {err}");
                    }
                }
            });
        }
        delays
    }
}

impl Drop for DelayedRelay {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Mines one block for every new mempool transaction.
pub fn spawn_mempool_miner(
    chain: Arc<dyn ChainService>,
    addresses: Arc<dyn AddressProvider>,
    bus: &NotificationBus,
    cancel: &CancellationToken,
) -> TaskHandle {
    let mut subscription = bus.subscribe(EventFilter::Mempool);
    TaskHandle::spawn("mempool-miner", cancel, move |token| async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = subscription.recv() => event,
            };
            let txid = match event {
                Some(NotificationEvent::MempoolTx { txid }) => txid,
                Some(_) => continue,
                None => break,
            };
            let address = match addresses.next_address().await {
                Ok(address) => address,
                Err(err) => {
                    warn!("No mining address: {err}");
                    continue;
                }
            };
            match chain.mine_blocks(1, &address).await {
                Ok(_) => debug!("Mined block for mempool tx {txid}"),
                Err(err) if err.is_rejected_block() => trace!("Discarding mining noise: {err}"),
                Err(err) => warn!("Mining for {txid} failed: {err}"),
            }
        }
    })
}
