//! Pollers that turn node and wallet state into bus events.

use crate::actor::ActorRegistry;
use crate::bus::{NotificationBus, NotificationEvent};
use crate::grinder::ActiveNames;
use crate::metrics::{CHAIN_HEIGHT, CHAIN_REORGS};
use crate::task::TaskHandle;
use async_trait::async_trait;
use hsd_client::{ChainEntry, ChainService, Error as ClientError};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[async_trait]
pub trait Watcher: Send + 'static {
    const NAME: &'static str;

    async fn poll(&mut self) -> Result<(), ClientError>;
}

/// Polls `watcher` every `period` until `cancel` fires.
pub fn start_watcher<W: Watcher>(
    watcher: W,
    period: Duration,
    cancel: &CancellationToken,
) -> TaskHandle {
    let watcher = Arc::new(Mutex::new(watcher));
    TaskHandle::repeating(W::NAME, cancel, period, move || {
        let watcher = watcher.clone();
        async move {
            if let Err(err) = watcher.lock().await.poll().await {
                warn!("{} poll failed: {err}", W::NAME);
            }
        }
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Follows the main chain and reports connects, disconnects and reorgs.
pub struct ChainWatcher {
    chain: Arc<dyn ChainService>,
    bus: NotificationBus,
    /// Entries remembered below the tip for fork detection
    depth: usize,
    recent: VecDeque<ChainEntry>,
}

impl ChainWatcher {
    pub fn new(chain: Arc<dyn ChainService>, bus: NotificationBus, depth: usize) -> Self {
        Self {
            chain,
            bus,
            depth: depth.max(1),
            recent: VecDeque::new(),
        }
    }

    pub fn tip(&self) -> Option<&ChainEntry> {
        self.recent.back()
    }

    /// Pops remembered entries that are no longer on the main chain,
    /// highest first.
    async fn unwind(&mut self, height: u64) -> Result<Vec<ChainEntry>, ClientError> {
        let mut disconnected = Vec::new();
        while let Some(last) = self.recent.back() {
            let (last_height, last_hash) = (last.height, last.hash.clone());
            let current = if last_height <= height {
                self.chain.get_entry_by_height(last_height).await?
            } else {
                None
            };
            if current.map_or(false, |entry| entry.hash == last_hash) {
                break;
            }
            if let Some(entry) = self.recent.pop_back() {
                disconnected.push(entry);
            }
        }
        Ok(disconnected)
    }

    async fn fork_point(&mut self, lowest: u64) -> Result<Option<ChainEntry>, ClientError> {
        if let Some(entry) = self.recent.back() {
            return Ok(Some(entry.clone()));
        }
        match lowest.checked_sub(1) {
            Some(height) => {
                let entry = self.chain.get_entry_by_height(height).await?;
                if let Some(entry) = &entry {
                    self.recent.push_back(entry.clone());
                }
                Ok(entry)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Watcher for ChainWatcher {
    const NAME: &'static str = "chain-watcher";

    async fn poll(&mut self) -> Result<(), ClientError> {
        let height = self.chain.get_height().await?;
        CHAIN_HEIGHT.set(height as i64);

        let disconnected = self.unwind(height).await?;
        if let Some(lowest) = disconnected.last().map(|entry| entry.height) {
            for entry in &disconnected {
                info!("disconnect {} ({}) at {}", entry.hash, entry.height, unix_now());
                self.bus
                    .publish(NotificationEvent::ChainDisconnect {
                        height: entry.height,
                        hash: entry.hash.clone(),
                    })
                    .await;
            }
            match self.fork_point(lowest).await? {
                Some(fork) => {
                    CHAIN_REORGS.inc();
                    warn!(
                        "Reorganized {} blocks above {} ({})",
                        disconnected.len(),
                        fork.height,
                        fork.hash
                    );
                    self.bus
                        .publish(NotificationEvent::ChainReorganize { entry: fork })
                        .await;
                }
                None => warn!("Reorganization below height {lowest} has no fork point"),
            }
        }

        // the first poll only announces the tip
        let start = self.recent.back().map_or(height, |tip| tip.height + 1);
        for next in start..=height {
            let Some(entry) = self.chain.get_entry_by_height(next).await? else {
                break;
            };
            info!("connect {} ({}) at {}", entry.hash, entry.height, unix_now());
            self.bus
                .publish(NotificationEvent::ChainConnect {
                    height: entry.height,
                    hash: entry.hash.clone(),
                    tree_root: entry.tree_root.clone(),
                })
                .await;
            self.recent.push_back(entry);
            while self.recent.len() > self.depth {
                self.recent.pop_front();
            }
        }
        Ok(())
    }
}

/// Reports the on-chain state of every active auction name. Alerts repeat on
/// every poll.
pub struct NameWatcher {
    registry: Arc<ActorRegistry>,
    names: ActiveNames,
    bus: NotificationBus,
}

impl NameWatcher {
    pub fn new(registry: Arc<ActorRegistry>, names: ActiveNames, bus: NotificationBus) -> Self {
        Self {
            registry,
            names,
            bus,
        }
    }
}

#[async_trait]
impl Watcher for NameWatcher {
    const NAME: &'static str = "name-watcher";

    async fn poll(&mut self) -> Result<(), ClientError> {
        for (name, actor_id) in self.names.snapshot() {
            let Some(actor) = self.registry.get(actor_id) else {
                continue;
            };
            match actor.chain.get_name_info(&name).await {
                Ok(Some(status)) => {
                    self.bus.publish_lossy(NotificationEvent::WalletAlert {
                        wallet_id: actor.wallet_id.clone(),
                        name,
                        state: status.state,
                    });
                }
                Ok(None) => trace!("No auction for {name} yet"),
                Err(err) => debug!(actor = actor_id, "Name lookup for {name} failed: {err}"),
            }
        }
        Ok(())
    }
}

/// Announces each newly confirmed coin of every actor wallet.
pub struct FundingWatcher {
    registry: Arc<ActorRegistry>,
    bus: NotificationBus,
    seen: HashSet<(String, u32)>,
}

impl FundingWatcher {
    pub fn new(registry: Arc<ActorRegistry>, bus: NotificationBus) -> Self {
        Self {
            registry,
            bus,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Watcher for FundingWatcher {
    const NAME: &'static str = "funding-watcher";

    async fn poll(&mut self) -> Result<(), ClientError> {
        let mut current = HashSet::new();
        let mut complete = true;
        for actor in self.registry.iter() {
            let coins = match actor.wallet.get_coins(&actor.wallet_id).await {
                Ok(coins) => coins,
                Err(err) => {
                    debug!(actor = actor.id, "Coin lookup failed: {err}");
                    complete = false;
                    continue;
                }
            };
            for coin in coins.into_iter().filter(|coin| coin.is_confirmed()) {
                let outpoint = (coin.hash, coin.index);
                if !self.seen.contains(&outpoint) {
                    debug!(actor = actor.id, "Confirmed {} to {}", coin.value, coin.address);
                    self.bus
                        .publish(NotificationEvent::FundingConfirmed {
                            address: coin.address,
                        })
                        .await;
                }
                current.insert(outpoint);
            }
        }
        // spent coins are forgotten, unless a wallet could not be read
        if complete {
            self.seen = current;
        } else {
            self.seen.extend(current);
        }
        Ok(())
    }
}

/// Announces transactions entering the mempool.
pub struct MempoolWatcher {
    chain: Arc<dyn ChainService>,
    bus: NotificationBus,
    seen: HashSet<String>,
}

impl MempoolWatcher {
    pub fn new(chain: Arc<dyn ChainService>, bus: NotificationBus) -> Self {
        Self {
            chain,
            bus,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Watcher for MempoolWatcher {
    const NAME: &'static str = "mempool-watcher";

    async fn poll(&mut self) -> Result<(), ClientError> {
        let mempool = self.chain.get_mempool().await?;
        for txid in &mempool {
            if !self.seen.contains(txid) {
                self.bus
                    .publish(NotificationEvent::MempoolTx { txid: txid.clone() })
                    .await;
            }
        }
        self.seen = mempool.into_iter().collect();
        Ok(())
    }
}
