//! Typed publish/subscribe channel between the event sources and the auction
//! tasks.
//!
//! Every subscriber owns a bounded queue, so events reach one subscriber in
//! the order they were published and a slow subscriber cannot stall the
//! others for longer than the delivery timeout.

use crate::metrics::{BUS_DROPPED, BUS_EVENTS};
use futures::future::join_all;
use hsd_client::{ChainEntry, NameState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    ChainConnect {
        height: u64,
        hash: String,
        tree_root: String,
    },
    ChainDisconnect {
        height: u64,
        hash: String,
    },
    /// `entry` is the last block shared by the old and the new branch.
    ChainReorganize {
        entry: ChainEntry,
    },
    WalletAlert {
        wallet_id: String,
        name: String,
        state: NameState,
    },
    FundingConfirmed {
        address: String,
    },
    MempoolTx {
        txid: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::ChainConnect { .. } => "chain_connect",
            NotificationEvent::ChainDisconnect { .. } => "chain_disconnect",
            NotificationEvent::ChainReorganize { .. } => "chain_reorganize",
            NotificationEvent::WalletAlert { .. } => "wallet_alert",
            NotificationEvent::FundingConfirmed { .. } => "funding_confirmed",
            NotificationEvent::MempoolTx { .. } => "mempool_tx",
        }
    }

    /// First height replaced by a reorganization.
    pub fn reorg_height(&self) -> Option<u64> {
        match self {
            NotificationEvent::ChainReorganize { entry } => Some(entry.height + 1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// Connect, disconnect and reorganize events
    Chain,
    Funding {
        address: String,
    },
    Mempool,
    /// Alerts for one name of one wallet, plus every reorganization
    Auction {
        wallet_id: String,
        name: String,
    },
}

impl EventFilter {
    pub fn matches(&self, event: &NotificationEvent) -> bool {
        use NotificationEvent::*;
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::Chain, ChainConnect { .. })
            | (EventFilter::Chain, ChainDisconnect { .. })
            | (EventFilter::Chain, ChainReorganize { .. }) => true,
            (EventFilter::Funding { address }, FundingConfirmed { address: confirmed }) => {
                address == confirmed
            }
            (EventFilter::Mempool, MempoolTx { .. }) => true,
            (EventFilter::Auction { .. }, ChainReorganize { .. }) => true,
            (
                EventFilter::Auction { wallet_id, name },
                WalletAlert {
                    wallet_id: alert_wallet,
                    name: alert_name,
                    ..
                },
            ) => wallet_id == alert_wallet && name == alert_name,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of each subscriber queue
    pub queue_capacity: usize,
    /// How long `publish` waits on a full queue before dropping the event
    pub delivery_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

struct SubscriberSlot {
    filter: EventFilter,
    sender: mpsc::Sender<NotificationEvent>,
}

struct BusInner {
    config: BusConfig,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
}

impl BusInner {
    fn targets(&self, event: &NotificationEvent) -> Vec<mpsc::Sender<NotificationEvent>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.filter.matches(event))
            .map(|slot| slot.sender.clone())
            .collect()
    }
}

#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl NotificationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a queue. Events published after this call returns are
    /// delivered to it.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.config.queue_capacity);
        trace!("Subscriber {id} registered for {filter:?}");
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                SubscriberSlot { filter, sender },
            );
        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every matching subscriber, waiting up to the
    /// delivery timeout on full queues. Returns the number of queues reached.
    pub async fn publish(&self, event: NotificationEvent) -> usize {
        BUS_EVENTS.with_label_values(&[event.kind()]).inc();
        let targets = self.inner.targets(&event);
        let delivery_timeout = self.inner.config.delivery_timeout;

        let deliveries = targets.iter().map(|sender| {
            let event = event.clone();
            async move {
                match timeout(delivery_timeout, sender.send(event)).await {
                    Ok(Ok(())) => true,
                    // subscriber dropped between lookup and send
                    Ok(Err(_)) => {
                        BUS_DROPPED.with_label_values(&["closed"]).inc();
                        false
                    }
                    Err(_) => {
                        BUS_DROPPED.with_label_values(&["timeout"]).inc();
                        warn!("Dropped event after waiting {delivery_timeout:?} on a full queue");
                        false
                    }
                }
            }
        });
        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    /// Delivers `event` only to queues with free space. Used for
    /// level-triggered sources that emit the same event again on the next
    /// poll.
    pub fn publish_lossy(&self, event: NotificationEvent) -> usize {
        BUS_EVENTS.with_label_values(&[event.kind()]).inc();
        let mut delivered = 0;
        for sender in self.inner.targets(&event) {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    BUS_DROPPED.with_label_values(&["full"]).inc();
                    trace!("Queue full, skipping {}", event.kind());
                }
                Err(TrySendError::Closed(_)) => {
                    BUS_DROPPED.with_label_values(&["closed"]).inc();
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receiving end of a bus registration; unregisters itself on drop.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<NotificationEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NotificationEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            trace!("Subscriber {} released", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(name: &str, state: NameState) -> NotificationEvent {
        NotificationEvent::WalletAlert {
            wallet_id: "actor-0".to_string(),
            name: name.to_string(),
            state,
        }
    }

    fn reorg(height: u64) -> NotificationEvent {
        NotificationEvent::ChainReorganize {
            entry: ChainEntry {
                hash: format!("{height:064x}"),
                height,
                tree_root: String::new(),
                prev_block: None,
            },
        }
    }

    #[tokio::test]
    async fn test_auction_filter_receives_own_alerts_and_reorgs() {
        let bus = NotificationBus::default();
        let mut alpha = bus.subscribe(EventFilter::Auction {
            wallet_id: "actor-0".to_string(),
            name: "alpha".to_string(),
        });

        assert_eq!(bus.publish(alert("beta", NameState::Bidding)).await, 0);
        assert_eq!(bus.publish(alert("alpha", NameState::Bidding)).await, 1);
        assert_eq!(bus.publish(reorg(10)).await, 1);
        assert_eq!(
            bus.publish(NotificationEvent::MempoolTx { txid: "aa".into() })
                .await,
            0
        );

        assert_eq!(alpha.try_recv(), Some(alert("alpha", NameState::Bidding)));
        assert_eq!(alpha.try_recv().and_then(|e| e.reorg_height()), Some(11));
        assert_eq!(alpha.try_recv(), None);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = NotificationBus::default();
        let mut sub = bus.subscribe(EventFilter::Mempool);
        for i in 0..10 {
            bus.publish(NotificationEvent::MempoolTx {
                txid: i.to_string(),
            })
            .await;
        }
        for i in 0..10 {
            assert_eq!(
                sub.recv().await,
                Some(NotificationEvent::MempoolTx {
                    txid: i.to_string()
                })
            );
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = NotificationBus::default();
        let sub = bus.subscribe(EventFilter::All);
        let _other = bus.subscribe(EventFilter::Chain);
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_after_timeout() {
        let bus = NotificationBus::new(BusConfig {
            queue_capacity: 1,
            delivery_timeout: Duration::from_millis(100),
        });
        let mut slow = bus.subscribe(EventFilter::Mempool);
        let mut fast = bus.subscribe(EventFilter::Mempool);

        let first = NotificationEvent::MempoolTx { txid: "1".into() };
        let second = NotificationEvent::MempoolTx { txid: "2".into() };
        assert_eq!(bus.publish(first.clone()).await, 2);
        fast.try_recv();
        // `slow` still holds the first event, so only `fast` gets the second
        assert_eq!(bus.publish(second.clone()).await, 1);
        assert_eq!(fast.try_recv(), Some(second));
        assert_eq!(slow.try_recv(), Some(first));
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn test_lossy_publish_skips_full_queues() {
        let bus = NotificationBus::new(BusConfig {
            queue_capacity: 1,
            ..Default::default()
        });
        let mut sub = bus.subscribe(EventFilter::All);
        assert_eq!(bus.publish_lossy(alert("alpha", NameState::Opening)), 1);
        assert_eq!(bus.publish_lossy(alert("alpha", NameState::Opening)), 0);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_funding_filter_matches_address() {
        let bus = NotificationBus::default();
        let mut sub = bus.subscribe(EventFilter::Funding {
            address: "rs1qalpha".to_string(),
        });
        bus.publish(NotificationEvent::FundingConfirmed {
            address: "rs1qbeta".to_string(),
        })
        .await;
        bus.publish(NotificationEvent::FundingConfirmed {
            address: "rs1qalpha".to_string(),
        })
        .await;
        assert_eq!(
            sub.try_recv(),
            Some(NotificationEvent::FundingConfirmed {
                address: "rs1qalpha".to_string()
            })
        );
        assert_eq!(sub.try_recv(), None);
    }
}
