//! Per-name auction state machine.
//!
//! Each auction runs as its own task and consumes one bus subscription
//! filtered to its name, so handling for one auction is serialized while
//! separate auctions proceed independently.

use crate::actor::{Actor, ActorId};
use crate::bus::{EventFilter, NotificationBus, NotificationEvent, Subscription};
use crate::config::AuctionConfig;
use crate::error::AuctionError;
use crate::funding::FundingArbiter;
use crate::grinder::{ActiveNames, NameGrinder, NameLease};
use crate::metrics::{
    AUCTIONS_ACTIVE, AUCTIONS_COMPLETED, AUCTIONS_STARTED, AUCTION_ROLLBACKS, AUCTION_TRANSITIONS,
};
use hsd_client::{ChainEntry, NameState, Transition};
use std::fmt;
use std::sync::Arc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuctionState {
    Requested,
    Open,
    Bid,
    Reveal,
    Finalized,
    Failed,
}

impl AuctionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuctionState::Finalized | AuctionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuctionState::Requested => "requested",
            AuctionState::Open => "open",
            AuctionState::Bid => "bid",
            AuctionState::Reveal => "reveal",
            AuctionState::Finalized => "finalized",
            AuctionState::Failed => "failed",
        }
    }
}

impl fmt::Display for AuctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state together with the first block height that could confirm it.
/// The height is a lower bound: a covenant mined later than that and then
/// reorganized out is not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRecord {
    pub state: AuctionState,
    pub height: u64,
}

#[derive(Debug, Clone)]
pub struct Auction {
    pub name: String,
    pub state: AuctionState,
    /// Actor running the auction; resolved through the actor registry
    pub actor: ActorId,
    history: Vec<StateRecord>,
    rollbacks: u32,
}

impl Auction {
    pub fn new(name: impl Into<String>, actor: ActorId, height: u64) -> Self {
        Self {
            name: name.into(),
            state: AuctionState::Requested,
            actor,
            history: vec![StateRecord {
                state: AuctionState::Requested,
                height,
            }],
            rollbacks: 0,
        }
    }

    /// States recorded on the current branch, oldest first.
    pub fn history(&self) -> &[StateRecord] {
        &self.history
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollbacks
    }

    fn advance(&mut self, state: AuctionState, height: u64) {
        debug_assert!(state > self.state, "{} -> {state}", self.state);
        self.state = state;
        self.history.push(StateRecord { state, height });
    }

    fn terminate(&mut self, state: AuctionState) {
        self.state = state;
    }

    /// Drops every state recorded at or above `reorg_height` and returns the
    /// state reverted to, if it changed. Terminal auctions are left alone.
    pub fn rollback(&mut self, reorg_height: u64) -> Option<AuctionState> {
        if self.state.is_terminal() {
            return None;
        }
        let before = self.state;
        while self.history.len() > 1
            && self
                .history
                .last()
                .map_or(false, |record| record.height >= reorg_height)
        {
            self.history.pop();
        }
        self.state = self
            .history
            .last()
            .map_or(AuctionState::Requested, |record| record.state);
        if self.state == before {
            return None;
        }
        self.rollbacks += 1;
        Some(self.state)
    }
}

/// Bid is a tenth of the confirmed balance, locked up twice over.
pub fn bid_amounts(confirmed: u64) -> Option<(u64, u64)> {
    let bid = confirmed / 10;
    (bid > 0).then(|| (bid, bid * 2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Open,
    Bid,
    Reveal,
}

impl Step {
    fn target(self) -> AuctionState {
        match self {
            Step::Open => AuctionState::Open,
            Step::Bid => AuctionState::Bid,
            Step::Reveal => AuctionState::Reveal,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Step::Open => "open",
            Step::Bid => "bid",
            Step::Reveal => "reveal",
        }
    }
}

/// Services shared by every auction.
pub struct AuctionContext {
    pub bus: NotificationBus,
    pub arbiter: Arc<FundingArbiter>,
    pub grinder: NameGrinder,
    pub names: ActiveNames,
    pub config: AuctionConfig,
}

impl AuctionContext {
    fn minimum_for(&self, step: Step) -> u64 {
        match step {
            Step::Open => self.config.min_open_balance,
            Step::Bid => self.config.min_bid_balance,
            Step::Reveal => self.config.min_reveal_balance,
        }
    }
}

pub struct AuctionStateMachine {
    auction: Auction,
    actor: Arc<Actor>,
    ctx: Arc<AuctionContext>,
    subscription: Subscription,
    _lease: NameLease,
}

impl AuctionStateMachine {
    /// Claims `name` (or a ground one) for `actor` and subscribes to its
    /// alerts. Nothing is sent until [`AuctionStateMachine::run`].
    pub async fn prepare(
        ctx: Arc<AuctionContext>,
        actor: Arc<Actor>,
        name: Option<String>,
    ) -> Result<Self, AuctionError> {
        let lease = ctx
            .grinder
            .reserve(actor.chain.as_ref(), &ctx.names, actor.id, name)
            .await?;
        let height = actor.chain.get_height().await?;
        let subscription = ctx.bus.subscribe(EventFilter::Auction {
            wallet_id: actor.wallet_id.clone(),
            name: lease.name().to_string(),
        });
        Ok(Self {
            auction: Auction::new(lease.name(), actor.id, height),
            actor,
            ctx,
            subscription,
            _lease: lease,
        })
    }

    pub fn auction(&self) -> &Auction {
        &self.auction
    }

    /// Opens the auction and follows alerts until it finalizes, fails,
    /// expires or `cancel` fires. The name is released on return.
    pub async fn run(mut self, cancel: CancellationToken) -> Auction {
        AUCTIONS_STARTED.inc();
        AUCTIONS_ACTIVE.inc();
        let deadline = Instant::now() + self.ctx.config.max_lifetime;
        info!(name = %self.auction.name, actor = self.actor.id, "Auction requested");

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.transition(Step::Open) => {}
        }

        // no alert ever arrives for a name that was never opened
        let period = self.ctx.config.open_retry;
        let mut open_retry = interval_at(Instant::now() + period, period);
        open_retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.auction.state.is_terminal() && !cancel.is_cancelled() {
            let requested = self.auction.state == AuctionState::Requested;
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {
                    self.fail(AuctionError::Expired(self.ctx.config.max_lifetime));
                    break;
                }
                _ = open_retry.tick(), if requested => None,
                event = self.subscription.recv() => match event {
                    Some(event) => Some(event),
                    None => {
                        debug!(name = %self.auction.name, "Notification bus closed");
                        break;
                    }
                },
            };
            let step = async {
                match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        debug!(name = %self.auction.name, "Retrying open");
                        self.transition(Step::Open).await
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = step => {}
            }
        }

        AUCTIONS_ACTIVE.dec();
        let outcome = if self.auction.state.is_terminal() {
            self.auction.state.as_str()
        } else {
            "cancelled"
        };
        AUCTIONS_COMPLETED.with_label_values(&[outcome]).inc();
        info!(
            name = %self.auction.name,
            actor = self.actor.id,
            "Auction ended: {outcome}"
        );
        self.auction
    }

    async fn handle(&mut self, event: NotificationEvent) {
        match event {
            NotificationEvent::WalletAlert { state, .. } => self.on_alert(state).await,
            NotificationEvent::ChainReorganize { entry } => self.on_reorganize(&entry),
            other => trace!(name = %self.auction.name, "Ignoring {}", other.kind()),
        }
    }

    async fn on_alert(&mut self, alert: NameState) {
        let current = self.auction.state;
        trace!(name = %self.auction.name, %current, "Alert {alert}");
        match alert {
            NameState::Opening => {
                if current == AuctionState::Requested {
                    self.transition(Step::Open).await;
                }
            }
            NameState::Bidding => {
                if current < AuctionState::Bid {
                    self.transition(Step::Bid).await;
                }
            }
            NameState::Reveal => {
                if current == AuctionState::Bid {
                    self.transition(Step::Reveal).await;
                }
            }
            NameState::Closed => {
                if current >= AuctionState::Bid {
                    if current == AuctionState::Bid {
                        warn!(name = %self.auction.name, "Closed without a reveal");
                    }
                    self.auction.terminate(AuctionState::Finalized);
                    info!(name = %self.auction.name, actor = self.actor.id, "Auction finalized");
                } else {
                    self.fail(AuctionError::Closed);
                }
            }
            NameState::Revoked => self.fail(AuctionError::Revoked),
            NameState::Locked => debug!(name = %self.auction.name, "Name locked"),
            NameState::Unknown(raw) => {
                info!(name = %self.auction.name, "Unhandled name state {raw}")
            }
        }
    }

    fn on_reorganize(&mut self, fork: &ChainEntry) {
        let reorg_height = fork.height + 1;
        if let Some(state) = self.auction.rollback(reorg_height) {
            AUCTION_ROLLBACKS.inc();
            warn!(
                name = %self.auction.name,
                actor = self.actor.id,
                "Reorganization from height {reorg_height}, reverted to {state}"
            );
        }
    }

    async fn transition(&mut self, step: Step) {
        match self.apply(step).await {
            Ok(()) => {
                AUCTION_TRANSITIONS
                    .with_label_values(&[step.as_str(), "ok"])
                    .inc();
            }
            Err(err) if err.is_fatal() => {
                AUCTION_TRANSITIONS
                    .with_label_values(&[step.as_str(), "fatal"])
                    .inc();
                self.fail(err);
            }
            Err(err) => {
                AUCTION_TRANSITIONS
                    .with_label_values(&[step.as_str(), "error"])
                    .inc();
                warn!(
                    name = %self.auction.name,
                    actor = self.actor.id,
                    "Failed to {}: {err}",
                    step.as_str()
                );
            }
        }
    }

    async fn apply(&mut self, step: Step) -> Result<(), AuctionError> {
        let info = self
            .ctx
            .arbiter
            .ensure(&self.actor, self.ctx.minimum_for(step))
            .await?;
        let transition = match step {
            Step::Open => Transition::Open,
            Step::Bid => {
                let confirmed = info.balance.confirmed;
                let (bid, lockup) = bid_amounts(confirmed)
                    .ok_or(AuctionError::InsufficientFunds { balance: confirmed })?;
                Transition::Bid { bid, lockup }
            }
            Step::Reveal => Transition::Reveal,
        };

        let height = self.actor.chain.get_height().await?;
        let tx = self
            .actor
            .send_transition(&self.auction.name, &transition)
            .await?;
        self.auction.advance(step.target(), height + 1);
        info!(
            name = %self.auction.name,
            actor = self.actor.id,
            tx = %tx.hash,
            "Sent {}",
            step.as_str()
        );
        Ok(())
    }

    fn fail(&mut self, err: AuctionError) {
        error!(
            name = %self.auction.name,
            actor = self.actor.id,
            "Auction failed: {err}"
        );
        self.auction.terminate(AuctionState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorRegistry;
    use crate::testing::{init_test_tracing, MockChain, MockFunder, MockWallet};
    use hsd_client::COIN;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        bus: NotificationBus,
        chain: Arc<MockChain>,
        wallet: Arc<MockWallet>,
        funder: Arc<MockFunder>,
        ctx: Arc<AuctionContext>,
        actor: Arc<Actor>,
    }

    fn harness(config: AuctionConfig) -> Harness {
        harness_with(config, |wallet, bus| {
            MockFunder::confirming(wallet, bus, COIN)
        })
    }

    fn harness_with(
        config: AuctionConfig,
        funder: impl FnOnce(Arc<MockWallet>, NotificationBus) -> MockFunder,
    ) -> Harness {
        init_test_tracing();
        let bus = NotificationBus::default();
        let chain = Arc::new(MockChain::new(100));
        let wallet = Arc::new(MockWallet::new());
        let funder = Arc::new(funder(wallet.clone(), bus.clone()));
        let arbiter = Arc::new(FundingArbiter::new(
            bus.clone(),
            funder.clone(),
            Duration::from_secs(5),
        ));
        let mut registry = ActorRegistry::new();
        let actor = registry.register("actor-0", "default", chain.clone(), wallet.clone());
        let ctx = Arc::new(AuctionContext {
            bus: bus.clone(),
            arbiter,
            grinder: NameGrinder::new(1..=63, true, 8),
            names: ActiveNames::default(),
            config,
        });
        Harness {
            bus,
            chain,
            wallet,
            funder,
            ctx,
            actor,
        }
    }

    fn alert(name: &str, state: NameState) -> NotificationEvent {
        NotificationEvent::WalletAlert {
            wallet_id: "actor-0".to_string(),
            name: name.to_string(),
            state,
        }
    }

    impl Harness {
        async fn spawn(&self, name: &str, cancel: &CancellationToken) -> JoinHandle<Auction> {
            let machine =
                AuctionStateMachine::prepare(self.ctx.clone(), self.actor.clone(), Some(name.into()))
                    .await
                    .unwrap();
            tokio::spawn(machine.run(cancel.clone()))
        }

        /// Publishes and lets the auction task drain its queue.
        async fn send(&self, event: NotificationEvent) {
            self.bus.publish(event).await;
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }

        fn actions(&self) -> Vec<&'static str> {
            self.wallet
                .transitions()
                .iter()
                .map(|(_, _, t)| t.action())
                .collect()
        }
    }

    #[test]
    fn test_bid_amounts() {
        assert_eq!(bid_amounts(1000), Some((100, 200)));
        assert_eq!(bid_amounts(1009), Some((100, 200)));
        assert_eq!(bid_amounts(9), None);
        assert_eq!(bid_amounts(0), None);
    }

    #[test]
    fn test_rollback_reverts_to_last_state_below_fork() {
        let mut auction = Auction::new("alpha", 0, 10);
        auction.advance(AuctionState::Open, 11);
        auction.advance(AuctionState::Bid, 15);
        auction.advance(AuctionState::Reveal, 20);

        // replacing blocks from 21 up leaves everything intact
        assert_eq!(auction.rollback(21), None);
        assert_eq!(auction.rollback(16), Some(AuctionState::Bid));
        assert_eq!(auction.rollback(11), Some(AuctionState::Requested));
        assert_eq!(auction.history().len(), 1);
        assert_eq!(auction.rollbacks(), 2);
        // nothing older than the request to fall back to
        assert_eq!(auction.rollback(0), None);
        assert_eq!(auction.state, AuctionState::Requested);
    }

    #[test]
    fn test_terminal_auctions_ignore_rollback() {
        let mut auction = Auction::new("alpha", 0, 10);
        auction.advance(AuctionState::Open, 11);
        auction.terminate(AuctionState::Failed);
        assert_eq!(auction.rollback(5), None);
        assert_eq!(auction.state, AuctionState::Failed);
    }

    #[tokio::test]
    async fn test_full_auction_lifecycle() {
        let h = harness(AuctionConfig::default());
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;

        h.send(alert("alpha", NameState::Opening)).await;
        h.send(alert("alpha", NameState::Bidding)).await;
        // level-triggered repeats are no-ops
        h.send(alert("alpha", NameState::Bidding)).await;
        h.send(alert("alpha", NameState::Reveal)).await;
        h.send(alert("alpha", NameState::Closed)).await;

        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Finalized);
        assert_eq!(h.actions(), vec!["open", "bid", "reveal"]);
        let states: Vec<_> = auction.history().iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                AuctionState::Requested,
                AuctionState::Open,
                AuctionState::Bid,
                AuctionState::Reveal
            ]
        );
        assert!(!h.ctx.names.contains("alpha"));
        assert_eq!(h.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_bid_uses_tenth_of_confirmed_balance() {
        let h = harness(AuctionConfig::default());
        h.wallet.credit("actor-0", 10 * COIN);
        let cancel = CancellationToken::new();
        let _task = h.spawn("alpha", &cancel).await;

        h.send(alert("alpha", NameState::Bidding)).await;
        let bids: Vec<_> = h
            .wallet
            .transitions()
            .into_iter()
            .filter_map(|(_, _, t)| match t {
                Transition::Bid { bid, lockup } => Some((bid, lockup)),
                _ => None,
            })
            .collect();
        assert_eq!(bids, vec![(COIN, 2 * COIN)]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_zero_balance_bid_fails_without_submitting() {
        let h = harness(AuctionConfig {
            min_open_balance: 0,
            min_bid_balance: 0,
            min_reveal_balance: 0,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;

        h.send(alert("alpha", NameState::Bidding)).await;
        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Failed);
        assert_eq!(h.actions(), vec!["open"]);
        assert!(h.funder.requests().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_state_until_next_alert() {
        let h = harness(AuctionConfig::default());
        h.wallet.fail_transitions(Some("Name is not available."));
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;

        h.send(alert("alpha", NameState::Locked)).await;
        h.wallet.fail_transitions(None);
        h.send(alert("alpha", NameState::Opening)).await;
        assert_eq!(h.actions(), vec!["open"]);

        cancel.cancel();
        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_funding_timeout_keeps_state() {
        let h = harness_with(
            AuctionConfig {
                min_bid_balance: 2 * COIN,
                ..Default::default()
            },
            |wallet, _| MockFunder::silent(wallet),
        );
        h.wallet.credit("actor-0", COIN);
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;

        h.send(alert("alpha", NameState::Bidding)).await;
        // the arbiter gives up after 5s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.actions(), vec!["open"]);
        assert_eq!(h.funder.requests().len(), 1);
        assert!(!task.is_finished());

        cancel.cancel();
        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_retried_after_funding_timeout() {
        let h = harness_with(
            AuctionConfig {
                open_retry: Duration::from_secs(10),
                ..Default::default()
            },
            |wallet, _| MockFunder::silent(wallet),
        );
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(h.actions().is_empty());
        assert_eq!(h.funder.requests().len(), 1);
        assert!(h.ctx.names.contains("alpha"));

        // funds arrive from elsewhere; the next retry opens without asking
        h.wallet.credit("actor-0", 10 * COIN);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(h.actions(), vec!["open"]);
        assert_eq!(h.funder.requests().len(), 1);

        // opened names wait for alerts instead of retrying
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.actions(), vec!["open"]);

        cancel.cancel();
        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Open);
    }

    #[tokio::test]
    async fn test_reorg_rolls_back_and_alert_resubmits() {
        let h = harness(AuctionConfig::default());
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;

        h.send(alert("alpha", NameState::Bidding)).await;
        assert_eq!(h.actions(), vec!["open", "bid"]);

        // both covenants were sent at height 100, so they confirm from 101
        h.chain.reorganize(100, 3);
        let fork = h.chain.entry(100).unwrap();
        h.send(NotificationEvent::ChainReorganize { entry: fork }).await;
        h.send(alert("alpha", NameState::Bidding)).await;
        assert_eq!(h.actions(), vec!["open", "bid", "bid"]);

        cancel.cancel();
        let auction = task.await.unwrap();
        assert_eq!(auction.rollbacks(), 1);
        assert_eq!(auction.state, AuctionState::Bid);
    }

    #[tokio::test]
    async fn test_closed_before_bid_fails() {
        let h = harness(AuctionConfig::default());
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;
        h.send(alert("alpha", NameState::Unknown("TRANSFER".into())))
            .await;
        h.send(alert("alpha", NameState::Closed)).await;
        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Failed);
    }

    #[tokio::test]
    async fn test_other_auctions_alerts_are_not_seen() {
        let h = harness(AuctionConfig::default());
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;
        h.send(alert("beta", NameState::Revoked)).await;
        assert!(!task.is_finished());
        cancel.cancel();
        assert_eq!(task.await.unwrap().state, AuctionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auction_expires() {
        let h = harness(AuctionConfig {
            max_lifetime: Duration::from_secs(60),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let task = h.spawn("alpha", &cancel).await;
        let auction = task.await.unwrap();
        assert_eq!(auction.state, AuctionState::Failed);
    }
}
