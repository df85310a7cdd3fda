use crate::actor::{Actor, ActorId};
use crate::bus::{EventFilter, NotificationBus, NotificationEvent, Subscription};
use crate::error::FundingError;
use crate::metrics::FUNDING_REQUESTS;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use hsd_client::{AccountInfo, Error as ClientError, Output, WalletService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::*;

/// One "need funds" request. It stays outstanding until its confirmation
/// wait resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingRequest {
    pub id: u64,
    pub actor: ActorId,
    pub wallet_id: String,
    pub address: String,
}

/// Whoever pays for actor funding.
#[async_trait]
pub trait Funder: Send + Sync {
    /// Starts a payment to `request.address`. Returning does not mean the
    /// payment is confirmed.
    async fn fund(&self, request: &FundingRequest) -> Result<(), ClientError>;
}

/// Pays from a wallet on the same node.
pub struct WalletFunder {
    wallet: Arc<dyn WalletService>,
    wallet_id: String,
    amount: u64,
}

impl WalletFunder {
    pub fn new(wallet: Arc<dyn WalletService>, wallet_id: impl Into<String>, amount: u64) -> Self {
        Self {
            wallet,
            wallet_id: wallet_id.into(),
            amount,
        }
    }
}

#[async_trait]
impl Funder for WalletFunder {
    async fn fund(&self, request: &FundingRequest) -> Result<(), ClientError> {
        let tx = self
            .wallet
            .send(
                &self.wallet_id,
                &[Output {
                    value: self.amount,
                    address: request.address.clone(),
                }],
            )
            .await?;
        info!(
            actor = request.actor,
            "Sent {} from {} to {} in {}", self.amount, self.wallet_id, request.address, tx.hash
        );
        Ok(())
    }
}

type SharedOutcome = Shared<BoxFuture<'static, Result<(), FundingError>>>;

struct InFlight {
    id: u64,
    outcome: SharedOutcome,
}

/// Keeps actors above a minimum confirmed balance.
///
/// At most one request is outstanding per actor; callers arriving while it is
/// pending await the same outcome instead of asking for funds again.
pub struct FundingArbiter {
    bus: NotificationBus,
    funder: Arc<dyn Funder>,
    timeout: Duration,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<ActorId, InFlight>>,
}

impl FundingArbiter {
    pub fn new(bus: NotificationBus, funder: Arc<dyn Funder>, timeout: Duration) -> Self {
        Self {
            bus,
            funder,
            timeout,
            next_id: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the actor's account once its confirmed balance is at least
    /// `minimum`, requesting funds as often as needed before the deadline.
    pub async fn ensure(&self, actor: &Actor, minimum: u64) -> Result<AccountInfo, FundingError> {
        let deadline = Instant::now() + self.timeout;
        let mut info = actor
            .refresh_balance()
            .await
            .map_err(FundingError::balance)?;

        while info.balance.confirmed < minimum {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                FUNDING_REQUESTS.with_label_values(&["timeout"]).inc();
                return Err(FundingError::Timeout(self.timeout));
            }
            debug!(
                actor = actor.id,
                confirmed = info.balance.confirmed,
                minimum,
                "Balance too low"
            );

            let mut waiter = self.request(actor, &info.receive_address, remaining);
            let result = waiter.wait().await;
            drop(waiter);
            result?;

            info = actor
                .refresh_balance()
                .await
                .map_err(FundingError::balance)?;
        }
        Ok(info)
    }

    /// Number of actors with an outstanding request.
    pub fn outstanding(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn request(&self, actor: &Actor, address: &str, wait: Duration) -> Waiter<'_> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = in_flight.get(&actor.id) {
            // resolved requests are never handed to a new caller
            if pending.outcome.peek().is_none() {
                FUNDING_REQUESTS.with_label_values(&["joined"]).inc();
                debug!(actor = actor.id, "Joining funding request {}", pending.id);
                return Waiter {
                    arbiter: self,
                    actor: actor.id,
                    id: pending.id,
                    outcome: Some(pending.outcome.clone()),
                };
            }
        }

        let request = FundingRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            actor: actor.id,
            wallet_id: actor.wallet_id.clone(),
            address: address.to_string(),
        };
        // registered before the funder is ever called
        let subscription = self.bus.subscribe(EventFilter::Funding {
            address: request.address.clone(),
        });
        let id = request.id;
        let outcome = await_funding(self.funder.clone(), request, subscription, wait)
            .boxed()
            .shared();
        in_flight.insert(
            actor.id,
            InFlight {
                id,
                outcome: outcome.clone(),
            },
        );
        Waiter {
            arbiter: self,
            actor: actor.id,
            id,
            outcome: Some(outcome),
        }
    }

    /// Forgets request `id` once it resolved or nobody waits on it anymore.
    fn settle(&self, actor: ActorId, id: u64) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let done = match in_flight.get(&actor) {
            Some(pending) if pending.id == id => {
                pending.outcome.peek().is_some()
                    || pending.outcome.strong_count().map_or(true, |count| count <= 1)
            }
            _ => false,
        };
        if done {
            in_flight.remove(&actor);
        }
    }
}

/// One caller's share of an outstanding request. Dropping it, including by
/// cancelling the caller, settles the request.
struct Waiter<'a> {
    arbiter: &'a FundingArbiter,
    actor: ActorId,
    id: u64,
    outcome: Option<SharedOutcome>,
}

impl Waiter<'_> {
    async fn wait(&mut self) -> Result<(), FundingError> {
        match self.outcome.as_mut() {
            Some(outcome) => outcome.await,
            None => Err(FundingError::Cancelled),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // our clone has to go before the table counts the remaining waiters
        self.outcome.take();
        self.arbiter.settle(self.actor, self.id);
    }
}

async fn await_funding(
    funder: Arc<dyn Funder>,
    request: FundingRequest,
    mut subscription: Subscription,
    wait: Duration,
) -> Result<(), FundingError> {
    FUNDING_REQUESTS.with_label_values(&["requested"]).inc();
    info!(actor = request.actor, "Need funds: {}", request.address);

    if let Err(err) = funder.fund(&request).await {
        FUNDING_REQUESTS.with_label_values(&["failed"]).inc();
        warn!(actor = request.actor, "Funding request failed: {err}");
        return Err(FundingError::Request(Arc::new(err)));
    }

    let confirmed = timeout(wait, async {
        while let Some(event) = subscription.recv().await {
            if matches!(&event, NotificationEvent::FundingConfirmed { address } if *address == request.address)
            {
                return true;
            }
        }
        false
    })
    .await;
    drop(subscription);

    match confirmed {
        Ok(true) => {
            FUNDING_REQUESTS.with_label_values(&["confirmed"]).inc();
            debug!(actor = request.actor, "Funds confirmed at {}", request.address);
            Ok(())
        }
        Ok(false) => Err(FundingError::Cancelled),
        Err(_) => {
            FUNDING_REQUESTS.with_label_values(&["timeout"]).inc();
            warn!(actor = request.actor, "No confirmation for {} after {wait:?}", request.address);
            Err(FundingError::Timeout(wait))
        }
    }
}
