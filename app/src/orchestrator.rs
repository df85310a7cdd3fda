use crate::actor::{Actor, ActorRegistry};
use crate::auction::{Auction, AuctionContext, AuctionStateMachine};
use crate::config::OrchestratorConfig;
use crate::error::AuctionError;
use crate::task::TaskHandle;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Runs auctions for a fixed pool of actors.
pub struct AuctionOrchestrator {
    registry: Arc<ActorRegistry>,
    ctx: Arc<AuctionContext>,
    config: OrchestratorConfig,
}

impl AuctionOrchestrator {
    pub fn new(
        registry: Arc<ActorRegistry>,
        ctx: Arc<AuctionContext>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            ctx,
            config,
        }
    }

    /// Prepares every actor, then starts one scheduling loop per actor slot
    /// plus one for the configured names.
    pub async fn start(self: Arc<Self>, cancel: &CancellationToken) -> Vec<TaskHandle> {
        for actor in self.registry.iter() {
            if let Err(err) = actor.ensure_setup().await {
                error!(actor = actor.id, "Wallet setup failed: {err}");
                continue;
            }
            self.prefund(actor).await;
        }

        let mut handles = Vec::with_capacity(self.registry.len() + 1);
        if !self.config.names.is_empty() {
            let this = self.clone();
            handles.push(TaskHandle::spawn("seeded-auctions", cancel, move |token| {
                this.run_seeded(token)
            }));
        }
        for slot in 0..self.registry.len() {
            let this = self.clone();
            handles.push(TaskHandle::spawn("auction-scheduler", cancel, move |token| {
                this.schedule_loop(slot, token)
            }));
        }
        info!("Scheduling auctions for {} actors", self.registry.len());
        handles
    }

    /// Best effort: mines a few blocks to a fresh address of the actor.
    async fn prefund(&self, actor: &Actor) {
        if self.config.prefund_blocks == 0 {
            return;
        }
        let result = async {
            let address = actor.create_address().await?;
            actor
                .chain
                .mine_blocks(self.config.prefund_blocks, &address)
                .await
        }
        .await;
        match result {
            Ok(hashes) => info!(actor = actor.id, "Prefunded with {} blocks", hashes.len()),
            Err(err) => warn!(actor = actor.id, "Prefunding failed: {err}"),
        }
    }

    fn next_delay(&self) -> Duration {
        let (min, max) = (*self.config.interval.start(), *self.config.interval.end());
        rand::thread_rng().gen_range(min..=max)
    }

    /// Runs one auction on a uniformly chosen actor.
    pub async fn run_auction(
        &self,
        name: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Auction, AuctionError> {
        let machine = self.schedule(name).await?;
        Ok(machine.run(cancel).await)
    }

    async fn schedule(&self, name: Option<String>) -> Result<AuctionStateMachine, AuctionError> {
        let actor = self
            .registry
            .choose(&mut rand::thread_rng())
            .ok_or(AuctionError::Precondition("No actors registered."))?;
        // setup may have failed at startup
        actor.prepare().await?;
        AuctionStateMachine::prepare(self.ctx.clone(), actor, name).await
    }

    async fn run_seeded(self: Arc<Self>, token: CancellationToken) {
        let mut auctions = JoinSet::new();
        for name in &self.config.names {
            match self.schedule(Some(name.clone())).await {
                Ok(machine) => {
                    auctions.spawn(machine.run(token.clone()));
                }
                Err(err) => warn!("Cannot auction {name}: {err}"),
            }
        }
        while let Some(joined) = auctions.join_next().await {
            record(joined);
        }
    }

    async fn schedule_loop(self: Arc<Self>, slot: usize, token: CancellationToken) {
        let mut auctions = JoinSet::new();
        'schedule: loop {
            let sleep = tokio::time::sleep(self.next_delay());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break 'schedule,
                    _ = &mut sleep => break,
                    Some(joined) = auctions.join_next() => record(joined),
                }
            }

            if self.ctx.names.len() >= self.config.max_active_auctions {
                debug!(slot, "{} auctions active, skipping", self.ctx.names.len());
                continue;
            }
            match self.schedule(None).await {
                Ok(machine) => {
                    debug!(slot, "Scheduled {}", machine.auction().name);
                    auctions.spawn(machine.run(token.clone()));
                }
                Err(err) => warn!(slot, "Could not schedule an auction: {err}"),
            }
        }

        // auction tasks observe the same token and wind down
        while let Some(joined) = auctions.join_next().await {
            record(joined);
        }
        trace!(slot, "Scheduler stopped");
    }
}

fn record(joined: Result<Auction, JoinError>) {
    match joined {
        Ok(auction) => debug!(
            name = %auction.name,
            actor = auction.actor,
            "Auction released in state {}",
            auction.state
        ),
        Err(err) => error!("Auction task panicked: {err}"),
    }
}
