use hsd_client::{
    AccountInfo, ChainService, Error as ClientError, Transition, TxResult, WalletService,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

pub type ActorId = usize;

/// Simulated auction participant: one wallet account and the node it talks to.
pub struct Actor {
    pub id: ActorId,
    pub wallet_id: String,
    pub account: String,
    pub chain: Arc<dyn ChainService>,
    pub wallet: Arc<dyn WalletService>,
    balance: RwLock<Option<AccountInfo>>,
    ready: AtomicBool,
}

impl Actor {
    pub fn new(
        id: ActorId,
        wallet_id: impl Into<String>,
        account: impl Into<String>,
        chain: Arc<dyn ChainService>,
        wallet: Arc<dyn WalletService>,
    ) -> Self {
        Self {
            id,
            wallet_id: wallet_id.into(),
            account: account.into(),
            chain,
            wallet,
            balance: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Creates the wallet and account, accepting records that already exist.
    pub async fn ensure_setup(&self) -> Result<(), ClientError> {
        tolerate_existing(self.wallet.create_wallet(&self.wallet_id).await)?;
        tolerate_existing(
            self.wallet
                .create_account(&self.wallet_id, &self.account)
                .await,
        )?;
        self.ready.store(true, Ordering::Release);
        debug!(actor = self.id, "Wallet {}/{} ready", self.wallet_id, self.account);
        Ok(())
    }

    /// Runs [`Actor::ensure_setup`] unless it already succeeded.
    pub async fn prepare(&self) -> Result<(), ClientError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.ensure_setup().await
    }

    /// Reads the account from the wallet and caches it.
    pub async fn refresh_balance(&self) -> Result<AccountInfo, ClientError> {
        let info = self
            .wallet
            .get_account(&self.wallet_id, &self.account)
            .await?;
        *self.balance.write().await = Some(info.clone());
        Ok(info)
    }

    /// Last balance read by [`Actor::refresh_balance`].
    pub async fn cached_balance(&self) -> Option<AccountInfo> {
        self.balance.read().await.clone()
    }

    pub async fn create_address(&self) -> Result<String, ClientError> {
        self.wallet
            .create_address(&self.wallet_id, &self.account)
            .await
    }

    pub async fn send_transition(
        &self,
        name: &str,
        transition: &Transition,
    ) -> Result<TxResult, ClientError> {
        self.wallet
            .send_transition(&self.wallet_id, name, transition, &self.account)
            .await
    }
}

fn tolerate_existing(result: Result<(), ClientError>) -> Result<(), ClientError> {
    match result {
        Err(err) if err.is_already_exists() => {
            trace!("Ignoring existing record: {err}");
            Ok(())
        }
        other => other,
    }
}

/// Actors of one run, indexed by [`ActorId`].
#[derive(Default)]
pub struct ActorRegistry {
    actors: Vec<Arc<Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        wallet_id: impl Into<String>,
        account: impl Into<String>,
        chain: Arc<dyn ChainService>,
        wallet: Arc<dyn WalletService>,
    ) -> Arc<Actor> {
        let actor = Arc::new(Actor::new(
            self.actors.len(),
            wallet_id,
            account,
            chain,
            wallet,
        ));
        self.actors.push(actor.clone());
        actor
    }

    pub fn get(&self, id: ActorId) -> Option<&Arc<Actor>> {
        self.actors.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Actor>> {
        self.actors.iter()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Uniformly random actor.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<Actor>> {
        self.actors.choose(rng).cloned()
    }
}
