//! In-memory node, wallet and funder used by the unit tests.

use crate::bus::{NotificationBus, NotificationEvent};
use crate::funding::{Funder, FundingRequest};
use async_trait::async_trait;
use hsd_client::jsonrpc::{self, error::RpcError};
use hsd_client::{
    AccountInfo, Balance, ChainEntry, ChainService, Coin, Error as ClientError, NameState,
    NameStatus, Output, Transition, TxResult, WalletService,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub fn rpc_error(code: i32, message: &str) -> ClientError {
    ClientError::Rpc(jsonrpc::Error::Rpc(RpcError {
        code,
        message: message.to_string(),
        data: None,
    }))
}

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningFailure {
    Orphan,
    Offline,
}

#[derive(Default)]
struct ChainState {
    entries: Vec<ChainEntry>,
    blocks_made: u64,
    names: HashMap<String, NameState>,
    mempool: Vec<String>,
    mined: Vec<(u32, String)>,
    invalidated: Vec<String>,
    submitted: Vec<String>,
    grind_calls: usize,
    mining_failure: Option<MiningFailure>,
    offline: bool,
}

impl ChainState {
    fn push_block(&mut self) -> String {
        self.blocks_made += 1;
        let height = self.entries.len() as u64;
        let hash = format!("{:064x}", self.blocks_made);
        self.entries.push(ChainEntry {
            hash: hash.clone(),
            height,
            tree_root: format!("{:064x}", self.blocks_made * 31),
            prev_block: self.entries.last().map(|e| e.hash.clone()),
        });
        hash
    }
}

/// Single node with a linear chain starting at a genesis block.
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(height: u64) -> Self {
        let chain = Self {
            state: Mutex::new(ChainState::default()),
        };
        {
            let mut state = chain.lock();
            for _ in 0..=height {
                state.push_block();
            }
        }
        chain
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn height(&self) -> u64 {
        self.lock().entries.len() as u64 - 1
    }

    pub fn entry(&self, height: u64) -> Option<ChainEntry> {
        self.lock().entries.get(height as usize).cloned()
    }

    pub fn extend(&self, count: u64) {
        let mut state = self.lock();
        for _ in 0..count {
            state.push_block();
        }
    }

    /// Replaces every block above `fork_height` with `new_blocks` fresh ones.
    pub fn reorganize(&self, fork_height: u64, new_blocks: u64) {
        let mut state = self.lock();
        state.entries.truncate(fork_height as usize + 1);
        for _ in 0..new_blocks {
            state.push_block();
        }
    }

    pub fn set_name_state(&self, name: &str, state: NameState) {
        self.lock().names.insert(name.to_string(), state);
    }

    pub fn push_mempool(&self, txid: &str) {
        self.lock().mempool.push(txid.to_string());
    }

    pub fn clear_mempool(&self) {
        self.lock().mempool.clear();
    }

    pub fn fail_mining(&self, failure: Option<MiningFailure>) {
        self.lock().mining_failure = failure;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn mined(&self) -> Vec<(u32, String)> {
        self.lock().mined.clone()
    }

    pub fn invalidated(&self) -> Vec<String> {
        self.lock().invalidated.clone()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.lock().submitted.clone()
    }

    pub fn grind_calls(&self) -> usize {
        self.lock().grind_calls
    }

    fn check_online(&self) -> Result<(), ClientError> {
        if self.lock().offline {
            return Err(rpc_error(-9, "Node is offline."));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainService for MockChain {
    async fn get_height(&self) -> Result<u64, ClientError> {
        self.check_online()?;
        Ok(self.height())
    }

    async fn get_entry_by_height(&self, height: u64) -> Result<Option<ChainEntry>, ClientError> {
        self.check_online()?;
        Ok(self.entry(height))
    }

    async fn mine_blocks(&self, count: u32, address: &str) -> Result<Vec<String>, ClientError> {
        self.check_online()?;
        let mut state = self.lock();
        state.mined.push((count, address.to_string()));
        let failure = state.mining_failure;
        match failure {
            Some(MiningFailure::Orphan) => Err(rpc_error(-1, "Block is an orphan.")),
            Some(MiningFailure::Offline) => Err(rpc_error(-9, "Node is offline.")),
            None => Ok((0..count).map(|_| state.push_block()).collect()),
        }
    }

    async fn invalidate_block(&self, hash: &str) -> Result<(), ClientError> {
        self.check_online()?;
        let mut state = self.lock();
        state.invalidated.push(hash.to_string());
        match state.entries.iter().position(|e| e.hash == hash) {
            Some(index) => {
                state.entries.truncate(index);
                Ok(())
            }
            None => Err(rpc_error(-1, "Block not found.")),
        }
    }

    async fn grind_name(&self, length: usize) -> Result<String, ClientError> {
        self.check_online()?;
        let mut state = self.lock();
        state.grind_calls += 1;
        let mut name = format!("g{}", state.grind_calls);
        name.truncate(length);
        while name.len() < length {
            name.push('x');
        }
        Ok(name)
    }

    async fn get_name_info(&self, name: &str) -> Result<Option<NameStatus>, ClientError> {
        self.check_online()?;
        let state = self.lock();
        Ok(state.names.get(name).map(|name_state| NameStatus {
            name: name.to_string(),
            state: name_state.clone(),
            height: state.entries.len() as u64 - 1,
        }))
    }

    async fn get_mempool(&self) -> Result<Vec<String>, ClientError> {
        self.check_online()?;
        Ok(self.lock().mempool.clone())
    }

    async fn get_raw_block(&self, hash: &str) -> Result<String, ClientError> {
        self.check_online()?;
        Ok(format!("raw:{hash}"))
    }

    async fn submit_block(&self, raw: &str) -> Result<(), ClientError> {
        self.check_online()?;
        self.lock().submitted.push(raw.to_string());
        Ok(())
    }
}

#[derive(Default, Clone)]
struct AccountState {
    confirmed: u64,
    unconfirmed: u64,
}

#[derive(Default)]
struct WalletState {
    wallets: HashSet<String>,
    accounts: HashMap<(String, String), AccountState>,
    coins: HashMap<String, Vec<Coin>>,
    transitions: Vec<(String, String, Transition)>,
    sends: Vec<(String, Vec<Output>)>,
    transition_failure: Option<String>,
    create_failure: Option<String>,
    txs: u64,
}

impl WalletState {
    fn next_tx(&mut self) -> String {
        self.txs += 1;
        format!("{:064x}", self.txs)
    }
}

/// Wallet plugin holding any number of wallets. Accounts that were never
/// created read as empty.
#[derive(Default)]
pub struct MockWallet {
    state: Mutex<WalletState>,
}

pub fn receive_address(wallet_id: &str, account: &str) -> String {
    format!("rs1q-{wallet_id}-{account}")
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap()
    }

    pub fn has_account(&self, wallet_id: &str, account: &str) -> bool {
        self.lock()
            .accounts
            .contains_key(&(wallet_id.to_string(), account.to_string()))
    }

    pub fn fail_next_create(&self, message: &str) {
        self.lock().create_failure = Some(message.to_string());
    }

    pub fn fail_transitions(&self, message: Option<&str>) {
        self.lock().transition_failure = message.map(str::to_string);
    }

    /// Adds a confirmed coin to the default account of `wallet_id`.
    pub fn credit(&self, wallet_id: &str, amount: u64) {
        let mut state = self.lock();
        let hash = state.next_tx();
        let key = (wallet_id.to_string(), "default".to_string());
        state.accounts.entry(key).or_default().confirmed += amount;
        state
            .coins
            .entry(wallet_id.to_string())
            .or_default()
            .push(Coin {
                hash,
                index: 0,
                height: 1,
                value: amount,
                address: receive_address(wallet_id, "default"),
            });
    }

    pub fn push_coin(&self, wallet_id: &str, coin: Coin) {
        self.lock()
            .coins
            .entry(wallet_id.to_string())
            .or_default()
            .push(coin);
    }

    pub fn set_coins(&self, wallet_id: &str, coins: Vec<Coin>) {
        self.lock().coins.insert(wallet_id.to_string(), coins);
    }

    pub fn transitions(&self) -> Vec<(String, String, Transition)> {
        self.lock().transitions.clone()
    }

    pub fn sends(&self) -> Vec<(String, Vec<Output>)> {
        self.lock().sends.clone()
    }
}

#[async_trait]
impl WalletService for MockWallet {
    async fn create_wallet(&self, id: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        if let Some(message) = state.create_failure.take() {
            return Err(ClientError::Wallet {
                status: 500,
                message,
            });
        }
        if !state.wallets.insert(id.to_string()) {
            return Err(ClientError::Wallet {
                status: 400,
                message: "WDB: Wallet already exists.".to_string(),
            });
        }
        Ok(())
    }

    async fn create_account(&self, id: &str, account: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        let key = (id.to_string(), account.to_string());
        if state.accounts.contains_key(&key) {
            return Err(ClientError::Wallet {
                status: 400,
                message: "Account already exists.".to_string(),
            });
        }
        state.accounts.insert(key, AccountState::default());
        Ok(())
    }

    async fn create_address(&self, id: &str, account: &str) -> Result<String, ClientError> {
        let mut state = self.lock();
        let n = state.next_tx();
        Ok(format!("rs1q-{id}-{account}-{}", &n[56..]))
    }

    async fn get_account(&self, id: &str, account: &str) -> Result<AccountInfo, ClientError> {
        let state = self.lock();
        let balance = state
            .accounts
            .get(&(id.to_string(), account.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(AccountInfo {
            balance: Balance {
                confirmed: balance.confirmed,
                unconfirmed: balance.unconfirmed,
            },
            receive_address: receive_address(id, account),
        })
    }

    async fn get_coins(&self, id: &str) -> Result<Vec<Coin>, ClientError> {
        Ok(self.lock().coins.get(id).cloned().unwrap_or_default())
    }

    async fn send_transition(
        &self,
        id: &str,
        name: &str,
        transition: &Transition,
        _account: &str,
    ) -> Result<TxResult, ClientError> {
        transition.validate(name)?;
        let mut state = self.lock();
        if let Some(message) = state.transition_failure.clone() {
            return Err(ClientError::Wallet {
                status: 400,
                message,
            });
        }
        state
            .transitions
            .push((id.to_string(), name.to_string(), transition.clone()));
        Ok(TxResult {
            hash: state.next_tx(),
        })
    }

    async fn send(&self, id: &str, outputs: &[Output]) -> Result<TxResult, ClientError> {
        let mut state = self.lock();
        state.sends.push((id.to_string(), outputs.to_vec()));
        Ok(TxResult {
            hash: state.next_tx(),
        })
    }
}

/// Funder that credits the mock wallet directly.
pub struct MockFunder {
    wallet: std::sync::Arc<MockWallet>,
    bus: Option<NotificationBus>,
    amount: u64,
    delay: Duration,
    fail: AtomicBool,
    requests: Mutex<Vec<FundingRequest>>,
}

impl MockFunder {
    /// Credits `amount` and publishes the confirmation before `fund` returns.
    pub fn confirming(
        wallet: std::sync::Arc<MockWallet>,
        bus: NotificationBus,
        amount: u64,
    ) -> Self {
        Self {
            wallet,
            bus: Some(bus),
            amount,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Accepts requests but never confirms them.
    pub fn silent(wallet: std::sync::Arc<MockWallet>) -> Self {
        Self {
            wallet,
            bus: None,
            amount: 0,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<FundingRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Funder for MockFunder {
    async fn fund(&self, request: &FundingRequest) -> Result<(), ClientError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Wallet {
                status: 500,
                message: "Not enough funds.".to_string(),
            });
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(bus) = &self.bus {
            self.wallet.credit(&request.wallet_id, self.amount);
            bus.publish(NotificationEvent::FundingConfirmed {
                address: request.address.clone(),
            })
            .await;
        }
        Ok(())
    }
}
