mod node_rpc;
mod wallet_http;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use strum::EnumString;
use thiserror::Error;

pub use bitcoincore_rpc::jsonrpc;
pub use node_rpc::{HsdRpcError, NodeClient};
pub use wallet_http::WalletClient;

/// Base units per coin.
pub const COIN: u64 = 1_000_000;

pub const MAX_NAME_LENGTH: usize = 63;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Rpc error: {0}")]
    Rpc(#[from] jsonrpc::Error),
    #[error("Rpc transport error: {0}")]
    Transport(#[from] jsonrpc::simple_http::Error),
    #[error("Http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("Malformed http request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("Decoding failure: {0}")]
    Decoding(#[from] serde_json::Error),
    #[error("Wallet error ({status}): {message}")]
    Wallet { status: u16, message: String },
    #[error("Block rejected: {0}")]
    BlockRejected(String),
    #[error("Precondition violated: {0}")]
    Precondition(&'static str),
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Numeric node error code, if the node answered with one.
    pub fn rpc_code(&self) -> Option<HsdRpcError> {
        match self {
            Error::Rpc(jsonrpc::Error::Rpc(err)) => Some(HsdRpcError::from(err.clone())),
            _ => None,
        }
    }

    fn remote_message(&self) -> Option<&str> {
        match self {
            Error::Rpc(jsonrpc::Error::Rpc(err)) => Some(err.message.as_str()),
            Error::Wallet { message, .. } => Some(message.as_str()),
            Error::BlockRejected(reason) => Some(reason.as_str()),
            _ => None,
        }
    }

    /// Wallet or account creation hit an existing record.
    pub fn is_already_exists(&self) -> bool {
        self.remote_message()
            .map(|message| message.to_ascii_lowercase().contains("already exists"))
            .unwrap_or(false)
    }

    /// Mining produced an orphan or the node refused the block.
    pub fn is_rejected_block(&self) -> bool {
        if matches!(self, Error::BlockRejected(_)) {
            return true;
        }
        if matches!(
            self.rpc_code(),
            Some(HsdRpcError::RpcVerifyRejected) | Some(HsdRpcError::RpcVerifyError)
        ) {
            return true;
        }
        self.remote_message()
            .map(|message| {
                let message = message.to_ascii_lowercase();
                message.contains("orphan") || message.contains("rejected")
            })
            .unwrap_or(false)
    }

    /// The requested height or hash is not part of the main chain.
    pub fn is_missing_entry(&self) -> bool {
        match self.rpc_code() {
            Some(HsdRpcError::RpcInvalidParameter) => true,
            Some(HsdRpcError::RpcMiscError) => self
                .remote_message()
                .map(|message| message.to_ascii_lowercase().contains("not found"))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// A local check failed before anything was sent.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub hash: String,
    pub height: u64,
    #[serde(rename = "treeroot", default)]
    pub tree_root: String,
    #[serde(rename = "previousblockhash", default)]
    pub prev_block: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Balance {
    #[serde(default)]
    pub confirmed: u64,
    #[serde(default)]
    pub unconfirmed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub balance: Balance,
    pub receive_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Coin {
    pub hash: String,
    pub index: u32,
    /// -1 while unconfirmed
    pub height: i64,
    pub value: u64,
    pub address: String,
}

impl Coin {
    pub fn is_confirmed(&self) -> bool {
        self.height >= 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxResult {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Output {
    pub value: u64,
    pub address: String,
}

/// Auction phase of a name as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, EnumString, Deserialize)]
#[serde(from = "String")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NameState {
    Opening,
    Locked,
    Bidding,
    Reveal,
    Closed,
    Revoked,
    #[strum(default)]
    Unknown(String),
}

impl From<String> for NameState {
    fn from(raw: String) -> Self {
        match raw.parse() {
            Ok(state) => state,
            Err(_) => NameState::Unknown(raw),
        }
    }
}

impl fmt::Display for NameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NameState::Opening => "OPENING",
            NameState::Locked => "LOCKED",
            NameState::Bidding => "BIDDING",
            NameState::Reveal => "REVEAL",
            NameState::Closed => "CLOSED",
            NameState::Revoked => "REVOKED",
            NameState::Unknown(raw) => raw.as_str(),
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NameStatus {
    pub name: String,
    pub state: NameState,
    #[serde(default)]
    pub height: u64,
}

/// Covenant-spending wallet operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Open,
    Bid { bid: u64, lockup: u64 },
    Reveal,
    Update { data: Value },
    Renew,
    Redeem,
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Open => "open",
            Transition::Bid { .. } => "bid",
            Transition::Reveal => "reveal",
            Transition::Update { .. } => "update",
            Transition::Renew => "renew",
            Transition::Redeem => "redeem",
        }
    }

    /// Local checks that must pass before the wallet is asked to spend.
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::Precondition("Must pass name."));
        }
        match self {
            Transition::Bid { bid, .. } if *bid == 0 => Err(Error::Precondition("Must pass bid.")),
            Transition::Bid { lockup, .. } if *lockup == 0 => {
                Err(Error::Precondition("Must pass lockup."))
            }
            Transition::Update { data } if data.is_null() => {
                Err(Error::Precondition("Must pass data."))
            }
            _ => Ok(()),
        }
    }

    /// Request body for `POST /wallet/:id/<action>`.
    pub fn body(&self, name: &str, account: &str) -> Value {
        match self {
            Transition::Bid { bid, lockup } => json!({
                "name": name,
                "bid": bid,
                "lockup": lockup,
                "account": account,
            }),
            Transition::Update { data } => json!({
                "name": name,
                "data": data,
                "account": account,
            }),
            _ => json!({ "name": name, "account": account }),
        }
    }
}

/// Node operations used by the harness.
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn get_height(&self) -> Result<u64, Error>;
    /// `None` when the height is beyond the tip.
    async fn get_entry_by_height(&self, height: u64) -> Result<Option<ChainEntry>, Error>;
    async fn mine_blocks(&self, count: u32, address: &str) -> Result<Vec<String>, Error>;
    async fn invalidate_block(&self, hash: &str) -> Result<(), Error>;
    async fn grind_name(&self, length: usize) -> Result<String, Error>;
    async fn get_name_info(&self, name: &str) -> Result<Option<NameStatus>, Error>;
    async fn get_mempool(&self) -> Result<Vec<String>, Error>;
    async fn get_raw_block(&self, hash: &str) -> Result<String, Error>;
    async fn submit_block(&self, raw: &str) -> Result<(), Error>;
}

/// Wallet operations used by the harness.
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn create_wallet(&self, id: &str) -> Result<(), Error>;
    async fn create_account(&self, id: &str, account: &str) -> Result<(), Error>;
    async fn create_address(&self, id: &str, account: &str) -> Result<String, Error>;
    async fn get_account(&self, id: &str, account: &str) -> Result<AccountInfo, Error>;
    async fn get_coins(&self, id: &str) -> Result<Vec<Coin>, Error>;
    async fn send_transition(
        &self,
        id: &str,
        name: &str,
        transition: &Transition,
        account: &str,
    ) -> Result<TxResult, Error>;
    async fn send(&self, id: &str, outputs: &[Output]) -> Result<TxResult, Error>;
}
