use crate::{ChainEntry, ChainService, Error, NameStatus};
use async_trait::async_trait;
use bitcoincore_rpc::jsonrpc::{error::RpcError, Client};
use num_derive::FromPrimitive;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::{json, value::RawValue, Value};
use std::sync::Arc;
use tracing::*;

// Error codes shared with the bitcoin rpc family, see hsd lib/node/rpc.js
#[derive(Debug, FromPrimitive, PartialEq, Eq)]
pub enum HsdRpcError {
    /// Standard JSON-RPC 2.0 errors
    RpcInvalidRequest = -32600,
    RpcMethodNotFound = -32601,
    RpcInvalidParams = -32602,
    RpcInternalError = -32603,
    RpcParseError = -32700,

    /// General application defined errors
    RpcMiscError = -1,
    RpcTypeError = -3,
    RpcInvalidAddressOrKey = -5,
    RpcOutOfMemory = -7,
    RpcInvalidParameter = -8,
    RpcDatabaseError = -20,
    RpcDeserializationError = -22,
    RpcVerifyError = -25,
    RpcVerifyRejected = -26,
    RpcVerifyAlreadyInChain = -27,
    RpcInWarmup = -28,
    RpcMethodDeprecated = -32,

    /// P2P client errors
    RpcClientNotConnected = -9,
    RpcClientInInitialDownload = -10,

    /// Wallet errors
    RpcWalletError = -4,
    RpcWalletInsufficientFunds = -6,
    RpcWalletNotFound = -18,

    /// Code not known to the node.
    RpcUnknownError = 0,
}

impl From<RpcError> for HsdRpcError {
    fn from(err: RpcError) -> Self {
        match num::FromPrimitive::from_i32(err.code) {
            Some(err) => err,
            None => Self::RpcUnknownError,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NameInfoResponse {
    info: Option<NameStatus>,
}

/// JSON-RPC handle on a single node.
#[derive(Clone)]
pub struct NodeClient {
    rpc: Arc<Client>,
}

impl NodeClient {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self, Error> {
        let user = api_key.as_ref().map(|_| "x".to_string());
        let client = Client::simple_http(url, user, api_key)?;
        Ok(Self {
            rpc: Arc::new(client),
        })
    }

    /// The jsonrpc client blocks, so every call is moved off the runtime threads.
    async fn call<T>(&self, cmd: &'static str, args: Vec<Value>) -> Result<T, Error>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let rpc = self.rpc.clone();
        tokio::task::spawn_blocking(move || call_blocking(&rpc, cmd, &args)).await?
    }
}

fn call_blocking<T: DeserializeOwned>(
    client: &Client,
    cmd: &str,
    args: &[Value],
) -> Result<T, Error> {
    let raw_args: Vec<_> = args
        .iter()
        .map(|a| {
            let json_string = serde_json::to_string(a)?;
            RawValue::from_string(json_string)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let req = client.build_request(cmd, &raw_args);
    trace!("rpc {cmd}");

    let resp = client.send_request(req).map_err(Error::Rpc)?;

    resp.result::<T>().map_err(Error::Rpc)
}

#[async_trait]
impl ChainService for NodeClient {
    async fn get_height(&self) -> Result<u64, Error> {
        self.call("getblockcount", vec![]).await
    }

    async fn get_entry_by_height(&self, height: u64) -> Result<Option<ChainEntry>, Error> {
        let hash: String = match self.call("getblockhash", vec![json!(height)]).await {
            Ok(hash) => hash,
            Err(err) if err.is_missing_entry() => return Ok(None),
            Err(err) => return Err(err),
        };
        // the block may be disconnected between the two calls
        match self
            .call::<Option<ChainEntry>>("getblockheader", vec![json!(hash), json!(true)])
            .await
        {
            Ok(entry) => Ok(entry),
            Err(err) if err.is_missing_entry() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn mine_blocks(&self, count: u32, address: &str) -> Result<Vec<String>, Error> {
        self.call("generatetoaddress", vec![json!(count), json!(address)])
            .await
    }

    async fn invalidate_block(&self, hash: &str) -> Result<(), Error> {
        let _: Value = self.call("invalidateblock", vec![json!(hash)]).await?;
        Ok(())
    }

    async fn grind_name(&self, length: usize) -> Result<String, Error> {
        self.call("grindname", vec![json!(length)]).await
    }

    async fn get_name_info(&self, name: &str) -> Result<Option<NameStatus>, Error> {
        let response: NameInfoResponse = self.call("getnameinfo", vec![json!(name)]).await?;
        Ok(response.info)
    }

    async fn get_mempool(&self) -> Result<Vec<String>, Error> {
        self.call("getrawmempool", vec![]).await
    }

    async fn get_raw_block(&self, hash: &str) -> Result<String, Error> {
        self.call("getblock", vec![json!(hash), json!(false)]).await
    }

    async fn submit_block(&self, raw: &str) -> Result<(), Error> {
        let outcome: Option<String> = self.call("submitblock", vec![json!(raw)]).await?;
        match outcome.as_deref() {
            None | Some("duplicate") | Some("inconclusive") => Ok(()),
            Some(reason) => Err(Error::BlockRejected(reason.to_string())),
        }
    }
}
