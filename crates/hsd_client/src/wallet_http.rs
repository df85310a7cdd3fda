use crate::{AccountInfo, Coin, Error, Output, Transition, TxResult, WalletService};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tracing::*;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

/// REST handle on the wallet plugin of a node.
#[derive(Clone)]
pub struct WalletClient {
    http: Client<HttpConnector>,
    base_url: String,
    auth: Option<String>,
}

impl WalletClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: api_key.map(basic_auth),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, Error> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/json");
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.as_str());
        }
        let body = match body {
            Some(json) => Body::from(serde_json::to_vec(&json)?),
            None => Body::empty(),
        };

        let response = self.http.request(builder.body(body)?).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            return Err(remote_error(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn basic_auth(api_key: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("x:{api_key}")))
}

fn remote_error(status: StatusCode, body: &[u8]) -> Error {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|body| body.error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    Error::Wallet {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl WalletService for WalletClient {
    async fn create_wallet(&self, id: &str) -> Result<(), Error> {
        let _: Value = self
            .request(Method::PUT, &format!("/wallet/{id}"), Some(json!({})))
            .await?;
        Ok(())
    }

    async fn create_account(&self, id: &str, account: &str) -> Result<(), Error> {
        let _: Value = self
            .request(
                Method::PUT,
                &format!("/wallet/{id}/account/{account}"),
                Some(json!({})),
            )
            .await?;
        Ok(())
    }

    async fn create_address(&self, id: &str, account: &str) -> Result<String, Error> {
        let response: AddressResponse = self
            .request(
                Method::POST,
                &format!("/wallet/{id}/address"),
                Some(json!({ "account": account })),
            )
            .await?;
        Ok(response.address)
    }

    async fn get_account(&self, id: &str, account: &str) -> Result<AccountInfo, Error> {
        self.request(Method::GET, &format!("/wallet/{id}/account/{account}"), None)
            .await
    }

    async fn get_coins(&self, id: &str) -> Result<Vec<Coin>, Error> {
        self.request(Method::GET, &format!("/wallet/{id}/coin"), None)
            .await
    }

    async fn send_transition(
        &self,
        id: &str,
        name: &str,
        transition: &Transition,
        account: &str,
    ) -> Result<TxResult, Error> {
        transition.validate(name)?;
        debug!("{} {name} from {id}/{account}", transition.action());
        self.request(
            Method::POST,
            &format!("/wallet/{id}/{}", transition.action()),
            Some(transition.body(name, account)),
        )
        .await
    }

    async fn send(&self, id: &str, outputs: &[Output]) -> Result<TxResult, Error> {
        self.request(
            Method::POST,
            &format!("/wallet/{id}/send"),
            Some(json!({ "outputs": outputs })),
        )
        .await
    }
}
