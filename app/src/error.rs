use hsd_client::Error as ClientError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while waiting for an actor to be funded.
///
/// Cloneable so that concurrent waiters on the same request can share one
/// outcome.
#[derive(Debug, Clone, Error)]
pub enum FundingError {
    #[error("Timed out after {0:?} waiting for funds")]
    Timeout(Duration),
    #[error("Funding request failed: {0}")]
    Request(Arc<ClientError>),
    #[error("Balance lookup failed: {0}")]
    Balance(Arc<ClientError>),
    #[error("Funding wait cancelled")]
    Cancelled,
}

impl FundingError {
    pub(crate) fn balance(err: ClientError) -> Self {
        FundingError::Balance(Arc::new(err))
    }
}

#[derive(Debug, Error)]
pub enum AuctionError {
    #[error("Insufficient funds to bid (confirmed balance {balance})")]
    InsufficientFunds { balance: u64 },
    #[error("Precondition violated: {0}")]
    Precondition(&'static str),
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error("Remote call failed: {0}")]
    Remote(ClientError),
    #[error("Name {0} is already held by an active auction")]
    NameInUse(String),
    #[error("No unused name found after {0} attempts")]
    NamesExhausted(u32),
    #[error("Auction closed before a bid was placed")]
    Closed,
    #[error("Name was revoked")]
    Revoked,
    #[error("Auction did not complete within {0:?}")]
    Expired(Duration),
}

impl AuctionError {
    /// Errors that end the auction instead of leaving it for the next alert.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuctionError::InsufficientFunds { .. }
                | AuctionError::Precondition(_)
                | AuctionError::Closed
                | AuctionError::Revoked
                | AuctionError::Expired(_)
        )
    }
}

impl From<ClientError> for AuctionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Precondition(reason) => AuctionError::Precondition(reason),
            other => AuctionError::Remote(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {parameter} - {reason}")]
    Invalid {
        parameter: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            parameter,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Shut down before chain height passed {threshold}")]
    SyncCancelled { threshold: u64 },
    #[error("Metrics server error: {0}")]
    Metrics(#[from] hyper::Error),
}
