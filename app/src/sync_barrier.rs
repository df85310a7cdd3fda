use crate::error::Error;
use crate::task::TaskHandle;
use hsd_client::ChainService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One-shot gate that opens once the chain grows past a height.
pub struct SyncBarrier {
    threshold: u64,
    released: watch::Receiver<Option<u64>>,
    _poller: TaskHandle,
}

impl SyncBarrier {
    pub fn spawn(
        chain: Arc<dyn ChainService>,
        threshold: u64,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Self {
        let (sender, released) = watch::channel(None);
        let poller = TaskHandle::spawn("sync-barrier", cancel, move |token| async move {
            let mut ticker = interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match chain.get_height().await {
                    Ok(height) if height > threshold => {
                        info!("Chain at height {height}, releasing barrier");
                        let _ = sender.send(Some(height));
                        break;
                    }
                    Ok(height) => debug!("Waiting for height {threshold}, at {height}"),
                    Err(err) => warn!("Height poll failed: {err}"),
                }
            }
        });
        Self {
            threshold,
            released,
            _poller: poller,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.borrow().is_some()
    }

    /// Height that opened the barrier.
    pub async fn wait(&self) -> Result<u64, Error> {
        let mut released = self.released.clone();
        loop {
            if let Some(height) = *released.borrow_and_update() {
                return Ok(height);
            }
            if released.changed().await.is_err() {
                // the poller stopped without releasing
                return Err(Error::SyncCancelled {
                    threshold: self.threshold,
                });
            }
        }
    }
}

/// Resolves once the chain height exceeds `threshold`.
pub async fn await_height(
    chain: Arc<dyn ChainService>,
    threshold: u64,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    SyncBarrier::spawn(chain, threshold, DEFAULT_POLL_INTERVAL, cancel)
        .wait()
        .await
}
