use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Owned handle on a background task.
///
/// The task observes a child of the token it was spawned under. Dropping the
/// handle cancels it; [`TaskHandle::stop`] cancels and waits for it to exit.
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let join = tokio::spawn(f(token.clone()));
        Self {
            name,
            token,
            join: Some(join),
        }
    }

    /// Runs `tick` once per `period`, first after one full period.
    ///
    /// Ticks never overlap; a tick still running at cancellation is dropped.
    pub fn repeating<F, Fut>(
        name: &'static str,
        parent: &CancellationToken,
        period: Duration,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, parent, move |token| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick of an interval completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick() => {}
                }
            }
            trace!("{name} stopped");
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!("Task {} ended abnormally: {err}", self.name);
            }
        }
        debug!("Stopped {}", self.name);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
