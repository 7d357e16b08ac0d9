use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Online/offline flag shared between the probe, the sync engine and the station.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            info!("Device is now {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Polls `probe` on a fixed interval and publishes the result until `shutdown`.
    pub async fn run_probe<F, Fut>(self, every: Duration, probe: F, shutdown: CancellationToken)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let online = probe().await;
                    self.set_online(online);
                }
            }
        }
    }
}
