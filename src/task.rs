//! Background periodic work.
//!
//! Every recurring job in this crate runs as a [`PeriodicTask`]: a spawned
//! loop that owns its cancellation channel and is joined on stop, so no
//! task ever outlives the component that started it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns a loop that awaits `tick` once per `period` until stopped.
    ///
    /// The first tick fires immediately.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            warn!(task = self.name, %error, "background task did not stop cleanly");
        }
    }
}
