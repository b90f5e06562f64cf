//! Periodic update checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connectivity::Connectivity;
use crate::host::UpdateNotice;
use crate::worker::LifecycleController;

/// Default time between update checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Clears the in-flight flag when a check ends or its future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Asks the platform for a newer worker on a fixed interval while online and
/// raises an [`UpdateNotice`] when one starts waiting.
pub struct UpdatePoller {
    controller: Arc<LifecycleController>,
    connectivity: Connectivity,
    interval: Duration,
    notices: mpsc::Sender<UpdateNotice>,
    /// Result of the last completed check.
    available: AtomicBool,
    in_flight: AtomicBool,
}

impl UpdatePoller {
    pub fn new(
        controller: Arc<LifecycleController>,
        connectivity: Connectivity,
        interval: Duration,
        notices: mpsc::Sender<UpdateNotice>,
    ) -> Self {
        Self {
            controller,
            connectivity,
            interval,
            notices,
            available: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_update_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Run one update check and return whether an update is available.
    ///
    /// A check already in progress makes this a no-op. The notice is sent
    /// only when availability flips from false to true.
    pub async fn tick(&self) -> bool {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Update check still in progress, skipping tick");
            return self.is_update_available();
        }
        let in_flight = InFlight(&self.in_flight);

        let available = match self.controller.check_for_update().await {
            Ok(available) => available,
            Err(e) => {
                warn!(error = %e, "Update check failed, will retry");
                false
            }
        };
        let previous = self.available.swap(available, Ordering::SeqCst);
        drop(in_flight);

        if available && !previous {
            info!("New version available");
            let notice = UpdateNotice::new(Arc::clone(&self.controller));
            if let Err(e) = self.notices.send(notice).await {
                error!(error = %e, "Failed to send update notice - channel closed");
            }
        }
        available
    }

    /// Poll until `shutdown` fires. Polling pauses while offline.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut online = self.connectivity.subscribe();
        debug!(interval_secs = self.interval.as_secs(), "Update polling started");

        loop {
            if !*online.borrow_and_update() {
                debug!("Offline, update polling paused");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        changed = online.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if *online.borrow_and_update() {
                                break;
                            }
                        }
                    }
                }
                ticker.reset();
                debug!("Online, update polling resumed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Update polling stopped");
    }
}
