//! Level-triggered online/offline signal.
//!
//! The platform reports connectivity changes; the fetch engine reads the
//! current level per request and the update poller subscribes to pause
//! while offline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a platform online/offline event. Repeated levels are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_level_changes() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        assert!(!connectivity.is_online());
    }

    #[test]
    fn test_repeated_level_is_not_a_change() {
        let connectivity = Connectivity::new(true);
        let rx = connectivity.subscribe();
        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
