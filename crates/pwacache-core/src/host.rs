//! Page host seam and the update notice handed to the UI.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::worker::LifecycleController;

/// The page hosting the app.
pub trait PageHost: Send + Sync {
    /// Reload the page so it runs under the current worker.
    fn reload(&self);
}

/// Host that forwards reload requests over a channel.
///
/// The receiving side decides what a reload means (the CLI re-boots).
#[derive(Debug, Clone)]
pub struct ChannelPageHost {
    tx: mpsc::UnboundedSender<()>,
}

impl ChannelPageHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PageHost for ChannelPageHost {
    fn reload(&self) {
        info!("Page reload requested");
        if self.tx.send(()).is_err() {
            warn!("Page reload requested but no host is listening");
        }
    }
}

/// "A new version is available" notice.
///
/// Its only action is [`apply`](Self::apply): adopt the waiting worker and
/// reload.
#[derive(Clone)]
pub struct UpdateNotice {
    controller: Arc<LifecycleController>,
}

impl UpdateNotice {
    pub(crate) fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    pub async fn apply(self) {
        if let Err(e) = self.controller.request_adoption().await {
            warn!(error = %e, "Could not adopt waiting worker");
        }
        self.controller.reload_once();
    }
}

impl fmt::Debug for UpdateNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateNotice")
            .field("scope", &self.controller.scope().as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_host_forwards_reloads() {
        let (host, mut rx) = ChannelPageHost::new();
        host.reload();
        host.reload();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_channel_host_without_listener_does_not_panic() {
        let (host, rx) = ChannelPageHost::new();
        drop(rx);
        host.reload();
    }
}
