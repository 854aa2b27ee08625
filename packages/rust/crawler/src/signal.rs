//! Cooperative idle waiting shared by all workers.

use std::time::Duration;

use tokio::sync::{Notify, watch};

/// Wakes idle workers on new work or shutdown, and bounds every idle wait.
#[derive(Debug)]
pub struct WorkSignal {
    notify: Notify,
    shutdown: watch::Sender<bool>,
    poll_interval: Duration,
}

impl WorkSignal {
    pub fn new(poll_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            notify: Notify::new(),
            shutdown,
            poll_interval,
        }
    }

    /// Sleep until work is announced, shutdown is requested, or the poll
    /// interval elapses. Returns immediately once shut down.
    pub async fn wait_for_work(&self) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = self.notify.notified() => {}
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    /// Wake every worker currently idle.
    pub fn notify_work(&self) {
        self.notify.notify_waiters();
    }

    /// Ask all workers to stop after their current document.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}
