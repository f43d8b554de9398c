//! Network reachability monitor.
//!
//! Reachability means a working path to the backing store confirmed by a
//! liveness probe, not merely link-layer connectivity. Probes run no faster
//! than the configured minimum interval to bound resource use on field
//! devices.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sigerd_core::sync::RemoteRecordRepository;

pub struct ReachabilityMonitor {
    receiver: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ReachabilityMonitor {
    /// Spawn the probe loop. The published state starts unreachable and
    /// only flips after a successful probe.
    pub fn spawn(remote: Arc<dyn RemoteRecordRepository>, min_interval: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut reachable = false;
            loop {
                let probe_ok = remote.probe().await.is_ok();
                if probe_ok != reachable {
                    reachable = probe_ok;
                    if reachable {
                        info!("[Reachability] Backing store reachable");
                    } else {
                        info!("[Reachability] Backing store unreachable");
                    }
                    // Receiver side dropped means the engine is shutting down.
                    if sender.send(reachable).is_err() {
                        return;
                    }
                } else {
                    debug!("[Reachability] Probe unchanged (reachable={})", reachable);
                }
                tokio::time::sleep(min_interval).await;
            }
        });

        Self { receiver, task }
    }

    /// Channel carrying the debounced reachable/unreachable signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    pub fn is_reachable(&self) -> bool {
        *self.receiver.borrow()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
