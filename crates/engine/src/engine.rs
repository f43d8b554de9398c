//! Engine facade: wires the capture service, scheduler, policy gateway and
//! reachability monitor together and owns the background tasks.

use std::sync::Arc;

use log::info;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use sigerd_core::sync::{RemoteRecordRepository, SyncTrigger};
use sigerd_core::Result;
use sigerd_storage_sqlite::CaptureStoreRepository;

use crate::capture::CaptureService;
use crate::config::EngineConfig;
use crate::policy::{AccessPolicyGateway, CredentialRefresher};
use crate::reachability::ReachabilityMonitor;
use crate::scheduler::{DrainSummary, SyncScheduler};
use crate::status::{StatusBroadcaster, StatusUpdate};

pub struct SyncEngine {
    capture: Arc<CaptureService>,
    scheduler: Arc<SyncScheduler>,
    reachability: ReachabilityMonitor,
    background: JoinHandle<()>,
    status: StatusBroadcaster,
}

impl SyncEngine {
    /// Assemble the engine and spawn its background tasks. Must be called
    /// from within a tokio runtime.
    pub fn start(
        store: Arc<CaptureStoreRepository>,
        remote: Arc<dyn RemoteRecordRepository>,
        refresher: Option<Arc<dyn CredentialRefresher>>,
        config: EngineConfig,
    ) -> Self {
        let status = StatusBroadcaster::new();
        let gateway = Arc::new(AccessPolicyGateway::new(refresher));

        let scheduler = SyncScheduler::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            gateway,
            status.clone(),
            config.clone(),
        );
        let capture = Arc::new(CaptureService::new(
            store,
            status.clone(),
            scheduler.trigger_sender(),
            &config,
        ));

        let reachability = ReachabilityMonitor::spawn(remote, config.probe_min_interval());
        let background = scheduler.spawn_background(reachability.subscribe());

        // Interrupted-record recovery runs inside the background loop; this
        // just asks for a first pass once the store is reachable.
        scheduler.trigger(SyncTrigger::Startup);
        info!("[SyncEngine] Started");

        Self {
            capture,
            scheduler,
            reachability,
            background,
            status,
        }
    }

    /// Local-first capture API.
    pub fn capture(&self) -> Arc<CaptureService> {
        Arc::clone(&self.capture)
    }

    /// Ask for a drain pass even while the store looks unreachable; the
    /// attempt itself doubles as a probe.
    pub fn sync_now(&self) {
        self.scheduler.trigger(SyncTrigger::Manual);
    }

    /// Run one drain pass inline and report what happened. Intended for
    /// tests and command-line tooling; the background loop uses the same
    /// path.
    pub async fn run_drain_pass(&self) -> Result<DrainSummary> {
        self.scheduler.run_drain_pass().await
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability.is_reachable()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status.subscribe()
    }

    /// Stop background tasks. In-flight attempts are abandoned; any record
    /// left `syncing` is requeued on the next start.
    pub fn shutdown(&self) {
        self.background.abort();
        self.reachability.stop();
        info!("[SyncEngine] Stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.background.abort();
    }
}
