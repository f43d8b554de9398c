//! Sync scheduler: drains queued records into the remote repository.
//!
//! One drain pass runs at a time; a trigger arriving mid-pass latches a
//! "run again" flag instead of starting a second pass. Within a pass,
//! uploads run with bounded parallelism, and a local claim set plus a
//! guarded DB transition enforce at most one in-flight attempt per
//! `client_id`. A record's own transitions are strictly sequential;
//! ordering across different records is not guaranteed under parallelism.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use sigerd_core::records::{FieldRecord, SyncStatus, UpsertRequest};
use sigerd_core::sync::{
    backoff_delay, classify_remote_error, resolve, RemoteError, RemoteRecordRepository,
    Resolution, RetryClass, SyncTrigger,
};
use sigerd_core::Result;
use sigerd_storage_sqlite::CaptureStoreRepository;

use crate::config::EngineConfig;
use crate::policy::{AccessPolicyGateway, UnauthorizedAction};
use crate::status::StatusBroadcaster;

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub synced: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub requeued: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced,
    Conflict,
    Failed,
    Requeued,
    Skipped,
}

pub struct SyncScheduler {
    store: Arc<CaptureStoreRepository>,
    remote: Arc<dyn RemoteRecordRepository>,
    gateway: Arc<AccessPolicyGateway>,
    status: StatusBroadcaster,
    config: EngineConfig,
    pass_mutex: tokio::sync::Mutex<()>,
    run_again: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
    trigger_tx: mpsc::UnboundedSender<SyncTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<CaptureStoreRepository>,
        remote: Arc<dyn RemoteRecordRepository>,
        gateway: Arc<AccessPolicyGateway>,
        status: StatusBroadcaster,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            remote,
            gateway,
            status,
            config,
            pass_mutex: tokio::sync::Mutex::new(()),
            run_again: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        })
    }

    /// Sender used by capture collaborators to nudge the scheduler.
    pub fn trigger_sender(&self) -> mpsc::UnboundedSender<SyncTrigger> {
        self.trigger_tx.clone()
    }

    pub fn trigger(&self, trigger: SyncTrigger) {
        let _ = self.trigger_tx.send(trigger);
    }

    /// Run one drain pass. If a pass is already running, latch "run again"
    /// and return immediately.
    pub async fn run_drain_pass(&self) -> Result<DrainSummary> {
        let _guard = match self.pass_mutex.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.run_again.store(true, Ordering::SeqCst);
                debug!("[Scheduler] Pass already active; latched run-again");
                return Ok(DrainSummary::default());
            }
        };

        let mut summary = DrainSummary::default();
        loop {
            self.run_again.store(false, Ordering::SeqCst);
            let batch = self
                .store
                .list_due_queued(Utc::now(), self.config.drain_batch)?;
            if batch.is_empty() {
                if self.run_again.load(Ordering::SeqCst) {
                    continue;
                }
                break;
            }

            debug!("[Scheduler] Draining {} record(s)", batch.len());
            let outcomes: Vec<Outcome> = stream::iter(batch)
                .map(|record| self.sync_one(record))
                .buffer_unordered(self.config.max_in_flight.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                summary.attempted += 1;
                match outcome {
                    Outcome::Synced => summary.synced += 1,
                    Outcome::Conflict => summary.conflicts += 1,
                    Outcome::Failed => summary.failed += 1,
                    Outcome::Requeued => summary.requeued += 1,
                    Outcome::Skipped => summary.skipped += 1,
                }
            }

            if !self.run_again.load(Ordering::SeqCst) {
                break;
            }
        }

        if summary.attempted > 0 {
            info!(
                "[Scheduler] Pass complete: {} synced, {} conflict(s), {} failed, {} requeued, {} skipped",
                summary.synced, summary.conflicts, summary.failed, summary.requeued, summary.skipped
            );
        }
        Ok(summary)
    }

    async fn sync_one(&self, record: FieldRecord) -> Outcome {
        let client_id = record.client_id.clone();

        {
            let mut in_flight = match self.in_flight.lock() {
                Ok(set) => set,
                Err(_) => return Outcome::Skipped,
            };
            if !in_flight.insert(client_id.clone()) {
                return Outcome::Skipped;
            }
        }

        let outcome = match self.sync_claimed(record).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("[Scheduler] Sync attempt for {} errored: {}", client_id, err);
                Outcome::Skipped
            }
        };

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&client_id);
        }
        outcome
    }

    async fn sync_claimed(&self, mut record: FieldRecord) -> Result<Outcome> {
        let record_type = record.record_type;
        let client_id = record.client_id.clone();

        if !self.store.claim_for_sync(record_type, &client_id)? {
            // Concurrently claimed or moved out of the queue.
            return Ok(Outcome::Skipped);
        }
        record.status = SyncStatus::Syncing;
        self.status
            .publish(&client_id, record_type, SyncStatus::Syncing);

        let capabilities = match self.remote.capabilities().await {
            Ok(caps) => caps,
            Err(err) => return self.requeue_transient(&record, &err.to_string(), err.error_code()),
        };
        if let Some(denial) = self.gateway.preflight(&capabilities, record_type) {
            self.store.mark_failed(
                record_type,
                &client_id,
                &denial.message(),
                denial.error_code(),
            )?;
            self.status
                .publish(&client_id, record_type, SyncStatus::Failed);
            return Ok(Outcome::Failed);
        }

        // Conflict probe for records the remote has seen before.
        let mut refreshed = false;
        if record.remote_id.is_some() || record.remote_updated_at.is_some() {
            let ids = vec![client_id.clone()];
            match self.remote.fetch_by_client_ids(record_type, &ids).await {
                Ok(snapshots) => {
                    let snapshot = snapshots.get(&client_id);
                    match resolve(&record, snapshot) {
                        Resolution::Flag => {
                            if let Some(snap) = snapshot {
                                self.store.mark_conflict(
                                    record_type,
                                    &client_id,
                                    &snap.remote_id,
                                    snap.remote_updated_at,
                                    &snap.payload,
                                )?;
                                self.status
                                    .publish(&client_id, record_type, SyncStatus::Conflict);
                                return Ok(Outcome::Conflict);
                            }
                        }
                        Resolution::ProceedMerged(merged) => {
                            if let Some(snap) = snapshot {
                                record.remote_id = Some(snap.remote_id.clone());
                                record.remote_updated_at = Some(snap.remote_updated_at);
                            }
                            record.payload = merged;
                            // Persist the merge before uploading so a crash
                            // cannot lose it.
                            self.store.put(&record)?;
                        }
                        Resolution::Proceed => {
                            if let Some(snap) = snapshot {
                                record.remote_updated_at = Some(snap.remote_updated_at);
                            }
                        }
                    }
                }
                Err(RemoteError::Unreachable(message)) => {
                    return self.requeue_transient(&record, &message, "unreachable");
                }
                Err(RemoteError::Unauthorized { code, message }) => {
                    match self
                        .gateway
                        .classify_unauthorized(&code, &message, false)
                        .await
                    {
                        UnauthorizedAction::RetryAfterRefresh => {
                            // Skip the probe; the guarded upsert detects
                            // divergence on its own.
                            refreshed = true;
                        }
                        UnauthorizedAction::Deny(denial) => {
                            return self.fail_permanent(
                                &record,
                                &denial.message(),
                                denial.error_code(),
                            );
                        }
                    }
                }
                Err(err) => {
                    return self.handle_remote_failure(&record, err);
                }
            }
        }

        self.attempt_upsert(record, refreshed).await
    }

    async fn attempt_upsert(&self, mut record: FieldRecord, mut refreshed: bool) -> Result<Outcome> {
        let record_type = record.record_type;
        let client_id = record.client_id.clone();
        let mut diverged = false;

        loop {
            let request = UpsertRequest {
                client_id: client_id.clone(),
                record_type,
                payload: record.payload.clone(),
                expected_remote_updated_at: record.remote_updated_at,
            };

            let result = tokio::time::timeout(
                self.config.attempt_timeout(),
                self.remote.upsert(request),
            )
            .await;

            match result {
                Err(_) => {
                    // In-flight work is allowed to finish on the remote; the
                    // idempotent upsert makes the retry safe either way.
                    return self.requeue_transient(&record, "Attempt timed out", "timeout");
                }
                Ok(Ok(ack)) => {
                    self.store.mark_synced(
                        record_type,
                        &client_id,
                        &ack.remote_id,
                        ack.remote_updated_at,
                        &record.payload,
                    )?;
                    self.status
                        .publish(&client_id, record_type, SyncStatus::Synced);
                    return Ok(Outcome::Synced);
                }
                Ok(Err(RemoteError::Unreachable(message))) => {
                    return self.requeue_transient(&record, &message, "unreachable");
                }
                Ok(Err(RemoteError::Unauthorized { code, message })) if !refreshed => {
                    match self
                        .gateway
                        .classify_unauthorized(&code, &message, refreshed)
                        .await
                    {
                        UnauthorizedAction::RetryAfterRefresh => {
                            refreshed = true;
                            continue;
                        }
                        UnauthorizedAction::Deny(denial) => {
                            return self.fail_permanent(
                                &record,
                                &denial.message(),
                                denial.error_code(),
                            );
                        }
                    }
                }
                Ok(Err(RemoteError::Conflict(_))) if !diverged => {
                    // Immediate fetch-and-resolve, never a blind retry.
                    diverged = true;
                    let ids = vec![client_id.clone()];
                    let snapshots = match self.remote.fetch_by_client_ids(record_type, &ids).await {
                        Ok(snapshots) => snapshots,
                        Err(err) => {
                            return self
                                .requeue_transient(&record, &err.to_string(), err.error_code());
                        }
                    };
                    let snapshot = match snapshots.get(&client_id) {
                        Some(snapshot) => snapshot,
                        None => {
                            return self.requeue_transient(
                                &record,
                                "Remote reported conflict but record is absent",
                                "conflict",
                            );
                        }
                    };
                    match resolve(&record, Some(snapshot)) {
                        Resolution::Flag => {
                            self.store.mark_conflict(
                                record_type,
                                &client_id,
                                &snapshot.remote_id,
                                snapshot.remote_updated_at,
                                &snapshot.payload,
                            )?;
                            self.status
                                .publish(&client_id, record_type, SyncStatus::Conflict);
                            return Ok(Outcome::Conflict);
                        }
                        Resolution::ProceedMerged(merged) => {
                            record.remote_id = Some(snapshot.remote_id.clone());
                            record.remote_updated_at = Some(snapshot.remote_updated_at);
                            record.payload = merged;
                            self.store.put(&record)?;
                            continue;
                        }
                        Resolution::Proceed => {
                            record.remote_id = Some(snapshot.remote_id.clone());
                            record.remote_updated_at = Some(snapshot.remote_updated_at);
                            continue;
                        }
                    }
                }
                Ok(Err(err)) => {
                    return self.handle_remote_failure(&record, err);
                }
            }
        }
    }

    /// Terminal handling for remote failures whose refresh/divergence
    /// budgets are already spent.
    fn handle_remote_failure(&self, record: &FieldRecord, error: RemoteError) -> Result<Outcome> {
        let (code, message) = match &error {
            RemoteError::Unauthorized { code, message }
            | RemoteError::Rejected { code, message } => (code.clone(), message.clone()),
            other => (other.error_code().to_string(), other.to_string()),
        };
        match classify_remote_error(&error) {
            // Divergence that persists after one resolve cycle waits for the
            // next pass with a fresh observation.
            RetryClass::Transient | RetryClass::Divergence => {
                self.requeue_transient(record, &message, &code)
            }
            RetryClass::Permission | RetryClass::Validation => {
                self.fail_permanent(record, &message, &code)
            }
        }
    }

    fn requeue_transient(
        &self,
        record: &FieldRecord,
        reason: &str,
        code: &str,
    ) -> Result<Outcome> {
        let delay = backoff_delay(record.retry_count);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.store.release_to_queued(
            record.record_type,
            &record.client_id,
            Some(next_retry_at),
            reason,
            code,
        )?;
        self.status
            .publish(&record.client_id, record.record_type, SyncStatus::Queued);
        debug!(
            "[Scheduler] Requeued {} (retry {} in {:?}): {}",
            record.client_id,
            record.retry_count + 1,
            delay,
            reason
        );
        Ok(Outcome::Requeued)
    }

    fn fail_permanent(&self, record: &FieldRecord, reason: &str, code: &str) -> Result<Outcome> {
        self.store
            .mark_failed(record.record_type, &record.client_id, reason, code)?;
        self.status
            .publish(&record.client_id, record.record_type, SyncStatus::Failed);
        warn!(
            "[Scheduler] Record {} failed permanently ({}): {}",
            record.client_id, code, reason
        );
        Ok(Outcome::Failed)
    }

    fn tick_delay(&self) -> std::time::Duration {
        let jitter_ms = if self.config.tick_jitter_secs > 0 {
            rand::thread_rng().gen_range(0..=self.config.tick_jitter_secs * 1000)
        } else {
            0
        };
        self.config.tick_interval() + std::time::Duration::from_millis(jitter_ms)
    }

    /// Spawn the background loop: wake on triggers, reachability
    /// transitions, and a coarse periodic tick.
    pub fn spawn_background(
        self: &Arc<Self>,
        reachability: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut reachability = reachability;

        tokio::spawn(async move {
            match scheduler.store.recover_interrupted() {
                Ok(0) => {}
                Ok(recovered) => info!("[Scheduler] Requeued {} interrupted record(s)", recovered),
                Err(err) => warn!("[Scheduler] Interrupted-record recovery failed: {}", err),
            }

            let mut triggers = match scheduler
                .trigger_rx
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
            {
                Some(receiver) => receiver,
                None => {
                    warn!("[Scheduler] Background loop already running");
                    return;
                }
            };

            loop {
                let tick = scheduler.tick_delay();
                tokio::select! {
                    maybe_trigger = triggers.recv() => {
                        let trigger = match maybe_trigger {
                            Some(trigger) => trigger,
                            None => break,
                        };
                        let reachable = *reachability.borrow();
                        if reachable || trigger == SyncTrigger::Manual {
                            debug!("[Scheduler] Drain pass (trigger: {:?})", trigger);
                            if let Err(err) = scheduler.run_drain_pass().await {
                                warn!("[Scheduler] Drain pass failed: {}", err);
                            }
                        } else {
                            debug!(
                                "[Scheduler] Skipping drain for {:?}: store unreachable",
                                trigger
                            );
                        }
                    }
                    changed = reachability.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *reachability.borrow() {
                            debug!(
                                "[Scheduler] Drain pass (trigger: {:?})",
                                SyncTrigger::ReachabilityRestored
                            );
                            if let Err(err) = scheduler.run_drain_pass().await {
                                warn!("[Scheduler] Drain pass failed: {}", err);
                            }
                        }
                    }
                    _ = tokio::time::sleep(tick) => {
                        let cutoff = scheduler.config.retention_cutoff(Utc::now());
                        match scheduler.store.purge_synced_before(cutoff) {
                            Ok(0) => {}
                            Ok(purged) => {
                                info!("[Scheduler] Purged {} record(s) past retention", purged)
                            }
                            Err(err) => warn!("[Scheduler] Retention purge failed: {}", err),
                        }
                        if *reachability.borrow() {
                            debug!(
                                "[Scheduler] Drain pass (trigger: {:?})",
                                SyncTrigger::Periodic
                            );
                            if let Err(err) = scheduler.run_drain_pass().await {
                                warn!("[Scheduler] Drain pass failed: {}", err);
                            }
                        }
                    }
                }
            }
        })
    }
}
