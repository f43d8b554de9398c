//! End-to-end drain flows against an in-memory remote double.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use sigerd_core::records::{
    FieldRecord, RecordType, RemoteSnapshot, SyncStatus, UpsertAck, UpsertRequest,
};
use sigerd_core::sync::{RemoteError, RemoteRecordRepository, WriteCapabilities};
use sigerd_engine::{
    AccessPolicyGateway, CredentialRefresher, EngineConfig, StatusBroadcaster, SyncEngine,
    SyncScheduler,
};
use sigerd_storage_sqlite::{create_pool, CaptureStoreRepository};

/// In-memory stand-in for the remote record repository.
#[derive(Default)]
struct MockRemote {
    rows: Mutex<HashMap<(RecordType, String), RemoteSnapshot>>,
    reachable: AtomicBool,
    hang_upserts: AtomicBool,
    upsert_calls: AtomicUsize,
    next_remote_id: AtomicUsize,
    unauthorized_queue: Mutex<VecDeque<(String, String)>>,
    rejections: Mutex<HashMap<String, (String, String)>>,
    capabilities: Mutex<WriteCapabilities>,
}

impl MockRemote {
    fn new() -> Arc<Self> {
        let remote = Self {
            reachable: AtomicBool::new(true),
            capabilities: Mutex::new(WriteCapabilities::all()),
            ..Self::default()
        };
        Arc::new(remote)
    }

    fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn set_capabilities(&self, capabilities: WriteCapabilities) {
        *self.capabilities.lock().unwrap() = capabilities;
    }

    fn queue_unauthorized(&self, code: &str, message: &str) {
        self.unauthorized_queue
            .lock()
            .unwrap()
            .push_back((code.to_string(), message.to_string()));
    }

    fn reject(&self, client_id: &str, code: &str, message: &str) {
        self.rejections.lock().unwrap().insert(
            client_id.to_string(),
            (code.to_string(), message.to_string()),
        );
    }

    fn seed_row(
        &self,
        record_type: RecordType,
        client_id: &str,
        remote_id: &str,
        remote_updated_at: chrono::DateTime<chrono::Utc>,
        payload: serde_json::Value,
    ) {
        self.rows.lock().unwrap().insert(
            (record_type, client_id.to_string()),
            RemoteSnapshot {
                remote_id: remote_id.to_string(),
                remote_updated_at,
                payload,
            },
        );
    }

    fn row(&self, record_type: RecordType, client_id: &str) -> Option<RemoteSnapshot> {
        self.rows
            .lock()
            .unwrap()
            .get(&(record_type, client_id.to_string()))
            .cloned()
    }

    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn upserts(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteRecordRepository for MockRemote {
    async fn upsert(&self, request: UpsertRequest) -> Result<UpsertAck, RemoteError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::unreachable("connection refused"));
        }
        if self.hang_upserts.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        if let Some((code, message)) = self.unauthorized_queue.lock().unwrap().pop_front() {
            return Err(RemoteError::unauthorized(code, message));
        }
        if let Some((code, message)) = self.rejections.lock().unwrap().get(&request.client_id) {
            return Err(RemoteError::rejected(code.clone(), message.clone()));
        }

        let key = (request.record_type, request.client_id.clone());
        let mut rows = self.rows.lock().unwrap();
        match rows.get(&key) {
            Some(existing) => match request.expected_remote_updated_at {
                Some(expected) if expected == existing.remote_updated_at => {}
                // Replayed submission with identical content is a no-op.
                None if existing.payload == request.payload => {
                    return Ok(UpsertAck {
                        remote_id: existing.remote_id.clone(),
                        remote_updated_at: existing.remote_updated_at,
                    });
                }
                _ => {
                    return Err(RemoteError::conflict(format!(
                        "stale expectation for {}",
                        request.client_id
                    )));
                }
            },
            None => {
                if request.expected_remote_updated_at.is_some() {
                    return Err(RemoteError::conflict(format!(
                        "no remote row for {}",
                        request.client_id
                    )));
                }
            }
        }

        let remote_id = rows
            .get(&key)
            .map(|existing| existing.remote_id.clone())
            .unwrap_or_else(|| {
                format!("srv-{}", self.next_remote_id.fetch_add(1, Ordering::SeqCst))
            });
        let remote_updated_at = Utc::now();
        rows.insert(
            key,
            RemoteSnapshot {
                remote_id: remote_id.clone(),
                remote_updated_at,
                payload: request.payload,
            },
        );
        Ok(UpsertAck {
            remote_id,
            remote_updated_at,
        })
    }

    async fn fetch_by_client_ids(
        &self,
        record_type: RecordType,
        client_ids: &[String],
    ) -> Result<HashMap<String, RemoteSnapshot>, RemoteError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::unreachable("connection refused"));
        }
        let rows = self.rows.lock().unwrap();
        Ok(client_ids
            .iter()
            .filter_map(|client_id| {
                rows.get(&(record_type, client_id.clone()))
                    .map(|snapshot| (client_id.clone(), snapshot.clone()))
            })
            .collect())
    }

    async fn delete(&self, record_type: RecordType, client_id: &str) -> Result<(), RemoteError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::unreachable("connection refused"));
        }
        self.rows
            .lock()
            .unwrap()
            .remove(&(record_type, client_id.to_string()));
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::unreachable("connection refused"))
        }
    }

    async fn capabilities(&self) -> Result<WriteCapabilities, RemoteError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::unreachable("connection refused"));
        }
        Ok(self.capabilities.lock().unwrap().clone())
    }
}

struct CountingRefresher {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    store: Arc<CaptureStoreRepository>,
    remote: Arc<MockRemote>,
    scheduler: Arc<SyncScheduler>,
    _dir: TempDir,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default(), None)
}

fn harness_with(
    config: EngineConfig,
    refresher: Option<Arc<dyn CredentialRefresher>>,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(dir.path().join("field.db").to_str().unwrap()).unwrap();
    let store = Arc::new(CaptureStoreRepository::new(Arc::new(pool)));
    let remote = MockRemote::new();
    let scheduler = SyncScheduler::new(
        Arc::clone(&store),
        remote.clone(),
        Arc::new(AccessPolicyGateway::new(refresher)),
        StatusBroadcaster::new(),
        config,
    );
    Harness {
        store,
        remote,
        scheduler,
        _dir: dir,
    }
}

fn queued_record(
    store: &CaptureStoreRepository,
    record_type: RecordType,
    payload: serde_json::Value,
) -> FieldRecord {
    let record = FieldRecord::new_draft(record_type, payload);
    store.put(&record).unwrap();
    store.mark_queued(record_type, &record.client_id).unwrap();
    store.find(&record.client_id).unwrap().unwrap()
}

#[tokio::test]
async fn queued_record_drains_to_synced() {
    let h = harness();
    let record = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 15.5, "bairro": "centro"}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(h.remote.upserts(), 1);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    assert!(stored.remote_id.is_some());
    assert!(stored.synced_at.is_some());
    assert_eq!(stored.synced_payload, Some(stored.payload.clone()));

    let row = h
        .remote
        .row(RecordType::RainfallReading, &record.client_id)
        .unwrap();
    assert_eq!(row.payload, json!({"volume_mm": 15.5, "bairro": "centro"}));
}

#[tokio::test]
async fn two_readings_become_two_remote_rows() {
    let h = harness();
    let first = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 10.0}),
    );
    let second = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 32.5}),
    );
    assert_ne!(first.client_id, second.client_id);

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 2);
    assert_eq!(h.remote.row_count(), 2);
}

#[tokio::test]
async fn unreachable_remote_requeues_with_backoff() {
    let h = harness();
    h.remote.set_reachable(false);
    let record = queued_record(
        &h.store,
        RecordType::IncidentDeclaration,
        json!({"grau": 2}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.requeued, 1);
    assert_eq!(h.remote.upserts(), 0);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Queued);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error_code.as_deref(), Some("unreachable"));
    let next_retry = stored.next_retry_at.expect("backoff scheduled");
    assert!(next_retry > Utc::now());

    // Not due yet: an immediate second pass leaves it alone.
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.attempted, 0);

    // Once due and reachable again, the retry succeeds.
    let mut due = stored.clone();
    due.next_retry_at = None;
    h.store.put(&due).unwrap();
    h.remote.set_reachable(true);
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(
        h.store
            .find(&record.client_id)
            .unwrap()
            .unwrap()
            .status,
        SyncStatus::Synced
    );
}

#[tokio::test(start_paused = true)]
async fn slow_upsert_times_out_and_requeues() {
    let mut config = EngineConfig::default();
    config.attempt_timeout_secs = 1;
    let h = harness_with(config, None);
    h.remote.hang_upserts.store(true, Ordering::SeqCst);
    let record = queued_record(&h.store, RecordType::RainfallReading, json!({"volume_mm": 1.0}));

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.requeued, 1);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Queued);
    assert_eq!(stored.last_error_code.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn diverged_unobserved_row_flags_conflict() {
    let h = harness();
    let record = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 15.5}),
    );
    // Another device already wrote different content under the same key.
    h.remote.seed_row(
        RecordType::RainfallReading,
        &record.client_id,
        "srv-9",
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        json!({"volume_mm": 3.0}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.conflicts, 1);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Conflict);
    assert_eq!(stored.conflict_payload, Some(json!({"volume_mm": 3.0})));
    assert_eq!(stored.remote_id.as_deref(), Some("srv-9"));
    // Local payload is untouched; nothing was overwritten.
    assert_eq!(stored.payload, json!({"volume_mm": 15.5}));
}

#[tokio::test]
async fn keep_local_resolution_syncs_on_next_pass() {
    let h = harness();
    let record = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 15.5}),
    );
    h.remote.seed_row(
        RecordType::RainfallReading,
        &record.client_id,
        "srv-9",
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        json!({"volume_mm": 3.0}),
    );
    h.scheduler.run_drain_pass().await.unwrap();

    assert!(h
        .store
        .requeue_after_conflict(RecordType::RainfallReading, &record.client_id)
        .unwrap());
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    // The local edit won on the remote.
    let row = h
        .remote
        .row(RecordType::RainfallReading, &record.client_id)
        .unwrap();
    assert_eq!(row.payload, json!({"volume_mm": 15.5}));
}

#[tokio::test]
async fn keep_local_converges_for_previously_synced_record() {
    let h = harness();
    let t1 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let t2 = Utc.timestamp_opt(1_700_000_500, 0).unwrap();

    // Previously synced reading, edited locally while the remote side also
    // changed the same field.
    let mut record =
        FieldRecord::new_draft(RecordType::RainfallReading, json!({"volume_mm": 20.0}));
    record.status = SyncStatus::Queued;
    record.remote_id = Some("srv-1".to_string());
    record.remote_updated_at = Some(t1);
    record.synced_payload = Some(json!({"volume_mm": 15.5}));
    h.store.put(&record).unwrap();
    h.remote.seed_row(
        RecordType::RainfallReading,
        &record.client_id,
        "srv-1",
        t2,
        json!({"volume_mm": 99.0}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.conflicts, 1);

    // Operator keeps the local edit; the next pass must sync it instead of
    // re-flagging the same divergence forever.
    assert!(h
        .store
        .requeue_after_conflict(RecordType::RainfallReading, &record.client_id)
        .unwrap());
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.conflicts, 0);
    assert_eq!(summary.synced, 1);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    let row = h
        .remote
        .row(RecordType::RainfallReading, &record.client_id)
        .unwrap();
    assert_eq!(row.payload, json!({"volume_mm": 20.0}));
}

#[tokio::test]
async fn accept_remote_resolution_adopts_snapshot_without_upload() {
    let h = harness();
    let record = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 15.5}),
    );
    h.remote.seed_row(
        RecordType::RainfallReading,
        &record.client_id,
        "srv-9",
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        json!({"volume_mm": 3.0}),
    );
    h.scheduler.run_drain_pass().await.unwrap();
    let upserts_after_conflict = h.remote.upserts();

    assert!(h
        .store
        .accept_remote(RecordType::RainfallReading, &record.client_id)
        .unwrap());
    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    assert_eq!(stored.payload, json!({"volume_mm": 3.0}));
    assert!(stored.conflict_payload.is_none());

    // Nothing left to drain, nothing uploaded.
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(h.remote.upserts(), upserts_after_conflict);
}

#[tokio::test]
async fn field_level_merge_uploads_combined_payload() {
    let h = harness();
    let base = json!({"observacoes": "ok", "telefone": "111"});
    let t1 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let t2 = Utc.timestamp_opt(1_700_000_500, 0).unwrap();

    // Previously synced inspection, edited locally since.
    let mut record = FieldRecord::new_draft(
        RecordType::Inspection,
        json!({"observacoes": "trinca na parede", "telefone": "111"}),
    );
    record.status = SyncStatus::Queued;
    record.remote_id = Some("srv-1".to_string());
    record.remote_updated_at = Some(t1);
    record.synced_payload = Some(base.clone());
    h.store.put(&record).unwrap();

    // Concurrent remote edit to a different field.
    h.remote.seed_row(
        RecordType::Inspection,
        &record.client_id,
        "srv-1",
        t2,
        json!({"observacoes": "ok", "telefone": "222"}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);

    let merged = json!({"observacoes": "trinca na parede", "telefone": "222"});
    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    assert_eq!(stored.payload, merged);
    let row = h.remote.row(RecordType::Inspection, &record.client_id).unwrap();
    assert_eq!(row.payload, merged);
}

#[tokio::test]
async fn equal_timestamp_with_diverged_content_flags() {
    let h = harness();
    let t1 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    let mut record =
        FieldRecord::new_draft(RecordType::RainfallReading, json!({"volume_mm": 20.0}));
    record.status = SyncStatus::Queued;
    record.remote_id = Some("srv-1".to_string());
    record.remote_updated_at = Some(t1);
    record.synced_payload = Some(json!({"volume_mm": 15.5}));
    h.store.put(&record).unwrap();

    // Same timestamp as observed, different content: clock skew.
    h.remote.seed_row(
        RecordType::RainfallReading,
        &record.client_id,
        "srv-1",
        t1,
        json!({"volume_mm": 1.0}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.conflicts, 1);
    assert_eq!(
        h.store.find(&record.client_id).unwrap().unwrap().status,
        SyncStatus::Conflict
    );
}

#[tokio::test]
async fn missing_capability_fails_without_network_traffic() {
    let h = harness();
    h.remote
        .set_capabilities(WriteCapabilities::new([RecordType::RainfallReading]));
    let record = queued_record(&h.store, RecordType::Inspection, json!({"roof": "damaged"}));

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(h.remote.upserts(), 0);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Failed);
    assert_eq!(
        stored.last_error_code.as_deref(),
        Some("capability_absent")
    );
}

#[tokio::test]
async fn expired_credential_refreshes_and_retries_once() {
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicUsize::new(0),
    });
    let h = harness_with(EngineConfig::default(), Some(refresher.clone()));
    h.remote.queue_unauthorized("jwt_expired", "JWT expired");
    let record = queued_record(
        &h.store,
        RecordType::RainfallReading,
        json!({"volume_mm": 7.0}),
    );

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(h.remote.upserts(), 2);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.store.find(&record.client_id).unwrap().unwrap().status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn rejected_record_fails_after_exactly_one_attempt() {
    let h = harness();
    let record = queued_record(
        &h.store,
        RecordType::IncidentDeclaration,
        json!({"grau": 99}),
    );
    h.remote
        .reject(&record.client_id, "validation_failed", "grau out of range");

    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(h.remote.upserts(), 1);

    let stored = h.store.find(&record.client_id).unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Failed);
    assert_eq!(
        stored.last_error_code.as_deref(),
        Some("validation_failed")
    );

    // Failed is terminal until an operator resubmits.
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(h.remote.upserts(), 1);

    assert!(h
        .store
        .resubmit_failed(RecordType::IncidentDeclaration, &record.client_id)
        .unwrap());
    h.remote.rejections.lock().unwrap().clear();
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);
}

#[tokio::test]
async fn concurrent_passes_upload_each_record_once() {
    let h = harness();
    queued_record(&h.store, RecordType::RainfallReading, json!({"volume_mm": 1.0}));
    queued_record(&h.store, RecordType::RainfallReading, json!({"volume_mm": 2.0}));

    let (a, b) = tokio::join!(h.scheduler.run_drain_pass(), h.scheduler.run_drain_pass());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.synced + b.synced, 2);
    assert_eq!(h.remote.upserts(), 2);
    assert_eq!(h.remote.row_count(), 2);
}

#[tokio::test]
async fn interrupted_records_recover_on_restart() {
    let h = harness();
    let mut record =
        FieldRecord::new_draft(RecordType::RainfallReading, json!({"volume_mm": 5.0}));
    record.status = SyncStatus::Syncing;
    h.store.put(&record).unwrap();

    assert_eq!(h.store.recover_interrupted().unwrap(), 1);
    let summary = h.scheduler.run_drain_pass().await.unwrap();
    assert_eq!(summary.synced, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_syncs_submitted_record_in_background() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(dir.path().join("field.db").to_str().unwrap()).unwrap();
    let store = Arc::new(CaptureStoreRepository::new(Arc::new(pool)));
    let remote = MockRemote::new();
    let mut config = EngineConfig::default();
    config.probe_min_interval_secs = 1;

    let engine = SyncEngine::start(Arc::clone(&store), remote.clone(), None, config);
    let capture = engine.capture();

    let record = capture
        .create(RecordType::RainfallReading, json!({"volume_mm": 42.0}))
        .unwrap();
    capture.submit(&record.client_id).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = store.find(&record.client_id).unwrap().unwrap().status;
        if status == SyncStatus::Synced {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "record stuck in {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(remote.row_count(), 1);
    engine.shutdown();
}
