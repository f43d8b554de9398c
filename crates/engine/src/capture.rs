//! Capture service: the local-first API the field app talks to.
//!
//! Every operation here completes against the local store without touching
//! the network, so capture keeps working with zero connectivity. Operations
//! that make a record eligible for upload nudge the scheduler; the nudge is
//! fire-and-forget and never blocks the caller.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use sigerd_core::records::{FieldRecord, RecordType, SyncStatus};
use sigerd_core::sync::SyncTrigger;
use sigerd_core::{Error, Result};
use sigerd_storage_sqlite::{CaptureStoreRepository, RecordFilter};

use crate::config::EngineConfig;
use crate::status::{StatusBroadcaster, StatusUpdate};

pub struct CaptureService {
    store: Arc<CaptureStoreRepository>,
    status: StatusBroadcaster,
    trigger_tx: mpsc::UnboundedSender<SyncTrigger>,
    auto_queue: bool,
}

impl CaptureService {
    pub fn new(
        store: Arc<CaptureStoreRepository>,
        status: StatusBroadcaster,
        trigger_tx: mpsc::UnboundedSender<SyncTrigger>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            status,
            trigger_tx,
            auto_queue: config.auto_queue,
        }
    }

    fn nudge(&self) {
        let _ = self.trigger_tx.send(SyncTrigger::RecordQueued);
    }

    fn require(&self, client_id: &str) -> Result<FieldRecord> {
        self.store
            .find(client_id)?
            .ok_or_else(|| Error::not_found(client_id))
    }

    /// Create a new record. With `auto_queue` enabled the record is queued
    /// for upload immediately; otherwise it stays a draft until
    /// [`submit`](Self::submit).
    pub fn create(&self, record_type: RecordType, payload: Value) -> Result<FieldRecord> {
        if !payload.is_object() {
            return Err(Error::validation("Record payload must be a JSON object"));
        }

        let mut record = FieldRecord::new_draft(record_type, payload);
        self.store.put(&record)?;
        self.status
            .publish(&record.client_id, record_type, SyncStatus::Draft);
        debug!(
            "[Capture] Created {:?} draft {}",
            record_type, record.client_id
        );

        if self.auto_queue {
            self.store.mark_queued(record_type, &record.client_id)?;
            record.status = SyncStatus::Queued;
            self.status
                .publish(&record.client_id, record_type, SyncStatus::Queued);
            self.nudge();
        }
        Ok(record)
    }

    /// Replace the payload of a draft or conflicted record.
    pub fn update_payload(&self, client_id: &str, payload: Value) -> Result<()> {
        if !payload.is_object() {
            return Err(Error::validation("Record payload must be a JSON object"));
        }
        let record = self.require(client_id)?;
        if !self
            .store
            .update_payload(record.record_type, client_id, &payload)?
        {
            return Err(Error::invalid_transition(format!(
                "Record {} is {:?}; only draft or conflict records can be edited",
                client_id, record.status
            )));
        }
        Ok(())
    }

    /// Submit a draft for upload: `draft -> queued`.
    pub fn submit(&self, client_id: &str) -> Result<()> {
        let record = self.require(client_id)?;
        if !self.store.mark_queued(record.record_type, client_id)? {
            return Err(Error::invalid_transition(format!(
                "Record {} is {:?}; only drafts can be submitted",
                client_id, record.status
            )));
        }
        self.status
            .publish(client_id, record.record_type, SyncStatus::Queued);
        self.nudge();
        Ok(())
    }

    /// Operator chose the local version of a conflicted record. The retained
    /// remote observation lets the next attempt pass the divergence check.
    pub fn resolve_keep_local(&self, client_id: &str) -> Result<()> {
        let record = self.require(client_id)?;
        if !self
            .store
            .requeue_after_conflict(record.record_type, client_id)?
        {
            return Err(Error::invalid_transition(format!(
                "Record {} is {:?}; only conflicted records can be resolved",
                client_id, record.status
            )));
        }
        self.status
            .publish(client_id, record.record_type, SyncStatus::Queued);
        self.nudge();
        Ok(())
    }

    /// Operator chose the remote version of a conflicted record; no upload
    /// follows.
    pub fn resolve_accept_remote(&self, client_id: &str) -> Result<()> {
        let record = self.require(client_id)?;
        if !self.store.accept_remote(record.record_type, client_id)? {
            return Err(Error::invalid_transition(format!(
                "Record {} is {:?}; only conflicted records can be resolved",
                client_id, record.status
            )));
        }
        self.status
            .publish(client_id, record.record_type, SyncStatus::Synced);
        Ok(())
    }

    /// Put a permanently failed record back in the queue after the operator
    /// corrected the underlying cause.
    pub fn resubmit_failed(&self, client_id: &str) -> Result<()> {
        let record = self.require(client_id)?;
        if !self.store.resubmit_failed(record.record_type, client_id)? {
            return Err(Error::invalid_transition(format!(
                "Record {} is {:?}; only failed records can be resubmitted",
                client_id, record.status
            )));
        }
        self.status
            .publish(client_id, record.record_type, SyncStatus::Queued);
        self.nudge();
        Ok(())
    }

    /// Delete a record locally. Only `synced` and `failed` records may be
    /// discarded; everything else still represents unconfirmed field data.
    pub fn discard(&self, client_id: &str) -> Result<()> {
        let record = self.require(client_id)?;
        match record.status {
            SyncStatus::Synced | SyncStatus::Failed => {
                self.store.delete(record.record_type, client_id)?;
                Ok(())
            }
            status => Err(Error::invalid_transition(format!(
                "Record {} is {:?} and cannot be discarded",
                client_id, status
            ))),
        }
    }

    pub fn get(&self, client_id: &str) -> Result<Option<FieldRecord>> {
        self.store.find(client_id)
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<FieldRecord>> {
        self.store.list(filter)
    }

    /// Records awaiting upload or operator attention, per status.
    pub fn pending_counts(&self) -> Result<HashMap<SyncStatus, i64>> {
        self.store.pending_counts()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status.subscribe()
    }
}
