//! Status change notifications for UI collaborators.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use sigerd_core::records::{RecordType, SyncStatus};

/// One status transition of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub client_id: String,
    pub record_type: RecordType,
    pub status: SyncStatus,
}

/// Broadcast fan-out of record status transitions.
///
/// Slow or absent subscribers never block the sync path; the channel drops
/// the oldest updates when a receiver lags.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusUpdate>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }

    pub fn publish(&self, client_id: &str, record_type: RecordType, status: SyncStatus) {
        // Err means no subscribers; capture and sync never depend on the UI.
        let _ = self.sender.send(StatusUpdate {
            client_id: client_id.to_string(),
            record_type,
            status,
        });
    }
}
