//! Access policy gateway: decides whether a remote rejection is worth
//! retrying at all.
//!
//! Three cases, three behaviors: the credential lacks the capability
//! entirely (never retry, surface to the operator), the remote denied this
//! specific record (never retry, flag for review), or the credential merely
//! expired (refresh once, retry exactly once). This classification is what
//! keeps the scheduler from busy-retrying a permanently denied write.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use sigerd_core::records::RecordType;
use sigerd_core::sync::{RemoteError, WriteCapabilities};

/// Error codes the backing store uses for an expired-but-refreshable
/// credential.
const EXPIRED_CREDENTIAL_CODES: [&str; 3] = ["jwt_expired", "token_expired", "PGRST301"];

/// Refreshes the engine's credential in place.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), RemoteError>;
}

/// Why an upsert will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDenial {
    /// The credential cannot write this record type at all.
    CapabilityAbsent { record_type: RecordType },
    /// The remote denied this specific record (e.g. already finalized).
    RecordDenied { code: String, message: String },
}

impl PolicyDenial {
    /// Operator-facing message.
    pub fn message(&self) -> String {
        match self {
            Self::CapabilityAbsent { record_type } => format!(
                "Current credential has no write access for {:?} records; escalate to the coordination team",
                record_type
            ),
            Self::RecordDenied { code, message } => {
                format!("Remote denied this record ({}): {}", code, message)
            }
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::CapabilityAbsent { .. } => "capability_absent",
            Self::RecordDenied { .. } => "record_denied",
        }
    }
}

/// What the scheduler should do with an `Unauthorized` response.
#[derive(Debug, PartialEq, Eq)]
pub enum UnauthorizedAction {
    /// Credential was refreshed; retry the upsert exactly once.
    RetryAfterRefresh,
    /// Permanent denial; record goes to `failed`.
    Deny(PolicyDenial),
}

pub struct AccessPolicyGateway {
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl AccessPolicyGateway {
    pub fn new(refresher: Option<Arc<dyn CredentialRefresher>>) -> Self {
        Self { refresher }
    }

    /// Checked before every upsert against the cached capability set, so a
    /// permanently denied record type never produces network traffic.
    pub fn preflight(
        &self,
        capabilities: &WriteCapabilities,
        record_type: RecordType,
    ) -> Option<PolicyDenial> {
        if capabilities.can_write(record_type) {
            None
        } else {
            Some(PolicyDenial::CapabilityAbsent { record_type })
        }
    }

    fn is_expired_credential(code: &str) -> bool {
        EXPIRED_CREDENTIAL_CODES
            .iter()
            .any(|known| code.eq_ignore_ascii_case(known))
    }

    /// Classify an `Unauthorized` response received mid-sync.
    ///
    /// `already_refreshed` guards the retry budget: the refresh-and-retry
    /// path runs at most once per attempt.
    pub async fn classify_unauthorized(
        &self,
        code: &str,
        message: &str,
        already_refreshed: bool,
    ) -> UnauthorizedAction {
        if Self::is_expired_credential(code) && !already_refreshed {
            if let Some(refresher) = &self.refresher {
                match refresher.refresh().await {
                    Ok(()) => {
                        debug!("[PolicyGateway] Credential refreshed after '{}'", code);
                        return UnauthorizedAction::RetryAfterRefresh;
                    }
                    Err(err) => {
                        warn!("[PolicyGateway] Credential refresh failed: {}", err);
                    }
                }
            }
        }

        UnauthorizedAction::Deny(PolicyDenial::RecordDenied {
            code: code.to_string(),
            message: message.to_string(),
        })
    }
}
