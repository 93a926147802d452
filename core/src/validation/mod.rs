//! Credential validation delegate
//!
//! Publishes each decrypted credential on a broadcast channel and waits a
//! bounded time for an external decision. With nobody listening, or when no
//! usable answer arrives in time, a local fallback decides instead.
//!
//! Every request carries a fresh id; answers are routed to the matching
//! waiter through a one-shot channel, so concurrent sessions never see each
//! other's decisions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::DeviceId;
use crate::message::CredentialStatus;

pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    /// How long to wait for an external decision before falling back
    pub timeout: Duration,
    /// Broadcast buffer; lagging subscribers lose the oldest requests
    pub channel_capacity: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_VALIDATION_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Published for every credential awaiting a decision
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub request_id: Uuid,
    /// Decrypted payload, hex encoded
    pub credential: String,
    /// Hex device id
    pub device_id: String,
}

/// Decision sent back by a subscriber
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationResponse {
    pub request_id: Uuid,
    pub status: String,
}

/// Local decision used when no external validator answers
pub type FallbackValidator = Arc<dyn Fn(&[u8], &DeviceId) -> CredentialStatus + Send + Sync>;

/// Fallback that grants every credential
pub fn accept_all() -> FallbackValidator {
    Arc::new(|_payload: &[u8], _device_id: &DeviceId| CredentialStatus::Success)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Malformed validation response: {0}")]
    Malformed(String),
    #[error("Unknown credential status: {0}")]
    UnknownStatus(String),
    #[error("No pending validation with id {0}")]
    UnknownRequest(Uuid),
}

pub struct ValidationDelegate {
    config: ValidationConfig,
    requests: broadcast::Sender<ValidationRequest>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CredentialStatus>>>,
    fallback: FallbackValidator,
}

impl ValidationDelegate {
    pub fn new(config: ValidationConfig) -> Self {
        Self::with_fallback(config, accept_all())
    }

    pub fn with_fallback(config: ValidationConfig, fallback: FallbackValidator) -> Self {
        let (requests, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            requests,
            pending: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Register an external validator
    pub fn subscribe(&self) -> broadcast::Receiver<ValidationRequest> {
        self.requests.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.requests.receiver_count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Decide on a decrypted credential.
    ///
    /// Returns immediately with the fallback when there are no subscribers.
    /// Otherwise waits up to the configured timeout for a correlated answer.
    pub async fn validate(&self, payload: &[u8], device_id: &DeviceId) -> CredentialStatus {
        if self.subscriber_count() == 0 {
            let status = (self.fallback)(payload, device_id);
            debug!(%device_id, %status, "No validators subscribed, using fallback");
            return status;
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let _guard = PendingGuard {
            delegate: self,
            request_id,
        };

        let request = ValidationRequest {
            request_id,
            credential: hex::encode(payload),
            device_id: device_id.to_hex(),
        };

        match self.requests.send(request) {
            Ok(receivers) => {
                info!(%request_id, %device_id, receivers, "Validation request published")
            }
            Err(_) => {
                debug!(%request_id, "Validators went away, using fallback");
                return (self.fallback)(payload, device_id);
            }
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(status)) => {
                info!(%request_id, %status, "External validation decision");
                status
            }
            Ok(Err(_)) => {
                debug!(%request_id, "Validation cancelled, using fallback");
                (self.fallback)(payload, device_id)
            }
            Err(_) => {
                let status = (self.fallback)(payload, device_id);
                warn!(
                    %request_id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    %status,
                    "Validation timed out, using fallback"
                );
                status
            }
        }
    }

    /// Deliver a decision to the waiter registered under `request_id`.
    /// Answers for expired or unknown requests are refused.
    pub fn resolve(&self, request_id: Uuid, status: CredentialStatus) -> Result<(), ResolveError> {
        let sender = self
            .pending
            .lock()
            .remove(&request_id)
            .ok_or(ResolveError::UnknownRequest(request_id))?;

        sender
            .send(status)
            .map_err(|_| ResolveError::UnknownRequest(request_id))
    }

    /// Parse and apply one JSON decision. Rejected input is logged and
    /// reported; it never disturbs outstanding requests.
    pub fn handle_response_json(&self, text: &str) -> Result<CredentialStatus, ResolveError> {
        let result = serde_json::from_str::<ValidationResponse>(text)
            .map_err(|e| ResolveError::Malformed(e.to_string()))
            .and_then(|response| {
                let status = response
                    .status
                    .parse::<CredentialStatus>()
                    .map_err(|e| ResolveError::UnknownStatus(e.0))?;
                self.resolve(response.request_id, status).map(|()| status)
            });

        if let Err(e) = &result {
            warn!(error = %e, "Ignoring validation response");
        }
        result
    }

    /// Abandon every outstanding wait; waiters fall back immediately.
    pub fn cancel_all(&self) {
        let cancelled = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if cancelled > 0 {
            info!(cancelled, "Cancelled pending validations");
        }
    }
}

impl fmt::Debug for ValidationDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationDelegate")
            .field("config", &self.config)
            .field("subscribers", &self.subscriber_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Removes a request's slot on every exit path of `validate`, including the
/// future being dropped mid-wait.
struct PendingGuard<'a> {
    delegate: &'a ValidationDelegate,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.delegate.pending.lock().remove(&self.request_id);
    }
}
