use crate::protocol::{GatewayMessage, GatewayRequest};
use crate::transport::Transport;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;

/// Deadline applied to every request unless the broker is built with another.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Custom error types for gateway requests.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request {transaction_id} timed out")]
    Timeout { transaction_id: String },
    #[error("not connected to the signaling gateway")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gateway error {code}: {reason}")]
    Server { code: i64, reason: String },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("response channel for {0} closed unexpectedly")]
    InternalChannelClosed(String),
}

/// Correlates requests with their responses by transaction id.
///
/// Every outgoing request gets a fresh id and a pending entry; the entry is
/// removed exactly once, either when the tagged response arrives or when the
/// deadline passes. Responses may arrive in any order.
pub struct TransactionBroker {
    response_waiters: Mutex<HashMap<String, oneshot::Sender<GatewayMessage>>>,
    unique_id: String,
    id_counter: AtomicU64,
    timeout: Duration,
}

impl Default for TransactionBroker {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl TransactionBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            response_waiters: Mutex::new(HashMap::new()),
            unique_id: hex::encode(rand::random::<[u8; 4]>()),
            id_counter: AtomicU64::new(0),
            timeout,
        }
    }

    /// Generates a new unique request ID string.
    pub fn generate_request_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    /// Sends `request` over `transport` and waits for the correlated response.
    pub async fn send(
        &self,
        transport: &dyn Transport,
        mut request: GatewayRequest,
    ) -> Result<GatewayMessage, RequestError> {
        let req_id = self.generate_request_id();
        request.transaction = req_id.clone();
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.response_waiters
            .lock()
            .await
            .insert(req_id.clone(), tx);

        debug!(target: "Client/Request", "--> {:?} {}", request.kind, req_id);
        if let Err(e) = transport.send_text(&text).await {
            self.response_waiters.lock().await.remove(&req_id);
            return Err(RequestError::Transport(e.to_string()));
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some((code, reason)) = response.protocol_error() {
                    return Err(RequestError::Server { code, reason });
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(RequestError::InternalChannelClosed(req_id)),
            Err(_) => {
                self.response_waiters.lock().await.remove(&req_id);
                warn!(target: "Client/Request", "Request {req_id} timed out after {:?}", self.timeout);
                Err(RequestError::Timeout {
                    transaction_id: req_id,
                })
            }
        }
    }

    /// Hands `message` to the waiter registered for its transaction id.
    ///
    /// Returns `false` when the message has no id or the id is not pending
    /// (unknown, already resolved, or expired); such messages belong to the
    /// event router.
    pub async fn handle_response(&self, message: &GatewayMessage) -> bool {
        let Some(id) = message.transaction.as_deref() else {
            return false;
        };
        let Some(waiter) = self.response_waiters.lock().await.remove(id) else {
            return false;
        };
        if waiter.send(message.clone()).is_err() {
            warn!(target: "Client/Request", "Failed to send response to waiter for ID {id}. Receiver was likely dropped.");
        }
        true
    }

    pub async fn pending_count(&self) -> usize {
        self.response_waiters.lock().await.len()
    }

    /// Drops every pending entry; their callers observe a closed channel.
    pub async fn fail_all(&self) {
        let drained = std::mem::take(&mut *self.response_waiters.lock().await);
        if !drained.is_empty() {
            debug!(target: "Client/Request", "Failing {} pending requests", drained.len());
        }
    }
}
