use crate::connection::GatewayConnection;
use crate::protocol::GatewayRequest;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Sent well inside the gateway's usual 60 second inactivity window.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(25);

impl GatewayConnection {
    /// Sends a single keepalive. Returns true on success, false on failure.
    async fn send_keepalive(&self, session_id: u64) -> bool {
        debug!(target: "Client/Keepalive", "Sending keepalive for session {session_id}");
        match self.send_request(GatewayRequest::keepalive(session_id)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(target: "Client/Keepalive", "Keepalive for session {session_id} failed: {e}");
                false
            }
        }
    }

    pub(crate) async fn start_keepalive(self: &Arc<Self>, session_id: u64) {
        let this = self.clone();
        let task = tokio::spawn(async move { this.keepalive_loop(session_id).await });
        if let Some(previous) = self.keepalive_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub(crate) async fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive_task.lock().await.take() {
            debug!(target: "Client/Keepalive", "Stopping keepalive");
            task.abort();
        }
    }

    pub fn has_keepalive(&self) -> bool {
        self.keepalive_task
            .try_lock()
            .is_ok_and(|guard| guard.is_some())
    }

    /// Runs until the link closes or the session it was started for is gone.
    async fn keepalive_loop(self: Arc<Self>, session_id: u64) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.keepalive_interval) => {
                    if !self.is_connected() {
                        debug!(target: "Client/Keepalive", "Not connected, exiting keepalive loop.");
                        return;
                    }
                    let alive = self
                        .session()
                        .await
                        .is_some_and(|s| s.session_id == session_id && s.alive);
                    if !alive {
                        debug!(target: "Client/Keepalive", "Session {session_id} gone, exiting keepalive loop.");
                        return;
                    }
                    // The outcome never changes call state; a dead session
                    // shows up as a server `timeout` instead.
                    if !self.send_keepalive(session_id).await {
                        info!(target: "Client/Keepalive", "Keepalive unanswered, waiting for next tick");
                    }
                },
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Client/Keepalive", "Shutdown signaled, exiting keepalive loop.");
                    return;
                }
            }
        }
    }
}
