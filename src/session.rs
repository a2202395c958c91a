use crate::connection::GatewayConnection;
use crate::protocol::GatewayRequest;
use crate::request::RequestError;
use crate::types::events::CallEvent;
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("already connected")]
    AlreadyConnected,
    #[error("no signaling session")]
    NoSession,
    #[error("gateway reply to {0} carried no id")]
    MissingId(&'static str),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// A signaling session on the gateway and the plugin handle attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub session_id: u64,
    /// Only meaningful while `session_id` is.
    pub handle_id: Option<u64>,
    pub alive: bool,
}

impl GatewayConnection {
    /// Creates a session and starts its keepalive.
    pub async fn create_session(self: &Arc<Self>) -> Result<u64, SessionError> {
        let response = self.send_request(GatewayRequest::create()).await?;
        let session_id = response
            .created_id()
            .ok_or(SessionError::MissingId("create"))?;

        *self.session.lock().await = Some(Session {
            session_id,
            handle_id: None,
            alive: true,
        });
        info!(target: "Client/Session", "Created session {session_id}");
        self.start_keepalive(session_id).await;
        Ok(session_id)
    }

    /// Attaches `plugin` to the current session and records the handle.
    pub async fn attach_plugin(&self, plugin: &str) -> Result<u64, SessionError> {
        let session_id = self.session_id().await.ok_or(SessionError::NoSession)?;
        let response = self
            .send_request(GatewayRequest::attach(session_id, plugin))
            .await?;
        let handle_id = response
            .created_id()
            .ok_or(SessionError::MissingId("attach"))?;

        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) if session.session_id == session_id => {
                session.handle_id = Some(handle_id);
                info!(target: "Client/Session", "Attached {plugin} as handle {handle_id}");
                Ok(handle_id)
            }
            // The session died while the attach was in flight.
            _ => Err(SessionError::NoSession),
        }
    }

    /// Destroys the session on the server (best effort) and locally.
    pub async fn destroy_session(&self) {
        let Some(session_id) = self.session_id().await else {
            return;
        };
        self.stop_keepalive().await;
        *self.session.lock().await = None;
        if let Err(e) = self.send_request(GatewayRequest::destroy(session_id)).await {
            debug!(target: "Client/Session", "Destroy of session {session_id} failed: {e}");
        }
    }

    pub async fn session(&self) -> Option<Session> {
        *self.session.lock().await
    }

    pub async fn session_id(&self) -> Option<u64> {
        self.session.lock().await.map(|s| s.session_id)
    }

    /// Session and handle ids, when both exist.
    pub async fn handle(&self) -> Option<(u64, u64)> {
        self.session
            .lock()
            .await
            .and_then(|s| s.handle_id.map(|h| (s.session_id, h)))
    }

    /// Reacts to a server `timeout` notification.
    ///
    /// Returns `true` if it named the current session, which is then
    /// forgotten, its keepalive stopped and `SessionTimedOut` raised. Nothing
    /// is re-created.
    pub(crate) async fn handle_session_timeout(&self, session_id: Option<u64>) -> bool {
        let mut guard = self.session.lock().await;
        let current = match *guard {
            Some(session) if Some(session.session_id) == session_id => session.session_id,
            _ => return false,
        };
        *guard = None;
        drop(guard);

        self.stop_keepalive().await;
        warn!(target: "Client/Session", "Session {current} destroyed by the server");
        self.events.dispatch(CallEvent::SessionTimedOut {
            session_id: current,
        });
        true
    }
}
