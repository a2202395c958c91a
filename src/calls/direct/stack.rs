use crate::types::media::SessionDescription;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SipError {
    #[error("failed to reach SIP relay {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("SIP stack is not running")]
    NotStarted,

    #[error("malformed SIP message: {0}")]
    Parse(String),

    #[error("no dialog for call {0}")]
    UnknownCall(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Lifecycle notifications from a SIP stack, decoded at the boundary.
#[derive(Debug, Clone)]
pub enum StackEvent {
    Registered,
    RegistrationFailed {
        code: Option<u16>,
        reason: String,
    },
    IncomingCall {
        call_id: String,
        caller: String,
        display_name: Option<String>,
        offer: SessionDescription,
    },
    /// A provisional response to an outgoing INVITE.
    Progress { call_id: String, code: u16 },
    /// The dialog is established; outgoing calls carry the far end's answer.
    Confirmed {
        call_id: String,
        answer: Option<SessionDescription>,
    },
    /// The dialog ended normally (BYE/CANCEL either way).
    Ended {
        call_id: String,
        code: Option<u16>,
        reason: Option<String>,
    },
    /// The INVITE transaction failed with a final error response.
    Failed {
        call_id: String,
        code: u16,
        reason: Option<String>,
    },
    /// The link to the relay went away.
    Disconnected,
}

/// Registration credentials handed to [`SipStack::register`].
#[derive(Debug, Clone, Default)]
pub struct SipAccount {
    pub uri: String,
    pub secret: Option<String>,
    pub auth_user: Option<String>,
    pub display_name: Option<String>,
}

/// A SIP user agent the direct controller drives.
#[async_trait]
pub trait SipStack: Send + Sync {
    /// Connects to the relay and returns the stream of stack events.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<StackEvent>, SipError>;

    /// Sends REGISTER. The outcome arrives as [`StackEvent::Registered`] or
    /// [`StackEvent::RegistrationFailed`].
    async fn register(&self, account: &SipAccount) -> Result<(), SipError>;

    /// Sends an INVITE with `offer` and returns the new call's id.
    async fn invite(&self, target: &str, offer: &SessionDescription) -> Result<String, SipError>;

    /// Answers a ringing inbound call with 200 OK.
    async fn answer(&self, call_id: &str, answer: &SessionDescription) -> Result<(), SipError>;

    /// Rejects a ringing inbound call with `code`.
    async fn reject(&self, call_id: &str, code: u16) -> Result<(), SipError>;

    /// CANCEL before the dialog is established, BYE after.
    async fn terminate(&self, call_id: &str) -> Result<(), SipError>;

    async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<(), SipError>;

    async fn stop(&self);
}
