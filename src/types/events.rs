use crate::calls::media::RemoteTrack;
use crate::calls::CallState;
use crate::types::media::SessionDescription;
use log::debug;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Call-lifecycle notifications shared by both call controllers.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Registered {
        uri: String,
    },
    RegistrationFailed {
        code: Option<u16>,
        reason: String,
    },
    SignalingError {
        code: Option<i64>,
        reason: String,
    },
    Calling {
        target: String,
    },
    Proceeding {
        code: Option<u16>,
    },
    Ringing,
    IncomingCall {
        caller: String,
        display_name: Option<String>,
        offer: Option<SessionDescription>,
    },
    Accepted,
    Ended {
        code: Option<u16>,
        reason: String,
    },
    /// Remote audio is available.
    Track(RemoteTrack),
    SessionTimedOut {
        session_id: u64,
    },
    StateChanged(CallState),
}

/// Discriminant of [`CallEvent`], used to subscribe to one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Registered,
    RegistrationFailed,
    SignalingError,
    Calling,
    Proceeding,
    Ringing,
    IncomingCall,
    Accepted,
    Ended,
    Track,
    SessionTimedOut,
    StateChanged,
}

impl CallEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Registered { .. } => EventKind::Registered,
            Self::RegistrationFailed { .. } => EventKind::RegistrationFailed,
            Self::SignalingError { .. } => EventKind::SignalingError,
            Self::Calling { .. } => EventKind::Calling,
            Self::Proceeding { .. } => EventKind::Proceeding,
            Self::Ringing => EventKind::Ringing,
            Self::IncomingCall { .. } => EventKind::IncomingCall,
            Self::Accepted => EventKind::Accepted,
            Self::Ended { .. } => EventKind::Ended,
            Self::Track(_) => EventKind::Track,
            Self::SessionTimedOut { .. } => EventKind::SessionTimedOut,
            Self::StateChanged(_) => EventKind::StateChanged,
        }
    }
}

impl EventKind {
    /// The wire-style name used by the application's call-status store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::RegistrationFailed => "registration_failed",
            Self::SignalingError => "signaling_error",
            Self::Calling => "calling",
            Self::Proceeding => "proceeding",
            Self::Ringing => "ringing",
            Self::IncomingCall => "incomingcall",
            Self::Accepted => "accepted",
            Self::Ended => "ended",
            Self::Track => "track",
            Self::SessionTimedOut => "SessionTimedOut",
            Self::StateChanged => "state_changed",
        }
    }
}

/// Multi-subscriber event bus.
///
/// Every subscriber sees every event; unsubscribing is dropping the receiver
/// (or the [`Subscription`] returned by [`EventBus::on`]).
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, event: CallEvent) {
        debug!(target: "Client/Events", "Dispatching {}", event.kind().as_str());
        // No receivers is not an error: nobody is listening yet.
        let _ = self.sender.send(event);
    }

    /// Runs `handler` for every event of `kind` until the returned
    /// subscription is dropped or unsubscribed.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(CallEvent) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "Client/Events", "Subscriber for {} lagged by {skipped}", kind.as_str());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a callback registered with [`EventBus::on`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Shared handle to the bus.
pub type SharedEventBus = Arc<EventBus>;
