use super::error::CallError;
use super::state::CallState;
use crate::types::events::{CallEvent, EventBus, EventKind, Subscription};
use crate::types::media::SessionDescription;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::broadcast;

/// The call-control contract shared by the gateway and direct backends.
///
/// Outcomes that arrive later (ringing, answer, far-end hangup) are reported
/// as [`CallEvent`]s on [`CallControl::events`], never as return values.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Registers the configured account.
    async fn register(&self) -> Result<(), CallError>;

    /// Places a call to `target`, capturing from `device_id` or the default input.
    async fn call(&self, target: &str, device_id: Option<&str>) -> Result<(), CallError>;

    /// Answers the ringing call. `offer` defaults to the one carried by
    /// the `IncomingCall` event.
    async fn answer(
        &self,
        offer: Option<SessionDescription>,
        device_id: Option<&str>,
    ) -> Result<(), CallError>;

    /// Rejects the ringing call. Outside of ringing it behaves as [`hangup`](Self::hangup).
    async fn decline(&self) -> Result<(), CallError>;

    /// Ends the call and releases media. A no-op when idle.
    async fn hangup(&self) -> Result<(), CallError>;

    /// Gates outgoing audio.
    async fn mute(&self, muted: bool) -> Result<(), CallError>;

    /// Sends one DTMF digit (`0-9`, `*`, `#`, `A-D`).
    async fn send_tone(&self, digit: char) -> Result<(), CallError>;

    /// Replaces the microphone with `path` and hangs up when it finishes.
    async fn inject_audio_file(&self, path: &Path) -> Result<(), CallError>;

    async fn state(&self) -> CallState;

    /// Releases the call, the registration and the link.
    async fn shutdown(&self);

    fn events(&self) -> &EventBus;

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events().subscribe()
    }

    fn on(&self, kind: EventKind, handler: Box<dyn Fn(CallEvent) + Send + Sync>) -> Subscription {
        self.events().on(kind, handler)
    }
}

pub(crate) fn validate_tone(digit: char) -> Result<char, CallError> {
    let digit = digit.to_ascii_uppercase();
    if digit.is_ascii_digit() || matches!(digit, '*' | '#' | 'A'..='D') {
        Ok(digit)
    } else {
        Err(CallError::InvalidTone(digit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_tone() {
        assert_eq!(validate_tone('5').unwrap(), '5');
        assert_eq!(validate_tone('b').unwrap(), 'B');
        assert_eq!(validate_tone('#').unwrap(), '#');
        assert!(matches!(validate_tone('x'), Err(CallError::InvalidTone('X'))));
        assert!(validate_tone('E').is_err());
    }
}
