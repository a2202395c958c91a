//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Current state of the single call a controller tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing call: request sent, nothing heard back yet.
    Calling,
    /// Incoming call: ringing locally.
    Ringing,
    /// The far end (or the local answer) is being set up.
    Proceeding,
    /// Outgoing call: the far end is alerting.
    RemoteRinging,
    Active,
    Ended,
    RegistrationFailed,
    SignalingError,
    SessionTimedOut,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Terminal and error states. The controller resets these to `Idle`
    /// straight after reporting them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::RegistrationFailed | Self::SignalingError | Self::SessionTimedOut
        )
    }

    /// A call exists: anything between leaving `Idle` and reaching a terminal state.
    pub fn in_call(&self) -> bool {
        !self.is_idle() && !self.is_terminal()
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Proceeding => "proceeding",
            Self::RemoteRinging => "remote_ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::RegistrationFailed => "registration_failed",
            Self::SignalingError => "signaling_error",
            Self::SessionTimedOut => "session_timed_out",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    Dial,
    OfferReceived,
    LocalAnswered,
    RemoteProceeding,
    RemoteRinging,
    Accepted,
    Terminated,
    RegistrationFailed,
    SignalingError,
    SessionTimedOut,
    Reset,
}

impl CallState {
    /// Returns the state `transition` leads to from `self`.
    pub fn next(self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        use CallState as S;
        use CallTransition as T;

        let next = match (self, transition) {
            (S::Idle, T::Dial) => S::Calling,
            (S::Idle, T::OfferReceived) => S::Ringing,
            (S::Ringing, T::LocalAnswered) => S::Proceeding,
            (S::Calling | S::Proceeding, T::RemoteProceeding) => S::Proceeding,
            // Late provisional responses never step back from alerting.
            (S::RemoteRinging, T::RemoteProceeding) => S::RemoteRinging,
            (S::Calling | S::Proceeding | S::RemoteRinging, T::RemoteRinging) => S::RemoteRinging,
            (S::Calling | S::Proceeding | S::RemoteRinging, T::Accepted) => S::Active,
            (state, T::Terminated) if state.in_call() => S::Ended,
            (_, T::RegistrationFailed) => S::RegistrationFailed,
            (_, T::SignalingError) => S::SignalingError,
            (_, T::SessionTimedOut) => S::SessionTimedOut,
            (state, T::Reset) if !state.in_call() => S::Idle,
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: current,
                    attempted,
                });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: CallState,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Bookkeeping for the call currently tracked by a controller.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub remote_uri: String,
    pub direction: CallDirection,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallInfo {
    pub fn new_outgoing(remote_uri: impl Into<String>) -> Self {
        Self {
            remote_uri: remote_uri.into(),
            direction: CallDirection::Outgoing,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn new_incoming(remote_uri: impl Into<String>) -> Self {
        Self {
            remote_uri: remote_uri.into(),
            direction: CallDirection::Incoming,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn mark_connected(&mut self) {
        self.connected_at.get_or_insert_with(Utc::now);
    }

    /// Seconds spent connected, if the call was ever answered.
    pub fn duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|at| Utc::now().signed_duration_since(at).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(start: CallState, steps: &[CallTransition]) -> Result<CallState, InvalidTransition> {
        steps.iter().try_fold(start, |state, t| state.next(*t))
    }

    /// Flow: Idle → Calling → Proceeding → RemoteRinging → Active → Ended → Idle
    #[test]
    fn test_outgoing_call_flow() {
        use CallTransition::*;
        let mut state = CallState::Idle;
        for (transition, expected) in [
            (Dial, CallState::Calling),
            (RemoteProceeding, CallState::Proceeding),
            (RemoteRinging, CallState::RemoteRinging),
            (RemoteProceeding, CallState::RemoteRinging),
            (Accepted, CallState::Active),
            (Terminated, CallState::Ended),
            (Reset, CallState::Idle),
        ] {
            state = state.next(transition).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_incoming_call_flow() {
        use CallTransition::*;
        let state = walk(CallState::Idle, &[OfferReceived]).unwrap();
        assert!(state.can_answer());
        let state = walk(state, &[LocalAnswered, Accepted]).unwrap();
        assert_eq!(state, CallState::Active);
    }

    #[test]
    fn test_error_exits_return_to_idle() {
        for (transition, error_state) in [
            (CallTransition::RegistrationFailed, CallState::RegistrationFailed),
            (CallTransition::SignalingError, CallState::SignalingError),
            (CallTransition::SessionTimedOut, CallState::SessionTimedOut),
        ] {
            let state = CallState::Active.next(transition).unwrap();
            assert_eq!(state, error_state);
            assert!(state.is_terminal());
            assert_eq!(state.next(CallTransition::Reset).unwrap(), CallState::Idle);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(CallState::Idle.next(CallTransition::Accepted).is_err());
        assert!(CallState::Idle.next(CallTransition::Terminated).is_err());
        assert!(CallState::Active.next(CallTransition::Dial).is_err());
        assert!(CallState::Calling.next(CallTransition::Reset).is_err());
        assert!(CallState::Calling.next(CallTransition::LocalAnswered).is_err());

        let err = CallState::Ended.next(CallTransition::Accepted).unwrap_err();
        assert_eq!(err.current_state, CallState::Ended);
        assert_eq!(err.to_string(), "invalid transition Accepted in state ended");
    }

    #[test]
    fn test_call_info_duration_only_after_connect() {
        let mut info = CallInfo::new_outgoing("sip:1001@pbx.example.com");
        assert_eq!(info.duration_secs(), None);
        info.mark_connected();
        assert!(info.duration_secs().is_some());
        assert_eq!(info.direction, CallDirection::Outgoing);
    }
}
