//! Call-related error types.

use super::direct::SipError;
use super::media::MediaError;
use crate::request::RequestError;
use crate::session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("not registered: no signaling session or plugin handle")]
    NotRegistered,

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("no SIP account configured")]
    NoAccount,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("no active call")]
    NoActiveCall,

    #[error("invalid call target: {0}")]
    InvalidTarget(String),

    #[error("invalid tone: {0:?}")]
    InvalidTone(char),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("SIP error: {0}")]
    Sip(#[from] SipError),
}
