//! Call control over SIP.
//!
//! Two backends implement the same [`CallControl`] contract:
//!
//! - [`GatewayCallControl`]: drives the SIP plugin of a WebRTC signaling
//!   gateway over its JSON session protocol, trickling ICE candidates
//! - [`DirectCallControl`]: speaks SIP over WebSocket to a relay itself,
//!   falling back to simulated calls when the relay is unreachable
//!
//! # Call lifecycle
//!
//! Each controller tracks a single call through [`CallState`]. Outgoing
//! calls go `Idle → Calling → Proceeding → RemoteRinging → Active`, incoming
//! ones `Idle → Ringing → Proceeding → Active`. Terminal and error states
//! are reported through [`CallEvent::StateChanged`](crate::types::events::CallEvent)
//! and immediately reset to `Idle`.

mod address;
mod control;
pub mod direct;
mod error;
mod gateway;
pub mod media;
mod state;
mod status;

pub use address::{normalize_target, proxy_host, uri_domain, uri_user};
pub use control::CallControl;
pub use direct::DirectCallControl;
pub use error::CallError;
pub use gateway::GatewayCallControl;
pub use state::{CallDirection, CallInfo, CallState, CallTransition, InvalidTransition};
pub use status::{end_reason, status_reason};
