//! Wire formats of the signaling gateway.
//!
//! The gateway speaks JSON over a WebSocket negotiated with the
//! `janus-protocol` subprotocol. Core requests create and keep alive a
//! session and attach a plugin handle; call control happens through
//! `message` requests whose `body` is a [`SipPluginRequest`].

pub mod envelope;
pub mod plugin;

pub use envelope::{GatewayMessage, GatewayRequest, MessageKind, RequestKind};
pub use plugin::{PluginEvent, PluginEventName, SIP_PLUGIN, SipPluginRequest};

/// WebSocket subprotocol identifier of the gateway API.
pub const GATEWAY_SUBPROTOCOL: &str = "janus-protocol";
