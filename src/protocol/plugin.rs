//! Bodies and notifications of the gateway's SIP plugin.

use crate::types::media::SessionDescription;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Plugin package name attached to the session by default.
pub const SIP_PLUGIN: &str = "janus.plugin.sip";

/// A request body for the SIP plugin, tagged by its `request` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum SipPluginRequest {
    Register {
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        authuser: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        proxy: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    Call {
        uri: String,
    },
    Accept,
    Decline {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
    },
    Hangup,
    DtmfInfo {
        digit: String,
    },
}

impl SipPluginRequest {
    pub fn to_body(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Event names the SIP plugin reports in `result.event`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PluginEventName {
    Registering,
    Registered,
    RegistrationFailed,
    Unregistering,
    Unregistered,
    Calling,
    Proceeding,
    Ringing,
    Progress,
    IncomingCall,
    Accepting,
    Accepted,
    Declining,
    Hangingup,
    Hangup,
    /// Normalized name for error outcomes that carry no explicit event.
    SignalingError,
    Other(String),
}

impl PluginEventName {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "registering" => Self::Registering,
            "registered" => Self::Registered,
            "registration_failed" => Self::RegistrationFailed,
            "unregistering" => Self::Unregistering,
            "unregistered" => Self::Unregistered,
            "calling" => Self::Calling,
            "proceeding" => Self::Proceeding,
            "ringing" => Self::Ringing,
            "progress" => Self::Progress,
            "incomingcall" => Self::IncomingCall,
            "accepting" => Self::Accepting,
            "accepted" => Self::Accepted,
            "declining" => Self::Declining,
            "hangingup" => Self::Hangingup,
            "hangup" | "ended" => Self::Hangup,
            "signaling_error" => Self::SignalingError,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::RegistrationFailed => "registration_failed",
            Self::Unregistering => "unregistering",
            Self::Unregistered => "unregistered",
            Self::Calling => "calling",
            Self::Proceeding => "proceeding",
            Self::Ringing => "ringing",
            Self::Progress => "progress",
            Self::IncomingCall => "incomingcall",
            Self::Accepting => "accepting",
            Self::Accepted => "accepted",
            Self::Declining => "declining",
            Self::Hangingup => "hangingup",
            Self::Hangup => "hangup",
            Self::SignalingError => "signaling_error",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for PluginEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded plugin notification.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    pub name: PluginEventName,
    pub result: Value,
    pub error_code: Option<i64>,
    pub error: Option<String>,
    /// Negotiation payload that arrived in the same message.
    pub jsep: Option<SessionDescription>,
}

impl PluginEvent {
    /// Extracts the event name from plugin `data`.
    ///
    /// A successful outcome names itself in `result.event`. An error outcome
    /// (nonzero `error_code`) without a name becomes
    /// [`PluginEventName::SignalingError`]. Returns `None` when neither applies.
    pub fn decode(data: &Value) -> Option<Self> {
        let result = data.get("result").cloned().unwrap_or(Value::Null);
        let error_code = data
            .get("error_code")
            .and_then(Value::as_i64)
            .filter(|code| *code != 0);
        let error = data.get("error").and_then(Value::as_str).map(str::to_owned);

        let name = match result.get("event").and_then(Value::as_str) {
            Some(name) => PluginEventName::from_wire(name),
            None if error_code.is_some() => PluginEventName::SignalingError,
            None => return None,
        };

        Some(Self {
            name,
            result,
            error_code,
            error,
            jsep: None,
        })
    }

    /// The SIP status code reported with the event, if any.
    pub fn code(&self) -> Option<u16> {
        self.result
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
    }

    /// Human-readable reason: the SIP reason phrase or the plugin error text.
    pub fn reason(&self) -> Option<String> {
        self.str_field("reason")
            .map(str::to_owned)
            .or_else(|| self.error.clone())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.result.get(key).and_then(Value::as_str)
    }
}
