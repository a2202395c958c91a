//! JSON envelopes exchanged with the signaling gateway.

use crate::types::media::{SessionDescription, TrickleCandidate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request verbs understood by the gateway core (not the plugin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Create,
    Attach,
    Message,
    Trickle,
    Keepalive,
    Destroy,
}

/// An outgoing request envelope.
///
/// `transaction` is left empty by the constructors; the
/// [`TransactionBroker`](crate::request::TransactionBroker) fills it in.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    #[serde(rename = "janus")]
    pub kind: RequestKind,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsep: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<TrickleCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apisecret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl GatewayRequest {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            transaction: String::new(),
            session_id: None,
            handle_id: None,
            plugin: None,
            body: None,
            jsep: None,
            candidate: None,
            apisecret: None,
            token: None,
        }
    }

    pub fn create() -> Self {
        Self::new(RequestKind::Create)
    }

    pub fn attach(session_id: u64, plugin: &str) -> Self {
        Self {
            session_id: Some(session_id),
            plugin: Some(plugin.to_owned()),
            ..Self::new(RequestKind::Attach)
        }
    }

    pub fn message(
        session_id: u64,
        handle_id: u64,
        body: Value,
        jsep: Option<SessionDescription>,
    ) -> Self {
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            body: Some(body),
            jsep,
            ..Self::new(RequestKind::Message)
        }
    }

    pub fn trickle(session_id: u64, handle_id: u64, candidate: TrickleCandidate) -> Self {
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            candidate: Some(candidate),
            ..Self::new(RequestKind::Trickle)
        }
    }

    pub fn keepalive(session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::new(RequestKind::Keepalive)
        }
    }

    pub fn destroy(session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::new(RequestKind::Destroy)
        }
    }

    /// Attaches the optional shared secret and token from configuration.
    pub fn with_credentials(mut self, apisecret: Option<&str>, token: Option<&str>) -> Self {
        self.apisecret = apisecret.map(str::to_owned);
        self.token = token.map(str::to_owned);
        self
    }
}

/// The `janus` discriminator of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ack,
    Success,
    Event,
    Error,
    Timeout,
    Trickle,
    Hangup,
    Webrtcup,
    Media,
    Slowlink,
    Detached,
    Keepalive,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuccessData {
    #[serde(default)]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

/// Any message received from the gateway: responses, plugin events,
/// trickled candidates and session notifications share this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayMessage {
    #[serde(rename = "janus")]
    pub kind: MessageKind,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub session_id: Option<u64>,
    #[serde(default)]
    pub sender: Option<u64>,
    #[serde(default)]
    pub data: Option<SuccessData>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub plugindata: Option<PluginData>,
    #[serde(default)]
    pub jsep: Option<SessionDescription>,
    #[serde(default)]
    pub candidate: Option<TrickleCandidate>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GatewayMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The explicit protocol-level error carried by this message, if any:
    /// either a core `error` envelope or plugin data with a nonzero
    /// `error_code`.
    pub fn protocol_error(&self) -> Option<(i64, String)> {
        if self.kind == MessageKind::Error {
            let body = self.error.clone().unwrap_or_default();
            return Some((body.code, body.reason));
        }
        let data = &self.plugindata.as_ref()?.data;
        let code = data.get("error_code").and_then(Value::as_i64)?;
        if code == 0 {
            return None;
        }
        let reason = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Some((code, reason))
    }

    /// The id returned by a successful `create` or `attach`.
    pub fn created_id(&self) -> Option<u64> {
        self.data.as_ref().and_then(|d| d.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::media::SdpType;

    #[test]
    fn test_request_omits_absent_fields() {
        let mut req = GatewayRequest::keepalive(42);
        req.transaction = "t-1".into();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "janus": "keepalive", "transaction": "t-1", "session_id": 42 })
        );
    }

    #[test]
    fn test_message_request_carries_jsep() {
        let req = GatewayRequest::message(
            1,
            2,
            serde_json::json!({ "request": "call", "uri": "sip:1001@pbx.example.com" }),
            Some(SessionDescription::offer("v=0")),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["janus"], "message");
        assert_eq!(json["handle_id"], 2);
        assert_eq!(json["jsep"]["type"], "offer");
        assert_eq!(json["body"]["uri"], "sip:1001@pbx.example.com");
    }

    #[test]
    fn test_parse_plugin_event_with_jsep() {
        let msg = GatewayMessage::parse(
            r#"{"janus":"event","session_id":1,"sender":2,"transaction":"abc",
                "plugindata":{"plugin":"janus.plugin.sip","data":{"sip":"event","result":{"event":"accepted"}}},
                "jsep":{"type":"answer","sdp":"v=0"}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageKind::Event);
        assert_eq!(msg.jsep.as_ref().map(|j| j.kind), Some(SdpType::Answer));
        assert!(msg.protocol_error().is_none());
    }

    #[test]
    fn test_protocol_error_from_core_and_plugin() {
        let core = GatewayMessage::parse(
            r#"{"janus":"error","transaction":"x","error":{"code":458,"reason":"No such session"}}"#,
        )
        .unwrap();
        assert_eq!(core.protocol_error(), Some((458, "No such session".into())));

        let plugin = GatewayMessage::parse(
            r#"{"janus":"event","plugindata":{"plugin":"janus.plugin.sip","data":{"sip":"event","error_code":445,"error":"Missing SDP"}}}"#,
        )
        .unwrap();
        assert_eq!(plugin.protocol_error(), Some((445, "Missing SDP".into())));
    }

    #[test]
    fn test_unknown_kind_is_tolerated() {
        let msg = GatewayMessage::parse(r#"{"janus":"server_info"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Unknown);
    }
}
