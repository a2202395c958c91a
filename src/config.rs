use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Public STUN server used when the configuration names none.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which call-control implementation the client drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SIP through the WebSocket signaling gateway.
    #[default]
    Gateway,
    /// SIP over WebSocket straight to a relay, with simulation fallback.
    Direct,
}

/// SIP account details, owned by the settings store and read-only here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Own address of record, e.g. `sip:2000@pbx.example.com`.
    pub uri: String,
    pub secret: Option<String>,
    pub auth_user: Option<String>,
    /// Outbound proxy, e.g. `sip:pbx.example.com:5060`.
    pub proxy: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: Backend,
    pub gateway_url: String,
    pub gateway_subprotocol: String,
    /// Shared secret attached to every gateway request, when the gateway requires one.
    pub api_secret: Option<String>,
    pub token: Option<String>,
    pub plugin: String,
    /// WebSocket address of the SIP relay used by the direct backend.
    pub sip_relay_url: Option<String>,
    pub registration: RegistrationConfig,
    pub stun_servers: Vec<String>,
    pub request_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Gateway,
            gateway_url: "ws://localhost:8188/".to_string(),
            gateway_subprotocol: crate::protocol::GATEWAY_SUBPROTOCOL.to_string(),
            api_secret: None,
            token: None,
            plugin: crate::protocol::SIP_PLUGIN.to_string(),
            sip_relay_url: None,
            registration: RegistrationConfig::default(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            request_timeout_secs: 10,
            keepalive_interval_secs: 25,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{
                "backend": "direct",
                "sip_relay_url": "wss://sip.example.com:8089/ws",
                "registration": { "uri": "sip:2000@pbx.example.com", "secret": "s3cret" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Direct);
        assert_eq!(config.registration.uri, "sip:2000@pbx.example.com");
        assert_eq!(config.registration.proxy, None);
        assert_eq!(config.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(25));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("callcore.json");
        std::fs::write(&path, r#"{ "gateway_url": "wss://gw.example.com/janus" }"#).unwrap();
        let config = ClientConfig::from_json_file(&path).unwrap();
        assert_eq!(config.gateway_url, "wss://gw.example.com/janus");
        assert_eq!(config.backend, Backend::Gateway);

        assert!(matches!(
            ClientConfig::from_json_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
