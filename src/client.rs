//! The application-facing entry point.
//!
//! A [`Client`] is created once by the application root with
//! [`Client::init`] (or [`Client::builder`] to swap out the network, media
//! or SIP seams) and torn down with [`Client::shutdown`].

use crate::calls::direct::{SipStack, WsSipStack};
use crate::calls::media::{
    AudioCapture, AudioSink, DrainSink, PeerConnectionFactory, SilenceCapture, WebRtcPeerFactory,
};
use crate::calls::{CallControl, CallError, DirectCallControl, GatewayCallControl};
use crate::config::{Backend, ClientConfig, ConfigError};
use crate::transport::{TokioWebSocketTransportFactory, TransportFactory};
use crate::types::events::{CallEvent, EventBus, EventKind, Subscription};
use log::info;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("the direct backend needs `sip_relay_url`")]
    MissingRelayUrl,
    #[error(transparent)]
    Call(#[from] CallError),
}

pub struct Client {
    config: ClientConfig,
    events: Arc<EventBus>,
    calls: Arc<dyn CallControl>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Builds a client with the default WebSocket transport, webrtc-rs media
    /// and silent capture.
    pub fn init(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder().with_config(config).build()
    }

    /// Reads the configuration from a JSON file and builds a client.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::init(ClientConfig::from_json_file(path)?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn calls(&self) -> &Arc<dyn CallControl> {
        &self.calls
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(CallEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub async fn shutdown(self) {
        info!(target: "Client", "Shutting down");
        self.calls.shutdown().await;
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    capture: Option<Arc<dyn AudioCapture>>,
    audio_sink: Option<Arc<dyn AudioSink>>,
    sip_stack: Option<Arc<dyn SipStack>>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    /// Replaces the built-in SIP-over-WebSocket stack of the direct backend.
    pub fn with_sip_stack(mut self, stack: Arc<dyn SipStack>) -> Self {
        self.sip_stack = Some(stack);
        self
    }

    /// Must be called inside a Tokio runtime: controllers spawn their workers here.
    pub fn build(self) -> Result<Client, ClientError> {
        let config = self.config.unwrap_or_default();
        let events = Arc::new(EventBus::new());
        let transport_factory = self
            .transport_factory
            .unwrap_or_else(|| Arc::new(TokioWebSocketTransportFactory::new()));
        let peer_factory = self
            .peer_factory
            .unwrap_or_else(|| Arc::new(WebRtcPeerFactory));
        let capture = self
            .capture
            .unwrap_or_else(|| Arc::new(SilenceCapture));

        let calls: Arc<dyn CallControl> = match config.backend {
            Backend::Gateway => {
                info!(target: "Client", "Using signaling gateway at {}", config.gateway_url);
                GatewayCallControl::new(
                    &config,
                    transport_factory,
                    peer_factory,
                    capture,
                    events.clone(),
                )
            }
            Backend::Direct => {
                let stack: Arc<dyn SipStack> = match self.sip_stack {
                    Some(stack) => stack,
                    None => {
                        let url = config
                            .sip_relay_url
                            .clone()
                            .ok_or(ClientError::MissingRelayUrl)?;
                        Arc::new(WsSipStack::new(url, transport_factory))
                    }
                };
                info!(target: "Client", "Using direct SIP backend");
                let sink = self.audio_sink.unwrap_or_else(|| Arc::new(DrainSink));
                DirectCallControl::new(&config, stack, peer_factory, capture, sink, events.clone())
            }
        };

        Ok(Client {
            config,
            events,
            calls,
        })
    }
}
