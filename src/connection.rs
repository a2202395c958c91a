use crate::config::ClientConfig;
use crate::handlers::{EventRouter, RoutedEvent};
use crate::protocol::{GatewayMessage, GatewayRequest, MessageKind};
use crate::request::{RequestError, TransactionBroker};
use crate::session::{Session, SessionError};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::EventBus;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

/// The gateway side of the client: one transport link, the transaction
/// broker, the signaling session and the event router.
pub struct GatewayConnection {
    pub(crate) url: String,
    pub(crate) subprotocol: String,
    pub(crate) apisecret: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) keepalive_interval: Duration,

    pub(crate) transport_factory: Arc<dyn TransportFactory>,
    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    pub(crate) broker: TransactionBroker,
    pub(crate) router: EventRouter,
    pub(crate) events: Arc<EventBus>,

    pub(crate) session: Mutex<Option<Session>>,
    pub(crate) keepalive_task: Mutex<Option<JoinHandle<()>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,

    pub(crate) is_connected: AtomicBool,
    pub(crate) shutdown_notifier: Notify,
}

impl GatewayConnection {
    pub fn new(
        config: &ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: config.gateway_url.clone(),
            subprotocol: config.gateway_subprotocol.clone(),
            apisecret: config.api_secret.clone(),
            token: config.token.clone(),
            keepalive_interval: config.keepalive_interval(),
            transport_factory,
            transport: Mutex::new(None),
            broker: TransactionBroker::new(config.request_timeout()),
            router: EventRouter::new(),
            events,
            session: Mutex::new(None),
            keepalive_task: Mutex::new(None),
            read_task: Mutex::new(None),
            is_connected: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        })
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn broker(&self) -> &TransactionBroker {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Opens the transport link and starts reading from it. No retries.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.is_connected() {
            return Err(SessionError::AlreadyConnected);
        }

        let subprotocol = (!self.subprotocol.is_empty()).then_some(self.subprotocol.as_str());
        let (transport, transport_events) = self
            .transport_factory
            .create_transport(&self.url, subprotocol)
            .await
            .map_err(|e| SessionError::Connect {
                url: self.url.clone(),
                reason: format!("{e:#}"),
            })?;

        *self.transport.lock().await = Some(transport);
        self.is_connected.store(true, Ordering::SeqCst);
        info!(target: "Client", "Connected to signaling gateway at {}", self.url);

        let this = self.clone();
        let task = tokio::spawn(async move { this.read_messages_loop(transport_events).await });
        *self.read_task.lock().await = Some(task);
        Ok(())
    }

    /// Closes the link and forgets the session. Pending requests fail.
    pub async fn disconnect(&self) {
        info!(target: "Client", "Disconnecting from signaling gateway.");
        self.shutdown_notifier.notify_waiters();
        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.cleanup_connection_state().await;
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
    }

    /// Sends a request through the broker, attaching configured credentials.
    pub async fn send_request(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayMessage, RequestError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(RequestError::NotConnected)?;
        let request =
            request.with_credentials(self.apisecret.as_deref(), self.token.as_deref());
        self.broker.send(transport.as_ref(), request).await
    }

    async fn read_messages_loop(self: Arc<Self>, mut transport_events: mpsc::Receiver<TransportEvent>) {
        info!(target: "Client", "Starting message processing loop...");
        while let Some(event) = transport_events.recv().await {
            match event {
                TransportEvent::MessageReceived(text) => self.process_message(&text).await,
                TransportEvent::Connected => debug!(target: "Client", "Transport connected event received"),
                TransportEvent::Disconnected => break,
            }
        }

        let had_session = self.session.lock().await.is_some();
        if self.is_connected() {
            warn!(target: "Client", "Transport disconnected unexpectedly.");
        }
        self.cleanup_connection_state().await;
        if had_session {
            self.router.dispatch(RoutedEvent::LinkClosed);
        }
    }

    /// Resolves transactions first, then hands the message to the router.
    pub(crate) async fn process_message(&self, text: &str) {
        let message = match GatewayMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "Client", "Dropping unparseable gateway message: {e}");
                return;
            }
        };
        trace!(target: "Client", "<-- {:?} {:?}", message.kind, message.transaction);

        let resolved = self.broker.handle_response(&message).await;
        if !resolved
            && message.kind == MessageKind::Timeout
            && !self.handle_session_timeout(message.session_id).await
        {
            debug!(target: "Client/Session", "Ignoring timeout for unknown session {:?}", message.session_id);
            return;
        }
        self.router.route(&message, resolved);
    }

    async fn cleanup_connection_state(&self) {
        self.is_connected.store(false, Ordering::SeqCst);
        *self.transport.lock().await = None;
        self.stop_keepalive().await;
        *self.session.lock().await = None;
        self.broker.fail_all().await;
    }
}
