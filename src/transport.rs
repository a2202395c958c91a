pub use callcore_tokio_transport::{
    TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};

/// In-memory transports for tests and offline demos.
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    struct LinkState {
        sent: Mutex<Vec<String>>,
        sent_count: watch::Sender<usize>,
        events_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        connects: AtomicUsize,
        closed: AtomicBool,
        last_target: Mutex<Option<(String, Option<String>)>>,
    }

    /// Test-side view of the transports created by a [`MockTransportFactory`].
    ///
    /// Records everything the client sends and lets the test push inbound
    /// messages or a server-side close.
    #[derive(Clone)]
    pub struct MockLink {
        state: Arc<LinkState>,
    }

    impl Default for MockLink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockLink {
        pub fn new() -> Self {
            Self {
                state: Arc::new(LinkState {
                    sent: Mutex::new(Vec::new()),
                    sent_count: watch::channel(0).0,
                    events_tx: Mutex::new(None),
                    connects: AtomicUsize::new(0),
                    closed: AtomicBool::new(false),
                    last_target: Mutex::new(None),
                }),
            }
        }

        /// All messages sent so far, in send order.
        pub fn sent_messages(&self) -> Vec<String> {
            self.state.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        /// Sent messages parsed as JSON (non-JSON messages are skipped).
        pub fn sent_json(&self) -> Vec<serde_json::Value> {
            self.sent_messages()
                .iter()
                .filter_map(|m| serde_json::from_str(m).ok())
                .collect()
        }

        pub fn sent_count(&self) -> usize {
            *self.state.sent_count.borrow()
        }

        /// Subscribe to the running count of sent messages.
        pub fn watch_sent(&self) -> watch::Receiver<usize> {
            self.state.sent_count.subscribe()
        }

        /// Waits until at least `count` messages were sent, or two seconds pass.
        pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
            let mut rx = self.watch_sent();
            let _ = tokio::time::timeout(Duration::from_secs(2), async {
                while *rx.borrow_and_update() < count {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            self.sent_messages()
        }

        /// Delivers `text` to the client as if the server had sent it.
        pub async fn inject(&self, text: impl Into<String>) {
            let tx = self.state.events_tx.lock().ok().and_then(|g| g.clone());
            if let Some(tx) = tx {
                let _ = tx.send(TransportEvent::MessageReceived(text.into())).await;
            }
        }

        /// Simulates the server dropping the connection.
        pub async fn close_from_server(&self) {
            let tx = self.state.events_tx.lock().ok().and_then(|mut g| g.take());
            if let Some(tx) = tx {
                let _ = tx.send(TransportEvent::Disconnected).await;
            }
        }

        pub fn connect_count(&self) -> usize {
            self.state.connects.load(Ordering::SeqCst)
        }

        pub fn is_closed(&self) -> bool {
            self.state.closed.load(Ordering::SeqCst)
        }

        /// The url and subprotocol of the most recent connect attempt.
        pub fn last_target(&self) -> Option<(String, Option<String>)> {
            self.state.last_target.lock().ok().and_then(|g| g.clone())
        }

        fn record_sent(&self, text: &str) {
            if let Ok(mut sent) = self.state.sent.lock() {
                sent.push(text.to_owned());
                let len = sent.len();
                self.state.sent_count.send_replace(len);
            }
        }
    }

    /// A transport that records sent messages into its [`MockLink`].
    pub struct MockTransport {
        link: MockLink,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
            if self.link.is_closed() {
                return Err(anyhow::anyhow!("Socket is closed"));
            }
            self.link.record_sent(text);
            Ok(())
        }

        async fn disconnect(&self) {
            self.link.state.closed.store(true, Ordering::SeqCst);
            let tx = self.link.state.events_tx.lock().ok().and_then(|mut g| g.take());
            if let Some(tx) = tx {
                let _ = tx.send(TransportEvent::Disconnected).await;
            }
        }
    }

    /// A mock transport factory for testing
    #[derive(Clone, Default)]
    pub struct MockTransportFactory {
        link: MockLink,
        refuse_connections: bool,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// A factory whose every connect attempt fails, like an unreachable host.
        pub fn unreachable() -> Self {
            Self {
                link: MockLink::new(),
                refuse_connections: true,
            }
        }

        pub fn link(&self) -> MockLink {
            self.link.clone()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            url: &str,
            subprotocol: Option<&str>,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            self.link.state.connects.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut target) = self.link.state.last_target.lock() {
                *target = Some((url.to_owned(), subprotocol.map(str::to_owned)));
            }
            if self.refuse_connections {
                return Err(anyhow::anyhow!(
                    "WebSocket connect to {url} failed: connection refused"
                ));
            }

            let (tx, rx) = mpsc::channel(100);
            let _ = tx.send(TransportEvent::Connected).await;
            if let Ok(mut events_tx) = self.link.state.events_tx.lock() {
                *events_tx = Some(tx);
            }
            self.link.state.closed.store(false, Ordering::SeqCst);
            Ok((
                Arc::new(MockTransport {
                    link: self.link.clone(),
                }),
                rx,
            ))
        }
    }
}
