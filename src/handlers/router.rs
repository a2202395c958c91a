use crate::protocol::{GatewayMessage, MessageKind, PluginEvent, PluginEventName};
use crate::types::media::{SessionDescription, TrickleCandidate};
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;

/// What a handler is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// A named plugin notification.
    Plugin(PluginEventName),
    /// A negotiation payload attached to any message.
    Negotiation,
    /// A trickled candidate relayed from the far side.
    RemoteCandidate,
    /// The gateway closed the media session of the handle.
    GatewayHangup,
    /// `webrtcup` / `media` notifications.
    MediaState,
    /// The server destroyed the session.
    SessionTimedOut,
    /// The transport link closed underneath the session.
    LinkClosed,
}

/// A demultiplexed inbound notification.
#[derive(Debug, Clone)]
pub enum RoutedEvent {
    Plugin(PluginEvent),
    Negotiation(SessionDescription),
    RemoteCandidate(TrickleCandidate),
    GatewayHangup { reason: Option<String> },
    MediaState { kind: MessageKind },
    SessionTimedOut { session_id: u64 },
    LinkClosed,
}

impl RoutedEvent {
    pub fn key(&self) -> RouteKey {
        match self {
            Self::Plugin(event) => RouteKey::Plugin(event.name.clone()),
            Self::Negotiation(_) => RouteKey::Negotiation,
            Self::RemoteCandidate(_) => RouteKey::RemoteCandidate,
            Self::GatewayHangup { .. } => RouteKey::GatewayHangup,
            Self::MediaState { .. } => RouteKey::MediaState,
            Self::SessionTimedOut { .. } => RouteKey::SessionTimedOut,
            Self::LinkClosed => RouteKey::LinkClosed,
        }
    }
}

pub type RouteHandler = Arc<dyn Fn(RoutedEvent) + Send + Sync>;

/// Central router for dispatching gateway notifications to their handlers.
///
/// Each key has at most one handler. Registering a second handler for the
/// same key replaces the first and hands it back to the caller.
pub struct EventRouter {
    handlers: DashMap<RouteKey, RouteHandler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Registers `handler` for `key`, returning the handler it replaced.
    pub fn register<F>(&self, key: RouteKey, handler: F) -> Option<RouteHandler>
    where
        F: Fn(RoutedEvent) + Send + Sync + 'static,
    {
        let previous = self.handlers.insert(key.clone(), Arc::new(handler));
        if previous.is_some() {
            info!(target: "Client/Router", "Replaced handler for {key:?}");
        }
        previous
    }

    pub fn unregister(&self, key: &RouteKey) -> Option<RouteHandler> {
        self.handlers.remove(key).map(|(_, handler)| handler)
    }

    /// Calls the handler registered for the event's key.
    ///
    /// Returns `false` (after logging) when nobody is registered.
    pub fn dispatch(&self, event: RoutedEvent) -> bool {
        let key = event.key();
        // Clone the handler out so no map shard lock is held while it runs.
        let handler = self.handlers.get(&key).map(|h| h.value().clone());
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                debug!(target: "Client/Router", "No handler for {key:?}, dropping");
                false
            }
        }
    }

    /// Applies the demultiplexing rules to one inbound message and returns
    /// how many events were dispatched.
    ///
    /// `resolved` is whether the message already completed a pending
    /// transaction; such messages are not treated as named events, but a
    /// negotiation payload or candidate they carry is still routed.
    pub fn route(&self, message: &GatewayMessage, resolved: bool) -> usize {
        let mut events = Vec::new();

        if !resolved {
            match message.kind {
                MessageKind::Event => {
                    let decoded = message
                        .plugindata
                        .as_ref()
                        .and_then(|p| PluginEvent::decode(&p.data));
                    match decoded {
                        Some(mut event) => {
                            event.jsep = message.jsep.clone();
                            events.push(RoutedEvent::Plugin(event));
                        }
                        None => debug!(target: "Client/Router", "Plugin event without a name"),
                    }
                }
                MessageKind::Hangup => events.push(RoutedEvent::GatewayHangup {
                    reason: message.reason.clone(),
                }),
                MessageKind::Webrtcup | MessageKind::Media => {
                    events.push(RoutedEvent::MediaState { kind: message.kind })
                }
                MessageKind::Timeout => {
                    if let Some(session_id) = message.session_id {
                        events.push(RoutedEvent::SessionTimedOut { session_id });
                    }
                }
                _ => {}
            }
        }

        if let Some(jsep) = &message.jsep {
            events.push(RoutedEvent::Negotiation(jsep.clone()));
        }

        if message.kind == MessageKind::Trickle
            && let Some(candidate) = &message.candidate
        {
            events.push(RoutedEvent::RemoteCandidate(candidate.clone()));
        }

        let mut dispatched = 0;
        for event in events {
            if self.dispatch(event) {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Get the number of registered handlers (useful for testing).
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_router(keys: &[RouteKey]) -> (EventRouter, Arc<Mutex<Vec<RouteKey>>>) {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for key in keys {
            let seen = seen.clone();
            router.register(key.clone(), move |event| {
                seen.lock().unwrap().push(event.key());
            });
        }
        (router, seen)
    }

    fn parse(text: &str) -> GatewayMessage {
        GatewayMessage::parse(text).unwrap()
    }

    #[test]
    fn test_register_replaces_and_returns_previous() {
        let router = EventRouter::new();
        assert!(router.register(RouteKey::Negotiation, |_| {}).is_none());
        assert!(router.register(RouteKey::Negotiation, |_| {}).is_some());
        assert_eq!(router.handler_count(), 1);
        assert!(router.unregister(&RouteKey::Negotiation).is_some());
        assert_eq!(router.handler_count(), 0);
    }

    #[test]
    fn test_accepted_with_jsep_routes_twice() {
        let accepted = RouteKey::Plugin(PluginEventName::Accepted);
        let (router, seen) = recording_router(&[accepted.clone(), RouteKey::Negotiation]);

        let msg = parse(
            r#"{"janus":"event","sender":2,
                "plugindata":{"plugin":"janus.plugin.sip","data":{"sip":"event","result":{"event":"accepted"}}},
                "jsep":{"type":"answer","sdp":"v=0"}}"#,
        );
        assert_eq!(router.route(&msg, false), 2);
        assert_eq!(*seen.lock().unwrap(), vec![accepted, RouteKey::Negotiation]);
    }

    #[test]
    fn test_resolved_message_is_not_a_named_event_but_keeps_jsep() {
        let accepted = RouteKey::Plugin(PluginEventName::Accepted);
        let (router, seen) = recording_router(&[accepted, RouteKey::Negotiation]);

        let msg = parse(
            r#"{"janus":"event","transaction":"t-1",
                "plugindata":{"plugin":"janus.plugin.sip","data":{"sip":"event","result":{"event":"accepted"}}},
                "jsep":{"type":"answer","sdp":"v=0"}}"#,
        );
        assert_eq!(router.route(&msg, true), 1);
        assert_eq!(*seen.lock().unwrap(), vec![RouteKey::Negotiation]);
    }

    #[test]
    fn test_unnamed_error_is_signaling_error() {
        let key = RouteKey::Plugin(PluginEventName::SignalingError);
        let (router, seen) = recording_router(&[key.clone()]);
        let msg = parse(
            r#"{"janus":"event","plugindata":{"plugin":"janus.plugin.sip","data":{"sip":"event","error_code":440,"error":"Missing element"}}}"#,
        );
        assert_eq!(router.route(&msg, false), 1);
        assert_eq!(*seen.lock().unwrap(), vec![key]);
    }

    #[test]
    fn test_trickle_and_unhandled_names() {
        let (router, seen) = recording_router(&[RouteKey::RemoteCandidate]);
        let trickle = parse(
            r#"{"janus":"trickle","session_id":1,"sender":2,"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 4000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        );
        assert_eq!(router.route(&trickle, false), 1);

        let unhandled = parse(
            r#"{"janus":"event","plugindata":{"plugin":"janus.plugin.sip","data":{"sip":"event","result":{"event":"registering"}}}}"#,
        );
        assert_eq!(router.route(&unhandled, false), 0);
        assert_eq!(*seen.lock().unwrap(), vec![RouteKey::RemoteCandidate]);
    }
}
