//! SIP calls through the signaling gateway's SIP plugin.
//!
//! Router handlers only enqueue; a single worker task applies every inbound
//! notification, peer event and playback completion in arrival order.

use super::address::normalize_target;
use super::control::{CallControl, validate_tone};
use super::error::CallError;
use super::media::{
    AudioCapture, CallMedia, PeerConnectionFactory, PeerEvent, PeerState, WavSource,
};
use super::state::{CallInfo, CallState, CallTransition};
use super::status::{end_reason, status_reason};
use crate::config::{ClientConfig, RegistrationConfig};
use crate::connection::GatewayConnection;
use crate::handlers::{RouteKey, RoutedEvent};
use crate::protocol::{
    GatewayRequest, MessageKind, PluginEvent, PluginEventName, SipPluginRequest,
};
use crate::request::RequestError;
use crate::transport::TransportFactory;
use crate::types::events::{CallEvent, EventBus};
use crate::types::media::{IceCandidate, SessionDescription, TrickleCandidate};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

enum Input {
    Routed(RoutedEvent),
    Peer { generation: u64, event: PeerEvent },
    PlaybackFinished { generation: u64 },
}

/// The one call this controller tracks.
#[derive(Default)]
struct CallSlot {
    state: CallState,
    /// Bumped whenever media is created or released, so events from an
    /// earlier peer connection are recognised as stale.
    generation: u64,
    info: Option<CallInfo>,
    media: Option<CallMedia>,
    muted: bool,
    incoming_offer: Option<SessionDescription>,
    remote_description_applied: bool,
    pending_remote: Vec<IceCandidate>,
    /// Local candidates gathered before the call/accept request went out.
    pending_local: Vec<TrickleCandidate>,
    trickle_tx: Option<mpsc::UnboundedSender<TrickleCandidate>>,
    /// The gateway reported `webrtcup` for this call's peer connection.
    gateway_media_up: bool,
    /// Far-end notifications still owed for a call ended locally. Survives
    /// `clear_call` so a late notification cannot end the next call.
    owed_hangups: OwedHangups,
}

#[derive(Default, Clone, Copy)]
struct OwedHangups {
    plugin: bool,
    media: bool,
}

impl CallSlot {
    fn take_media(&mut self) -> Option<CallMedia> {
        self.generation += 1;
        self.media.take()
    }

    fn clear_call(&mut self) {
        self.info = None;
        self.muted = false;
        self.incoming_offer = None;
        self.remote_description_applied = false;
        self.pending_remote.clear();
        self.pending_local.clear();
        self.trickle_tx = None;
        self.gateway_media_up = false;
    }
}

async fn release(media: Option<CallMedia>) {
    if let Some(media) = media {
        media.release().await;
    }
}

pub struct GatewayCallControl {
    connection: Arc<GatewayConnection>,
    events: Arc<EventBus>,
    registration: RegistrationConfig,
    plugin: String,
    stun_servers: Vec<String>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    capture: Arc<dyn AudioCapture>,
    call: Mutex<CallSlot>,
    inbox: mpsc::UnboundedSender<Input>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GatewayCallControl {
    pub fn new(
        config: &ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn AudioCapture>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let connection = GatewayConnection::new(config, transport_factory, events.clone());
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            connection,
            events,
            registration: config.registration.clone(),
            plugin: config.plugin.clone(),
            stun_servers: config.stun_servers.clone(),
            peer_factory,
            capture,
            call: Mutex::new(CallSlot::default()),
            inbox,
            worker: std::sync::Mutex::new(None),
        });

        this.register_routes();
        let worker = tokio::spawn(Self::run(Arc::downgrade(&this), inbox_rx));
        if let Ok(mut slot) = this.worker.lock() {
            *slot = Some(worker);
        }
        this
    }

    pub fn connection(&self) -> &Arc<GatewayConnection> {
        &self.connection
    }

    fn register_routes(&self) {
        let keys = [
            RouteKey::Plugin(PluginEventName::Registered),
            RouteKey::Plugin(PluginEventName::RegistrationFailed),
            RouteKey::Plugin(PluginEventName::Calling),
            RouteKey::Plugin(PluginEventName::Proceeding),
            RouteKey::Plugin(PluginEventName::Progress),
            RouteKey::Plugin(PluginEventName::Ringing),
            RouteKey::Plugin(PluginEventName::IncomingCall),
            RouteKey::Plugin(PluginEventName::Accepted),
            RouteKey::Plugin(PluginEventName::Hangup),
            RouteKey::Plugin(PluginEventName::SignalingError),
            RouteKey::Negotiation,
            RouteKey::RemoteCandidate,
            RouteKey::GatewayHangup,
            RouteKey::MediaState,
            RouteKey::SessionTimedOut,
            RouteKey::LinkClosed,
        ];
        for key in keys {
            let inbox = self.inbox.clone();
            let _displaced = self.connection.router().register(key, move |event| {
                let _ = inbox.send(Input::Routed(event));
            });
        }
    }

    async fn run(this: Weak<Self>, mut inbox: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inbox.recv().await {
            let Some(this) = this.upgrade() else {
                break;
            };
            this.handle_input(input).await;
        }
        debug!(target: "Call/Gateway", "Controller worker stopped");
    }

    async fn handle_input(self: &Arc<Self>, input: Input) {
        match input {
            Input::Routed(RoutedEvent::Plugin(event)) => self.on_plugin_event(event).await,
            Input::Routed(RoutedEvent::Negotiation(desc)) => self.on_negotiation(desc).await,
            Input::Routed(RoutedEvent::RemoteCandidate(candidate)) => {
                self.on_remote_candidate(candidate).await
            }
            Input::Routed(RoutedEvent::GatewayHangup { reason }) => {
                if self.settle_owed(|owed| &mut owed.media).await {
                    debug!(target: "Call/Gateway", "Media hangup for the previous call, ignoring");
                    return;
                }
                self.on_remote_hangup(None, reason).await
            }
            Input::Routed(RoutedEvent::MediaState { kind }) => {
                info!(target: "Call/Gateway", "Gateway media state: {kind:?}");
                if kind == MessageKind::Webrtcup {
                    let mut slot = self.call.lock().await;
                    if slot.state.in_call() {
                        slot.gateway_media_up = true;
                    }
                }
            }
            Input::Routed(RoutedEvent::SessionTimedOut { session_id }) => {
                warn!(target: "Call/Gateway", "Session {session_id} timed out");
                self.call.lock().await.owed_hangups = OwedHangups::default();
                self.end_call(CallTransition::SessionTimedOut, None).await;
            }
            Input::Routed(RoutedEvent::LinkClosed) => {
                self.call.lock().await.owed_hangups = OwedHangups::default();
                if self.state().await.in_call() {
                    let ended = CallEvent::Ended {
                        code: None,
                        reason: "Connection lost".into(),
                    };
                    self.end_call(CallTransition::Terminated, Some(ended)).await;
                }
            }
            Input::Peer { generation, event } => self.on_peer_event(generation, event).await,
            Input::PlaybackFinished { generation } => {
                let current = {
                    let slot = self.call.lock().await;
                    slot.generation == generation && slot.state.in_call()
                };
                if current {
                    info!(target: "Call/Gateway", "Injected audio finished, hanging up");
                    if let Err(e) = self.hangup().await {
                        warn!(target: "Call/Gateway", "Hangup after playback failed: {e}");
                    }
                }
            }
        }
    }

    /// Moves the slot along `transition`, publishing the new state. Terminal
    /// states are reported and then reset to `Idle`.
    fn apply(&self, slot: &mut CallSlot, transition: CallTransition) -> bool {
        match slot.state.next(transition) {
            Ok(next) => {
                slot.state = next;
                self.events.dispatch(CallEvent::StateChanged(next));
                if next.is_terminal() {
                    slot.state = CallState::Idle;
                    slot.clear_call();
                    self.events.dispatch(CallEvent::StateChanged(CallState::Idle));
                }
                true
            }
            Err(e) => {
                debug!(target: "Call/Gateway", "Ignoring event: {e}");
                false
            }
        }
    }

    /// Consumes one owed far-end notification, returning whether it was owed.
    async fn settle_owed(&self, flag: impl FnOnce(&mut OwedHangups) -> &mut bool) -> bool {
        let mut slot = self.call.lock().await;
        std::mem::take(flag(&mut slot.owed_hangups))
    }

    /// Records that the gateway will still report the end of the current
    /// call, which is about to be ended locally.
    async fn expect_far_end_hangup(&self) {
        let mut slot = self.call.lock().await;
        slot.owed_hangups = OwedHangups {
            plugin: true,
            media: slot.gateway_media_up,
        };
    }

    /// Ends whatever call exists, reporting `event` first. Media is released
    /// after the slot lock is dropped.
    async fn end_call(&self, transition: CallTransition, event: Option<CallEvent>) {
        let media = {
            let mut slot = self.call.lock().await;
            let media = slot.take_media();
            if let Some(info) = &slot.info
                && let Some(secs) = info.duration_secs()
            {
                info!(target: "Call/Gateway", "Call with {} lasted {secs}s", info.remote_uri);
            }
            if let Some(event) = event {
                self.events.dispatch(event);
            }
            if !self.apply(&mut slot, transition) {
                slot.clear_call();
            }
            media
        };
        release(media).await;
    }

    async fn send_plugin(
        &self,
        request: SipPluginRequest,
        jsep: Option<SessionDescription>,
    ) -> Result<(), CallError> {
        let (session_id, handle_id) = self
            .connection
            .handle()
            .await
            .ok_or(CallError::NotRegistered)?;
        self.connection
            .send_request(GatewayRequest::message(
                session_id,
                handle_id,
                request.to_body(),
                jsep,
            ))
            .await?;
        Ok(())
    }

    /// Connects, creates the session and attaches the plugin, as needed.
    async fn ensure_handle(&self) -> Result<(u64, u64), CallError> {
        if !self.connection.is_connected() {
            self.connection.connect().await?;
        }
        if self.connection.session_id().await.is_none() {
            self.connection.create_session().await?;
        }
        if let Some(handle) = self.connection.handle().await {
            return Ok(handle);
        }
        self.connection.attach_plugin(&self.plugin).await?;
        self.connection.handle().await.ok_or(CallError::NotRegistered)
    }

    /// Opens media for a new call and starts forwarding its peer events.
    async fn open_media(
        &self,
        slot: &mut CallSlot,
        device_id: Option<&str>,
    ) -> Result<(), CallError> {
        let (mut media, mut peer_events) = CallMedia::open(
            self.capture.as_ref(),
            self.peer_factory.as_ref(),
            &self.stun_servers,
            device_id,
            slot.muted,
        )
        .await?;

        slot.generation += 1;
        let generation = slot.generation;
        let inbox = self.inbox.clone();
        media.track_task(tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                if inbox.send(Input::Peer { generation, event }).is_err() {
                    break;
                }
            }
        }));
        slot.media = Some(media);
        Ok(())
    }

    /// Starts trickling: queued local candidates go first, in order.
    fn open_trickle(&self, slot: &mut CallSlot, session_id: u64, handle_id: u64) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TrickleCandidate>();
        let connection = self.connection.clone();
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                let request = GatewayRequest::trickle(session_id, handle_id, candidate);
                if let Err(e) = connection.send_request(request).await {
                    warn!(target: "Call/Gateway", "Trickle failed: {e}");
                }
            }
        });
        let queued = slot.pending_local.len();
        for candidate in slot.pending_local.drain(..) {
            let _ = tx.send(candidate);
        }
        if queued > 0 {
            debug!(target: "Call/Gateway", "Flushed {queued} queued local candidates");
        }
        slot.trickle_tx = Some(tx);
    }

    /// Applies the far end's answer once per call; later deliveries are no-ops.
    async fn apply_remote_answer(&self, slot: &mut CallSlot, desc: SessionDescription) {
        if slot.remote_description_applied {
            debug!(target: "Call/Gateway", "Remote description already applied, ignoring duplicate");
            return;
        }
        let Some(peer) = slot.media.as_ref().map(CallMedia::peer) else {
            debug!(target: "Call/Gateway", "Answer without a peer connection, ignoring");
            return;
        };
        if let Err(e) = peer.set_remote_description(desc).await {
            warn!(target: "Call/Gateway", "Failed to apply remote answer: {e}");
            return;
        }
        slot.remote_description_applied = true;
        for candidate in slot.pending_remote.drain(..) {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(target: "Call/Gateway", "Failed to add buffered remote candidate: {e}");
            }
        }
    }

    async fn on_plugin_event(&self, event: PluginEvent) {
        match event.name {
            PluginEventName::Registered => {
                let uri = event
                    .str_field("username")
                    .unwrap_or(&self.registration.uri)
                    .to_owned();
                info!(target: "Call/Gateway", "Registered as {uri}");
                self.events.dispatch(CallEvent::Registered { uri });
            }
            PluginEventName::RegistrationFailed => {
                let code = event.code();
                let reason = event
                    .reason()
                    .unwrap_or_else(|| code.map_or("Registration failed", status_reason).to_owned());
                warn!(target: "Call/Gateway", "Registration failed: {code:?} {reason}");
                let failed = CallEvent::RegistrationFailed { code, reason };
                self.end_call(CallTransition::RegistrationFailed, Some(failed)).await;
            }
            PluginEventName::SignalingError => {
                let reason = event
                    .reason()
                    .unwrap_or_else(|| "Signaling error".to_owned());
                warn!(target: "Call/Gateway", "Plugin error {:?}: {reason}", event.error_code);
                let error = CallEvent::SignalingError {
                    code: event.error_code,
                    reason,
                };
                self.end_call(CallTransition::SignalingError, Some(error)).await;
            }
            PluginEventName::Proceeding | PluginEventName::Progress => {
                let code = event.code();
                let mut slot = self.call.lock().await;
                if let Some(jsep) = event.jsep.filter(SessionDescription::is_answer) {
                    self.apply_remote_answer(&mut slot, jsep).await;
                }
                if self.apply(&mut slot, CallTransition::RemoteProceeding) {
                    self.events.dispatch(CallEvent::Proceeding { code });
                }
            }
            PluginEventName::Ringing => {
                let mut slot = self.call.lock().await;
                if self.apply(&mut slot, CallTransition::RemoteRinging) {
                    self.events.dispatch(CallEvent::Ringing);
                }
            }
            PluginEventName::Accepted => {
                let mut slot = self.call.lock().await;
                if let Some(jsep) = event.jsep.filter(SessionDescription::is_answer) {
                    self.apply_remote_answer(&mut slot, jsep).await;
                }
                if self.apply(&mut slot, CallTransition::Accepted) {
                    if let Some(info) = slot.info.as_mut() {
                        info.mark_connected();
                    }
                    info!(target: "Call/Gateway", "Call accepted");
                    self.events.dispatch(CallEvent::Accepted);
                }
            }
            PluginEventName::IncomingCall => self.on_incoming_call(event).await,
            PluginEventName::Hangup => {
                if self.settle_owed(|owed| &mut owed.plugin).await {
                    debug!(target: "Call/Gateway", "Hangup for the previous call, ignoring");
                    return;
                }
                self.on_remote_hangup(event.code(), event.reason()).await
            }
            PluginEventName::Calling => {
                debug!(target: "Call/Gateway", "Gateway is placing the call");
            }
            other => {
                debug!(target: "Call/Gateway", "Unhandled plugin event {other}");
            }
        }
    }

    async fn on_incoming_call(&self, event: PluginEvent) {
        let caller = event.str_field("username").unwrap_or("unknown").to_owned();
        let display_name = event
            .str_field("displayname")
            .map(|name| name.trim_matches('"').to_owned())
            .filter(|name| !name.is_empty());

        let mut slot = self.call.lock().await;
        if !slot.state.is_idle() {
            drop(slot);
            info!(target: "Call/Gateway", "Busy, declining incoming call from {caller}");
            if let Err(e) = self
                .send_plugin(SipPluginRequest::Decline { code: Some(486) }, None)
                .await
            {
                warn!(target: "Call/Gateway", "Failed to decline while busy: {e}");
            }
            return;
        }

        info!(target: "Call/Gateway", "Incoming call from {caller}");
        slot.incoming_offer = event.jsep.clone();
        slot.info = Some(CallInfo::new_incoming(&caller));
        self.apply(&mut slot, CallTransition::OfferReceived);
        self.events.dispatch(CallEvent::IncomingCall {
            caller,
            display_name,
            offer: event.jsep,
        });
    }

    async fn on_remote_hangup(&self, code: Option<u16>, reason: Option<String>) {
        if !self.state().await.in_call() {
            debug!(target: "Call/Gateway", "Hangup with no call in progress, ignoring");
            return;
        }
        let reason = end_reason(code, reason.as_deref(), "Remote hangup");
        info!(target: "Call/Gateway", "Call ended by far end: {reason}");
        self.end_call(
            CallTransition::Terminated,
            Some(CallEvent::Ended { code, reason }),
        )
        .await;
    }

    async fn on_negotiation(&self, desc: SessionDescription) {
        let mut slot = self.call.lock().await;
        if desc.is_answer() {
            self.apply_remote_answer(&mut slot, desc).await;
        } else if slot.state.can_answer() {
            debug!(target: "Call/Gateway", "Offer for the ringing call already stored");
        } else {
            warn!(target: "Call/Gateway", "Ignoring {:?} description in state {}", desc.kind, slot.state);
        }
    }

    async fn on_remote_candidate(&self, candidate: TrickleCandidate) {
        let TrickleCandidate::Candidate(candidate) = candidate else {
            debug!(target: "Call/Gateway", "Remote candidate gathering complete");
            return;
        };
        let mut slot = self.call.lock().await;
        if !slot.state.in_call() {
            debug!(target: "Call/Gateway", "Remote candidate with no call, dropping");
            return;
        }
        match slot.media.as_ref().map(CallMedia::peer) {
            Some(peer) if slot.remote_description_applied => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!(target: "Call/Gateway", "Failed to add remote candidate: {e}");
                }
            }
            _ => slot.pending_remote.push(candidate),
        }
    }

    async fn on_peer_event(&self, generation: u64, event: PeerEvent) {
        let mut slot = self.call.lock().await;
        if slot.generation != generation {
            debug!(target: "Call/Gateway", "Dropping event from a released peer connection");
            return;
        }
        let candidate = match event {
            PeerEvent::LocalCandidate(candidate) => TrickleCandidate::Candidate(candidate),
            PeerEvent::GatheringComplete => TrickleCandidate::completed(),
            PeerEvent::RemoteTrack(track) => {
                self.events.dispatch(CallEvent::Track(track));
                return;
            }
            PeerEvent::StateChanged(state) => {
                info!(target: "Call/Gateway", "Peer connection {state:?}");
                if state == PeerState::Failed {
                    warn!(target: "Call/Gateway", "Media path failed");
                }
                return;
            }
        };
        match &slot.trickle_tx {
            Some(tx) => {
                let _ = tx.send(candidate);
            }
            None => slot.pending_local.push(candidate),
        }
    }

    /// Sends `request` for the call created under `generation`, then starts
    /// trickling. Ends the call if the request fails.
    async fn send_call_request(
        &self,
        generation: u64,
        request: SipPluginRequest,
        jsep: SessionDescription,
    ) -> Result<(), CallError> {
        let (session_id, handle_id) = self
            .connection
            .handle()
            .await
            .ok_or(CallError::NotRegistered)?;
        let sent = self
            .connection
            .send_request(GatewayRequest::message(
                session_id,
                handle_id,
                request.to_body(),
                Some(jsep),
            ))
            .await;

        if let Err(e) = sent {
            warn!(target: "Call/Gateway", "Call request failed: {e}");
            if self.call.lock().await.generation == generation {
                let reason = match &e {
                    RequestError::Server { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                let ended = CallEvent::Ended { code: None, reason };
                self.end_call(CallTransition::Terminated, Some(ended)).await;
            }
            return Err(e.into());
        }

        let mut slot = self.call.lock().await;
        if slot.generation != generation {
            debug!(target: "Call/Gateway", "Call ended before the request was acknowledged");
            return Ok(());
        }
        self.open_trickle(&mut slot, session_id, handle_id);
        Ok(())
    }
}

#[async_trait]
impl CallControl for GatewayCallControl {
    async fn register(&self) -> Result<(), CallError> {
        if self.registration.uri.is_empty() {
            return Err(CallError::NoAccount);
        }
        let result = async {
            let (session_id, handle_id) = self.ensure_handle().await?;
            let body = SipPluginRequest::Register {
                username: self.registration.uri.clone(),
                secret: self.registration.secret.clone(),
                authuser: self.registration.auth_user.clone(),
                proxy: self.registration.proxy.clone(),
                display_name: self.registration.display_name.clone(),
            }
            .to_body();
            self.connection
                .send_request(GatewayRequest::message(session_id, handle_id, body, None))
                .await?;
            Ok::<_, CallError>(())
        }
        .await;

        if let Err(e) = &result {
            warn!(target: "Call/Gateway", "Registration failed: {e}");
            let code = match e {
                CallError::Request(RequestError::Server { code, .. }) => u16::try_from(*code).ok(),
                _ => None,
            };
            self.events.dispatch(CallEvent::RegistrationFailed {
                code,
                reason: e.to_string(),
            });
        }
        result
    }

    async fn call(&self, target: &str, device_id: Option<&str>) -> Result<(), CallError> {
        if self.connection.handle().await.is_none() {
            return Err(CallError::NotRegistered);
        }
        let uri = normalize_target(
            target,
            &self.registration.uri,
            self.registration.proxy.as_deref(),
        )?;

        let mut slot = self.call.lock().await;
        if !slot.state.is_idle() {
            return Err(CallError::CallInProgress);
        }
        self.open_media(&mut slot, device_id).await?;

        let peer = slot
            .media
            .as_ref()
            .map(CallMedia::peer)
            .ok_or(CallError::NoActiveCall)?;
        let offer = async {
            let offer = peer.create_offer().await?;
            peer.set_local_description(offer.clone()).await?;
            Ok::<_, CallError>(offer)
        }
        .await;
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                let media = slot.take_media();
                drop(slot);
                release(media).await;
                return Err(e);
            }
        };

        info!(target: "Call/Gateway", "Calling {uri}");
        slot.info = Some(CallInfo::new_outgoing(&uri));
        self.apply(&mut slot, CallTransition::Dial);
        self.events.dispatch(CallEvent::Calling {
            target: uri.clone(),
        });
        let generation = slot.generation;
        drop(slot);

        self.send_call_request(generation, SipPluginRequest::Call { uri }, offer)
            .await
    }

    async fn answer(
        &self,
        offer: Option<SessionDescription>,
        device_id: Option<&str>,
    ) -> Result<(), CallError> {
        if self.connection.handle().await.is_none() {
            return Err(CallError::NotRegistered);
        }
        let mut slot = self.call.lock().await;
        if !slot.state.can_answer() {
            return Err(if slot.state.in_call() {
                CallError::CallInProgress
            } else {
                CallError::NoIncomingCall
            });
        }
        let offer = offer
            .or_else(|| slot.incoming_offer.clone())
            .ok_or(CallError::NoIncomingCall)?;
        self.open_media(&mut slot, device_id).await?;

        let peer = slot
            .media
            .as_ref()
            .map(CallMedia::peer)
            .ok_or(CallError::NoActiveCall)?;
        let answer = async {
            peer.set_remote_description(offer).await?;
            Ok::<_, CallError>(())
        }
        .await;
        if let Err(e) = answer {
            let media = slot.take_media();
            drop(slot);
            release(media).await;
            return Err(e);
        }
        slot.remote_description_applied = true;
        for candidate in std::mem::take(&mut slot.pending_remote) {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(target: "Call/Gateway", "Failed to add buffered remote candidate: {e}");
            }
        }

        let answer = async {
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            Ok::<_, CallError>(answer)
        }
        .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                let media = slot.take_media();
                slot.remote_description_applied = false;
                drop(slot);
                release(media).await;
                return Err(e);
            }
        };

        info!(target: "Call/Gateway", "Answering incoming call");
        self.apply(&mut slot, CallTransition::LocalAnswered);
        let generation = slot.generation;
        drop(slot);

        self.send_call_request(generation, SipPluginRequest::Accept, answer)
            .await
    }

    async fn decline(&self) -> Result<(), CallError> {
        if !self.state().await.can_answer() {
            return self.hangup().await;
        }
        info!(target: "Call/Gateway", "Declining incoming call");
        self.expect_far_end_hangup().await;
        let declined = CallEvent::Ended {
            code: Some(603),
            reason: status_reason(603).to_owned(),
        };
        self.end_call(CallTransition::Terminated, Some(declined)).await;
        if let Err(e) = self
            .send_plugin(SipPluginRequest::Decline { code: Some(603) }, None)
            .await
        {
            warn!(target: "Call/Gateway", "Decline request failed: {e}");
            self.call.lock().await.owed_hangups = OwedHangups::default();
        }
        Ok(())
    }

    async fn hangup(&self) -> Result<(), CallError> {
        let state = self.state().await;
        if state.can_answer() {
            return self.decline().await;
        }
        if !state.in_call() {
            debug!(target: "Call/Gateway", "Hangup with no call in progress");
            return Ok(());
        }

        info!(target: "Call/Gateway", "Hanging up");
        self.expect_far_end_hangup().await;
        let ended = CallEvent::Ended {
            code: None,
            reason: "Hung up".into(),
        };
        self.end_call(CallTransition::Terminated, Some(ended)).await;
        if let Err(e) = self.send_plugin(SipPluginRequest::Hangup, None).await {
            warn!(target: "Call/Gateway", "Hangup request failed: {e}");
            self.call.lock().await.owed_hangups = OwedHangups::default();
        }
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), CallError> {
        let mut slot = self.call.lock().await;
        slot.muted = muted;
        if let Some(media) = &slot.media {
            media.set_muted(muted);
        }
        info!(target: "Call/Gateway", "Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    async fn send_tone(&self, digit: char) -> Result<(), CallError> {
        let digit = validate_tone(digit)?;
        if !self.state().await.in_call() {
            return Err(CallError::NoActiveCall);
        }
        self.send_plugin(
            SipPluginRequest::DtmfInfo {
                digit: digit.to_string(),
            },
            None,
        )
        .await
    }

    async fn inject_audio_file(&self, path: &Path) -> Result<(), CallError> {
        if !self.state().await.in_call() {
            return Err(CallError::NoActiveCall);
        }
        let source = WavSource::open(path).await?;

        let mut slot = self.call.lock().await;
        let generation = slot.generation;
        let in_call = slot.state.in_call();
        let Some(media) = slot.media.as_mut().filter(|_| in_call) else {
            return Err(CallError::NoActiveCall);
        };
        let finished = media.play(source).await?;

        let inbox = self.inbox.clone();
        media.track_task(tokio::spawn(async move {
            if finished.await.is_ok() {
                let _ = inbox.send(Input::PlaybackFinished { generation });
            }
        }));
        info!(target: "Call/Gateway", "Injecting {}", path.display());
        Ok(())
    }

    async fn state(&self) -> CallState {
        self.call.lock().await.state
    }

    async fn shutdown(&self) {
        if let Err(e) = self.hangup().await {
            debug!(target: "Call/Gateway", "Hangup during shutdown failed: {e}");
        }
        self.connection.destroy_session().await;
        self.connection.disconnect().await;
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.abort();
        }
    }

    fn events(&self) -> &EventBus {
        &self.events
    }
}
