//! SIP calls placed directly over a SIP-over-WebSocket relay.
//!
//! When the relay cannot be reached the controller switches to simulation
//! mode: registration succeeds locally and calls follow a scripted
//! ringing/answer sequence with no media.

pub mod digest;
pub mod message;
pub mod simulation;
pub mod stack;
pub mod ws_stack;

pub use stack::{SipAccount, SipError, SipStack, StackEvent};
pub use ws_stack::{SIP_SUBPROTOCOL, WsSipStack};

use super::address::normalize_target;
use super::control::{CallControl, validate_tone};
use super::error::CallError;
use super::media::{
    AudioCapture, AudioSink, CallMedia, MediaError, PeerEvent, PeerConnectionFactory, WavSource,
};
use super::state::{CallInfo, CallState, CallTransition};
use super::status::{end_reason, status_reason};
use crate::config::ClientConfig;
use crate::types::events::{CallEvent, EventBus};
use crate::types::media::SessionDescription;
use async_trait::async_trait;
use log::{debug, info, warn};
use simulation::SimulatedStep;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// How long to wait for ICE gathering before sending what was found.
const GATHERING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Stopped,
    Live,
    Simulated,
}

enum Input {
    Stack(StackEvent),
    Peer { generation: u64, event: PeerEvent },
    PlaybackFinished { generation: u64 },
    Simulated { generation: u64, step: SimulatedStep },
}

#[derive(Default)]
struct CallSlot {
    state: CallState,
    generation: u64,
    info: Option<CallInfo>,
    call_id: Option<String>,
    media: Option<CallMedia>,
    muted: bool,
    incoming_offer: Option<SessionDescription>,
    remote_description_applied: bool,
    simulation: Option<JoinHandle<()>>,
    /// Call id of a call the user ended. The stack reports such calls as
    /// failed or ended once more; that report is swallowed.
    user_initiated: Option<String>,
}

impl CallSlot {
    fn take_media(&mut self) -> Option<CallMedia> {
        self.generation += 1;
        if let Some(simulation) = self.simulation.take() {
            simulation.abort();
        }
        self.media.take()
    }

    fn clear_call(&mut self) {
        self.info = None;
        self.call_id = None;
        self.muted = false;
        self.incoming_offer = None;
        self.remote_description_applied = false;
    }

    fn is_current(&self, call_id: &str) -> bool {
        self.call_id.as_deref() == Some(call_id)
    }
}

async fn release(media: Option<CallMedia>) {
    if let Some(media) = media {
        media.release().await;
    }
}

/// Waits until gathering finishes so the description carries candidates.
async fn wait_for_gathering(events: &mut mpsc::UnboundedReceiver<PeerEvent>) {
    let gathered = tokio::time::timeout(GATHERING_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if matches!(event, PeerEvent::GatheringComplete) {
                return true;
            }
        }
        false
    })
    .await;
    if !matches!(gathered, Ok(true)) {
        warn!(target: "Call/Direct", "ICE gathering incomplete, sending partial description");
    }
}

pub struct DirectCallControl {
    stack: Arc<dyn SipStack>,
    account: SipAccount,
    proxy: Option<String>,
    events: Arc<EventBus>,
    stun_servers: Vec<String>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    capture: Arc<dyn AudioCapture>,
    sink: Arc<dyn AudioSink>,
    mode: Mutex<Mode>,
    call: Mutex<CallSlot>,
    inbox: mpsc::UnboundedSender<Input>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DirectCallControl {
    pub fn new(
        config: &ClientConfig,
        stack: Arc<dyn SipStack>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let registration = &config.registration;
        let this = Arc::new(Self {
            stack,
            account: SipAccount {
                uri: registration.uri.clone(),
                secret: registration.secret.clone(),
                auth_user: registration.auth_user.clone(),
                display_name: registration.display_name.clone(),
            },
            proxy: registration.proxy.clone(),
            events,
            stun_servers: config.stun_servers.clone(),
            peer_factory,
            capture,
            sink,
            mode: Mutex::new(Mode::Stopped),
            call: Mutex::new(CallSlot::default()),
            inbox,
            worker: std::sync::Mutex::new(None),
        });
        let worker = tokio::spawn(Self::run(Arc::downgrade(&this), inbox_rx));
        if let Ok(mut slot) = this.worker.lock() {
            *slot = Some(worker);
        }
        this
    }

    /// Whether calls are being simulated because the relay was unreachable.
    pub async fn is_simulated(&self) -> bool {
        *self.mode.lock().await == Mode::Simulated
    }

    async fn run(this: Weak<Self>, mut inbox: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inbox.recv().await {
            let Some(this) = this.upgrade() else {
                break;
            };
            this.handle_input(input).await;
        }
        debug!(target: "Call/Direct", "Controller worker stopped");
    }

    /// Starts the stack once. An unreachable relay selects simulation mode.
    async fn ensure_started(&self) -> Mode {
        let mut mode = self.mode.lock().await;
        if *mode != Mode::Stopped {
            return *mode;
        }
        match self.stack.start().await {
            Ok(mut stack_events) => {
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    while let Some(event) = stack_events.recv().await {
                        if inbox.send(Input::Stack(event)).is_err() {
                            break;
                        }
                    }
                });
                *mode = Mode::Live;
            }
            Err(e) => {
                warn!(target: "Call/Direct", "{e}; continuing in simulation mode");
                *mode = Mode::Simulated;
            }
        }
        *mode
    }

    async fn handle_input(self: &Arc<Self>, input: Input) {
        match input {
            Input::Stack(event) => self.on_stack_event(event).await,
            Input::Peer { generation, event } => self.on_peer_event(generation, event).await,
            Input::PlaybackFinished { generation } => {
                let current = {
                    let slot = self.call.lock().await;
                    slot.generation == generation && slot.state.in_call()
                };
                if current {
                    info!(target: "Call/Direct", "Injected audio finished, hanging up");
                    if let Err(e) = self.hangup().await {
                        warn!(target: "Call/Direct", "Hangup after playback failed: {e}");
                    }
                }
            }
            Input::Simulated { generation, step } => {
                let mut slot = self.call.lock().await;
                if slot.generation != generation {
                    return;
                }
                match step {
                    SimulatedStep::Ringing => {
                        if self.apply(&mut slot, CallTransition::RemoteRinging) {
                            self.events.dispatch(CallEvent::Ringing);
                        }
                    }
                    SimulatedStep::Answered => {
                        if self.apply(&mut slot, CallTransition::Accepted) {
                            if let Some(info) = slot.info.as_mut() {
                                info.mark_connected();
                            }
                            self.events.dispatch(CallEvent::Accepted);
                        }
                    }
                }
            }
        }
    }

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
                debug!(target: "Call/Direct", "Ignoring event: {e}");
                false
            }
        }
    }

    async fn end_call(&self, transition: CallTransition, event: Option<CallEvent>) {
        let media = {
            let mut slot = self.call.lock().await;
            let media = slot.take_media();
            if let Some(info) = &slot.info
                && let Some(secs) = info.duration_secs()
            {
                info!(target: "Call/Direct", "Call with {} lasted {secs}s", info.remote_uri);
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

    async fn on_stack_event(&self, event: StackEvent) {
        match event {
            StackEvent::Registered => {
                self.events.dispatch(CallEvent::Registered {
                    uri: self.account.uri.clone(),
                });
            }
            StackEvent::RegistrationFailed { code, reason } => {
                let failed = CallEvent::RegistrationFailed { code, reason };
                self.end_call(CallTransition::RegistrationFailed, Some(failed))
                    .await;
            }
            StackEvent::IncomingCall {
                call_id,
                caller,
                display_name,
                offer,
            } => {
                let mut slot = self.call.lock().await;
                if !slot.state.is_idle() {
                    drop(slot);
                    info!(target: "Call/Direct", "Busy, rejecting call from {caller}");
                    if let Err(e) = self.stack.reject(&call_id, 486).await {
                        warn!(target: "Call/Direct", "Failed to reject while busy: {e}");
                    }
                    return;
                }
                info!(target: "Call/Direct", "Incoming call from {caller}");
                slot.call_id = Some(call_id);
                slot.incoming_offer = Some(offer.clone());
                slot.info = Some(CallInfo::new_incoming(&caller));
                self.apply(&mut slot, CallTransition::OfferReceived);
                self.events.dispatch(CallEvent::IncomingCall {
                    caller,
                    display_name,
                    offer: Some(offer),
                });
            }
            StackEvent::Progress { call_id, code } => {
                let mut slot = self.call.lock().await;
                if !slot.is_current(&call_id) {
                    return;
                }
                if matches!(code, 180 | 183) {
                    if self.apply(&mut slot, CallTransition::RemoteRinging) {
                        self.events.dispatch(CallEvent::Ringing);
                    }
                } else if self.apply(&mut slot, CallTransition::RemoteProceeding) {
                    self.events.dispatch(CallEvent::Proceeding { code: Some(code) });
                }
            }
            StackEvent::Confirmed { call_id, answer } => {
                let mut slot = self.call.lock().await;
                if !slot.is_current(&call_id) {
                    return;
                }
                if let Some(answer) = answer {
                    self.apply_remote_answer(&mut slot, answer).await;
                }
                if self.apply(&mut slot, CallTransition::Accepted) {
                    if let Some(info) = slot.info.as_mut() {
                        info.mark_connected();
                    }
                    info!(target: "Call/Direct", "Call established");
                    self.events.dispatch(CallEvent::Accepted);
                }
            }
            StackEvent::Ended {
                call_id,
                code,
                reason,
            } => {
                self.on_terminated(call_id, code, reason, "Remote hangup")
                    .await
            }
            StackEvent::Failed {
                call_id,
                code,
                reason,
            } => {
                self.on_terminated(call_id, Some(code), reason, "Call failed")
                    .await
            }
            StackEvent::Disconnected => {
                *self.mode.lock().await = Mode::Stopped;
                if self.state().await.in_call() {
                    let ended = CallEvent::Ended {
                        code: None,
                        reason: "Connection lost".into(),
                    };
                    self.end_call(CallTransition::Terminated, Some(ended)).await;
                }
            }
        }
    }

    async fn on_terminated(
        &self,
        call_id: String,
        code: Option<u16>,
        reason: Option<String>,
        fallback: &str,
    ) {
        {
            let mut slot = self.call.lock().await;
            if slot.user_initiated.as_deref() == Some(call_id.as_str()) {
                slot.user_initiated = None;
                debug!(target: "Call/Direct", "Suppressing stack report for call we ended");
                return;
            }
            if !slot.is_current(&call_id) {
                debug!(target: "Call/Direct", "Termination of unknown call {call_id}");
                return;
            }
        }
        let reason = end_reason(code, reason.as_deref(), fallback);
        info!(target: "Call/Direct", "Call ended: {reason}");
        self.end_call(
            CallTransition::Terminated,
            Some(CallEvent::Ended { code, reason }),
        )
        .await;
    }

    async fn apply_remote_answer(&self, slot: &mut CallSlot, answer: SessionDescription) {
        if slot.remote_description_applied {
            debug!(target: "Call/Direct", "Remote description already applied, ignoring duplicate");
            return;
        }
        let Some(peer) = slot.media.as_ref().map(CallMedia::peer) else {
            return;
        };
        match peer.set_remote_description(answer).await {
            Ok(()) => slot.remote_description_applied = true,
            Err(e) => warn!(target: "Call/Direct", "Failed to apply remote answer: {e}"),
        }
    }

    async fn on_peer_event(&self, generation: u64, event: PeerEvent) {
        if self.call.lock().await.generation != generation {
            return;
        }
        match event {
            PeerEvent::RemoteTrack(track) => {
                self.sink.attach(track.clone()).await;
                self.events.dispatch(CallEvent::Track(track));
            }
            PeerEvent::StateChanged(state) => {
                info!(target: "Call/Direct", "Peer connection {state:?}");
            }
            // Candidates travel inside the description on this path.
            PeerEvent::LocalCandidate(_) | PeerEvent::GatheringComplete => {}
        }
    }

    /// Opens media and returns the peer event receiver for the caller to
    /// drive through gathering before forwarding it.
    async fn open_media(
        &self,
        slot: &mut CallSlot,
        device_id: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<PeerEvent>, CallError> {
        let (media, peer_events) = CallMedia::open(
            self.capture.as_ref(),
            self.peer_factory.as_ref(),
            &self.stun_servers,
            device_id,
            slot.muted,
        )
        .await?;
        slot.generation += 1;
        slot.media = Some(media);
        Ok(peer_events)
    }

    fn forward_peer_events(&self, slot: &mut CallSlot, mut peer_events: mpsc::UnboundedReceiver<PeerEvent>) {
        let generation = slot.generation;
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                if inbox.send(Input::Peer { generation, event }).is_err() {
                    break;
                }
            }
        });
        match slot.media.as_mut() {
            Some(media) => media.track_task(task),
            None => task.abort(),
        }
    }

    /// Creates the local description (offer or answer) and waits for ICE.
    async fn local_description(
        &self,
        slot: &mut CallSlot,
        peer_events: &mut mpsc::UnboundedReceiver<PeerEvent>,
        offer: Option<SessionDescription>,
    ) -> Result<SessionDescription, CallError> {
        let peer = slot
            .media
            .as_ref()
            .map(CallMedia::peer)
            .ok_or(MediaError::NoPeerConnection)?;
        let local = match offer {
            Some(offer) => {
                peer.set_remote_description(offer).await?;
                slot.remote_description_applied = true;
                peer.create_answer().await?
            }
            None => peer.create_offer().await?,
        };
        peer.set_local_description(local.clone()).await?;
        wait_for_gathering(peer_events).await;
        Ok(peer.local_description().await.unwrap_or(local))
    }

    async fn discard_media(&self, mut slot: tokio::sync::MutexGuard<'_, CallSlot>) {
        let media = slot.take_media();
        slot.remote_description_applied = false;
        drop(slot);
        release(media).await;
    }
}

#[async_trait]
impl CallControl for DirectCallControl {
    async fn register(&self) -> Result<(), CallError> {
        if self.account.uri.is_empty() {
            return Err(CallError::NoAccount);
        }
        match self.ensure_started().await {
            Mode::Simulated => {
                info!(target: "Call/Simulation", "Registered {} (simulated)", self.account.uri);
                self.events.dispatch(CallEvent::Registered {
                    uri: self.account.uri.clone(),
                });
                Ok(())
            }
            _ => {
                if let Err(e) = self.stack.register(&self.account).await {
                    self.events.dispatch(CallEvent::RegistrationFailed {
                        code: None,
                        reason: e.to_string(),
                    });
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    async fn call(&self, target: &str, device_id: Option<&str>) -> Result<(), CallError> {
        let mode = *self.mode.lock().await;
        if mode == Mode::Stopped {
            return Err(CallError::NotRegistered);
        }
        let uri = normalize_target(target, &self.account.uri, self.proxy.as_deref())?;

        let mut slot = self.call.lock().await;
        if !slot.state.is_idle() {
            return Err(CallError::CallInProgress);
        }

        if mode == Mode::Simulated {
            info!(target: "Call/Simulation", "Calling {uri} (simulated)");
            slot.generation += 1;
            let generation = slot.generation;
            slot.info = Some(CallInfo::new_outgoing(&uri));
            self.apply(&mut slot, CallTransition::Dial);
            self.events.dispatch(CallEvent::Calling { target: uri });
            let inbox = self.inbox.clone();
            slot.simulation = Some(simulation::spawn(move |step| {
                let _ = inbox.send(Input::Simulated { generation, step });
            }));
            return Ok(());
        }

        let mut peer_events = self.open_media(&mut slot, device_id).await?;
        let offer = match self.local_description(&mut slot, &mut peer_events, None).await {
            Ok(offer) => offer,
            Err(e) => {
                self.discard_media(slot).await;
                return Err(e);
            }
        };
        self.forward_peer_events(&mut slot, peer_events);

        slot.info = Some(CallInfo::new_outgoing(&uri));
        self.apply(&mut slot, CallTransition::Dial);
        self.events.dispatch(CallEvent::Calling {
            target: uri.clone(),
        });

        match self.stack.invite(&uri, &offer).await {
            Ok(call_id) => {
                info!(target: "Call/Direct", "Calling {uri}");
                slot.call_id = Some(call_id);
                Ok(())
            }
            Err(e) => {
                drop(slot);
                let ended = CallEvent::Ended {
                    code: None,
                    reason: e.to_string(),
                };
                self.end_call(CallTransition::Terminated, Some(ended)).await;
                Err(e.into())
            }
        }
    }

    async fn answer(
        &self,
        offer: Option<SessionDescription>,
        device_id: Option<&str>,
    ) -> Result<(), CallError> {
        let mut slot = self.call.lock().await;
        if !slot.state.can_answer() {
            return Err(if slot.state.in_call() {
                CallError::CallInProgress
            } else {
                CallError::NoIncomingCall
            });
        }
        let call_id = slot.call_id.clone().ok_or(CallError::NoIncomingCall)?;
        let offer = offer
            .or_else(|| slot.incoming_offer.clone())
            .ok_or(CallError::NoIncomingCall)?;

        let mut peer_events = self.open_media(&mut slot, device_id).await?;
        let answer = match self
            .local_description(&mut slot, &mut peer_events, Some(offer))
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                self.discard_media(slot).await;
                return Err(e);
            }
        };
        self.forward_peer_events(&mut slot, peer_events);

        if let Err(e) = self.stack.answer(&call_id, &answer).await {
            drop(slot);
            let ended = CallEvent::Ended {
                code: None,
                reason: e.to_string(),
            };
            self.end_call(CallTransition::Terminated, Some(ended)).await;
            return Err(e.into());
        }
        info!(target: "Call/Direct", "Answered call {call_id}");
        self.apply(&mut slot, CallTransition::LocalAnswered);
        Ok(())
    }

    async fn decline(&self) -> Result<(), CallError> {
        let call_id = {
            let mut slot = self.call.lock().await;
            if !slot.state.can_answer() {
                drop(slot);
                return self.hangup().await;
            }
            slot.user_initiated = slot.call_id.clone();
            slot.call_id.clone()
        };
        info!(target: "Call/Direct", "Declining incoming call");
        let declined = CallEvent::Ended {
            code: Some(603),
            reason: status_reason(603).to_owned(),
        };
        self.end_call(CallTransition::Terminated, Some(declined)).await;
        if let Some(call_id) = call_id
            && let Err(e) = self.stack.reject(&call_id, 603).await
        {
            warn!(target: "Call/Direct", "Reject failed: {e}");
        }
        Ok(())
    }

    async fn hangup(&self) -> Result<(), CallError> {
        let call_id = {
            let mut slot = self.call.lock().await;
            if slot.state.can_answer() {
                drop(slot);
                return self.decline().await;
            }
            if !slot.state.in_call() {
                debug!(target: "Call/Direct", "Hangup with no call in progress");
                return Ok(());
            }
            slot.user_initiated = slot.call_id.clone();
            slot.call_id.clone()
        };

        info!(target: "Call/Direct", "Hanging up");
        let ended = CallEvent::Ended {
            code: None,
            reason: "Hung up".into(),
        };
        self.end_call(CallTransition::Terminated, Some(ended)).await;
        if let Some(call_id) = call_id
            && let Err(e) = self.stack.terminate(&call_id).await
        {
            warn!(target: "Call/Direct", "Terminate failed: {e}");
        }
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), CallError> {
        let mut slot = self.call.lock().await;
        slot.muted = muted;
        if let Some(media) = &slot.media {
            media.set_muted(muted);
        }
        info!(target: "Call/Direct", "Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    async fn send_tone(&self, digit: char) -> Result<(), CallError> {
        let digit = validate_tone(digit)?;
        let call_id = {
            let slot = self.call.lock().await;
            if !slot.state.in_call() {
                return Err(CallError::NoActiveCall);
            }
            slot.call_id.clone()
        };
        match call_id {
            Some(call_id) => Ok(self.stack.send_dtmf(&call_id, digit).await?),
            None => {
                debug!(target: "Call/Simulation", "Tone {digit} (simulated)");
                Ok(())
            }
        }
    }

    async fn inject_audio_file(&self, path: &Path) -> Result<(), CallError> {
        if !self.state().await.in_call() {
            return Err(CallError::NoActiveCall);
        }
        let source = WavSource::open(path).await?;

        let mut slot = self.call.lock().await;
        let generation = slot.generation;
        if !slot.state.in_call() {
            return Err(CallError::NoActiveCall);
        }
        let media = slot.media.as_mut().ok_or(MediaError::NoPeerConnection)?;
        let finished = media.play(source).await?;
        let inbox = self.inbox.clone();
        media.track_task(tokio::spawn(async move {
            if finished.await.is_ok() {
                let _ = inbox.send(Input::PlaybackFinished { generation });
            }
        }));
        info!(target: "Call/Direct", "Injecting {}", path.display());
        Ok(())
    }

    async fn state(&self) -> CallState {
        self.call.lock().await.state
    }

    async fn shutdown(&self) {
        if let Err(e) = self.hangup().await {
            debug!(target: "Call/Direct", "Hangup during shutdown failed: {e}");
        }
        self.stack.stop().await;
        *self.mode.lock().await = Mode::Stopped;
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.abort();
        }
    }

    fn events(&self) -> &EventBus {
        &self.events
    }
}
