//! In-memory stand-ins for the network, media and SIP seams.
//!
//! Used by the unit tests and the integration tests under `tests/`.

use crate::calls::direct::{SipAccount, SipError, SipStack, StackEvent};
use crate::calls::media::{
    AudioCapture, AudioFrame, AudioSink, AudioStream, MediaError, PcmSource, PeerConnection,
    PeerConnectionFactory, PeerEvent, RemoteTrack,
};
use crate::protocol::SIP_PLUGIN;
use crate::transport::mock::MockLink;
use crate::types::events::{CallEvent, EventBus, EventKind};
use crate::types::media::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const FAKE_SESSION_ID: u64 = 1000;
pub const FAKE_HANDLE_ID: u64 = 2000;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Host and server-reflexive candidates every [`MockPeer`] "gathers".
pub fn mock_candidates() -> Vec<IceCandidate> {
    [
        "candidate:1 1 udp 2122260223 192.0.2.10 40000 typ host",
        "candidate:2 1 udp 1686052607 203.0.113.7 40000 typ srflx raddr 192.0.2.10 rport 40000",
    ]
    .into_iter()
    .map(|candidate| IceCandidate {
        candidate: candidate.to_owned(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    })
    .collect()
}

#[derive(Default)]
struct PeerRecord {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_attempts: usize,
    candidates: Vec<IceCandidate>,
    track_feeds: usize,
    closed: bool,
}

/// A peer connection that negotiates nothing and records what it was asked.
///
/// Behaves strictly: a second remote description is an error, as is a
/// candidate before any remote description.
pub struct MockPeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    record: Mutex<PeerRecord>,
    drains: Mutex<Vec<JoinHandle<()>>>,
}

impl MockPeer {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            events,
            record: Mutex::new(PeerRecord::default()),
            drains: Mutex::new(Vec::new()),
        }
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut PeerRecord) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut record)
    }

    /// Pushes `event` as if the media stack had raised it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.with_record(|r| r.remote.clone())
    }

    /// How many times applying a remote description was attempted.
    pub fn remote_description_attempts(&self) -> usize {
        self.with_record(|r| r.remote_attempts)
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.with_record(|r| r.candidates.clone())
    }

    /// Number of audio feeds attached, counting replacements.
    pub fn track_feeds(&self) -> usize {
        self.with_record(|r| r.track_feeds)
    }

    pub fn is_closed(&self) -> bool {
        self.with_record(|r| r.closed)
    }

    fn drain(&self, mut frames: mpsc::Receiver<AudioFrame>) {
        let task = tokio::spawn(async move { while frames.recv().await.is_some() {} });
        if let Ok(mut drains) = self.drains.lock() {
            drains.push(task);
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_audio_track(&self, frames: mpsc::Receiver<AudioFrame>) -> Result<(), MediaError> {
        self.with_record(|r| r.track_feeds += 1);
        self.drain(frames);
        Ok(())
    }

    async fn replace_audio_track(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), MediaError> {
        if let Ok(drains) = self.drains.lock() {
            drains.iter().for_each(JoinHandle::abort);
        }
        self.with_record(|r| r.track_feeds += 1);
        self.drain(frames);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=mock-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if self.remote_description().is_none() {
            return Err(MediaError::InvalidDescription(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 0.0.0.0\r\ns=mock-answer\r\n"))
    }

    /// Stores `desc` and immediately reports [`mock_candidates`] followed by
    /// the end of gathering.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.with_record(|r| r.local = Some(desc));
        for candidate in mock_candidates() {
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
        self.emit(PeerEvent::GatheringComplete);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.with_record(|r| {
            r.remote_attempts += 1;
            if r.remote.is_some() {
                return Err(MediaError::InvalidDescription(
                    "remote description already set".into(),
                ));
            }
            r.remote = Some(desc);
            Ok(())
        })
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.with_record(|r| r.local.clone())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.with_record(|r| {
            if r.remote.is_none() {
                return Err(MediaError::InvalidDescription(
                    "candidate before remote description".into(),
                ));
            }
            r.candidates.push(candidate);
            Ok(())
        })
    }

    async fn close(&self) {
        if let Ok(drains) = self.drains.lock() {
            drains.iter().for_each(JoinHandle::abort);
        }
        self.with_record(|r| r.closed = true);
    }
}

/// Hands out [`MockPeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct MockPeerFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    failing: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `create` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn created(&self) -> usize {
        self.peers().len()
    }

    pub fn last(&self) -> Option<Arc<MockPeer>> {
        self.peers().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MediaError::Task("peer connection unavailable".into()));
        }
        let peer = Arc::new(MockPeer::new(events));
        if let Ok(mut peers) = self.peers.lock() {
            peers.push(peer.clone());
        }
        Ok(peer)
    }
}

/// Silence that counts how many streams are still alive.
struct CountedSilence {
    live: Arc<AtomicUsize>,
}

impl PcmSource for CountedSilence {
    fn next_frame(&mut self) -> Option<AudioFrame> {
        Some(AudioFrame::silence())
    }
}

impl Drop for CountedSilence {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Capture whose streams can be counted, so tests can check the microphone
/// was released. The device `missing` does not exist.
#[derive(Default)]
pub struct MockCapture {
    opened: AtomicUsize,
    live: Arc<AtomicUsize>,
    failing: AtomicBool,
}

impl MockCapture {
    pub const MISSING_DEVICE: &'static str = "missing";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Waits until no stream is live. Returns whether that happened in time.
    pub async fn wait_released(&self) -> bool {
        let released = tokio::time::timeout(WAIT_LIMIT, async {
            while self.live_streams() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        released.is_ok()
    }
}

#[async_trait]
impl AudioCapture for MockCapture {
    async fn open(&self, device_id: Option<&str>) -> Result<AudioStream, MediaError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MediaError::Capture("permission denied".into()));
        }
        if device_id == Some(Self::MISSING_DEVICE) {
            return Err(MediaError::Capture(format!(
                "audio input device not found: {}",
                Self::MISSING_DEVICE
            )));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        let source = CountedSilence {
            live: self.live.clone(),
        };
        Ok(AudioStream::spawn(source, "mock-capture"))
    }
}

/// Remembers the tracks it was handed.
#[derive(Default)]
pub struct RecordingSink {
    tracks: Mutex<Vec<RemoteTrack>>,
}

impl RecordingSink {
    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn attach(&self, track: RemoteTrack) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.push(track);
        }
    }
}

/// A plugin `event` message as the gateway would push it.
pub fn plugin_event(result: Value, jsep: Option<&SessionDescription>) -> String {
    let mut message = json!({
        "janus": "event",
        "session_id": FAKE_SESSION_ID,
        "sender": FAKE_HANDLE_ID,
        "plugindata": {
            "plugin": SIP_PLUGIN,
            "data": { "sip": "event", "result": result },
        },
    });
    if let Some(jsep) = jsep {
        message["jsep"] = json!(jsep);
    }
    message.to_string()
}

/// A trickled remote candidate.
pub fn remote_candidate(candidate: &IceCandidate) -> String {
    json!({
        "janus": "trickle",
        "session_id": FAKE_SESSION_ID,
        "sender": FAKE_HANDLE_ID,
        "candidate": candidate,
    })
    .to_string()
}

#[derive(Default)]
struct GatewayScript {
    hold_messages: bool,
    held: Vec<String>,
}

/// Answers the requests a client sends over a [`MockLink`] the way a
/// gateway would: `create` and `attach` succeed with fixed ids,
/// `message`, `trickle` and `keepalive` are acknowledged, `destroy`
/// succeeds.
///
/// Plugin messages can be held back to control when their
/// acknowledgement arrives.
pub struct FakeGateway {
    link: MockLink,
    script: Arc<Mutex<GatewayScript>>,
    task: JoinHandle<()>,
}

impl FakeGateway {
    pub fn start(link: MockLink) -> Self {
        let script = Arc::new(Mutex::new(GatewayScript::default()));
        let task = tokio::spawn(Self::respond(link.clone(), script.clone()));
        Self { link, script, task }
    }

    async fn respond(link: MockLink, script: Arc<Mutex<GatewayScript>>) {
        let mut sent = link.watch_sent();
        let mut seen = 0;
        loop {
            sent.borrow_and_update();
            let messages = link.sent_messages();
            for text in messages.iter().skip(seen) {
                if let Some(reply) = Self::reply_to(text, &script) {
                    link.inject(reply).await;
                }
            }
            seen = messages.len();
            if sent.changed().await.is_err() {
                break;
            }
        }
    }

    fn reply_to(text: &str, script: &Mutex<GatewayScript>) -> Option<String> {
        let request: Value = serde_json::from_str(text).ok()?;
        let transaction = request.get("transaction")?.as_str()?;
        let reply = match request.get("janus")?.as_str()? {
            "create" => success(transaction, Some(FAKE_SESSION_ID)),
            "attach" => success(transaction, Some(FAKE_HANDLE_ID)),
            "destroy" => success(transaction, None),
            "message" => {
                let mut script = script.lock().ok()?;
                if script.hold_messages {
                    script.held.push(transaction.to_owned());
                    return None;
                }
                ack(transaction)
            }
            "trickle" | "keepalive" => ack(transaction),
            _ => return None,
        };
        Some(reply)
    }

    pub fn link(&self) -> &MockLink {
        &self.link
    }

    /// While set, plugin messages get no acknowledgement until
    /// [`release_held`](Self::release_held).
    pub fn hold_messages(&self, hold: bool) {
        if let Ok(mut script) = self.script.lock() {
            script.hold_messages = hold;
        }
    }

    /// Acknowledges every held message, oldest first, and stops holding.
    pub async fn release_held(&self) {
        let held = match self.script.lock() {
            Ok(mut script) => {
                script.hold_messages = false;
                std::mem::take(&mut script.held)
            }
            Err(_) => Vec::new(),
        };
        for transaction in held {
            self.link.inject(ack(&transaction)).await;
        }
    }

    /// Number of plugin messages waiting for an acknowledgement.
    pub fn held_count(&self) -> usize {
        self.script.lock().map(|s| s.held.len()).unwrap_or_default()
    }

    /// Sent requests whose `janus` field is `kind`.
    pub fn requests(&self, kind: &str) -> Vec<Value> {
        self.link
            .sent_json()
            .into_iter()
            .filter(|r| r["janus"] == kind)
            .collect()
    }

    /// Bodies of plugin messages whose `request` field is `request`.
    pub fn plugin_requests(&self, request: &str) -> Vec<Value> {
        self.requests("message")
            .into_iter()
            .filter(|r| r["body"]["request"] == request)
            .collect()
    }

    /// Waits until `count` plugin messages named `request` were sent.
    pub async fn wait_for_plugin_request(&self, request: &str, count: usize) -> Vec<Value> {
        let mut sent = self.link.watch_sent();
        let _ = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                sent.borrow_and_update();
                if self.plugin_requests(request).len() >= count {
                    break;
                }
                if sent.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        self.plugin_requests(request)
    }

    /// Pushes a SIP plugin event carrying `result` (and optionally `jsep`).
    pub async fn push_event(&self, result: Value, jsep: Option<&SessionDescription>) {
        self.link.inject(plugin_event(result, jsep)).await;
    }

    pub async fn push(&self, message: Value) {
        self.link.inject(message.to_string()).await;
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn success(transaction: &str, id: Option<u64>) -> String {
    let mut reply = json!({ "janus": "success", "transaction": transaction });
    if let Some(id) = id {
        reply["data"] = json!({ "id": id });
    }
    reply.to_string()
}

fn ack(transaction: &str) -> String {
    json!({ "janus": "ack", "transaction": transaction }).to_string()
}

/// What the controller asked a [`MockSipStack`] to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    Start,
    Register(String),
    Invite(String),
    Answer(String),
    Reject(String, u16),
    Terminate(String),
    Dtmf(String, char),
    Stop,
}

#[derive(Default)]
struct StackRecord {
    calls: Vec<StackCall>,
    events: Option<mpsc::UnboundedSender<StackEvent>>,
    next_call: usize,
}

/// A scripted SIP stack: records every call and lets the test push
/// [`StackEvent`]s. An unreachable stack fails to start.
#[derive(Default)]
pub struct MockSipStack {
    record: Mutex<StackRecord>,
    unreachable: bool,
}

impl MockSipStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<StackCall> {
        self.record.lock().map(|r| r.calls.clone()).unwrap_or_default()
    }

    /// Delivers `event` to the controller. Returns `false` before `start`.
    pub fn emit(&self, event: StackEvent) -> bool {
        let tx = self.record.lock().ok().and_then(|r| r.events.clone());
        tx.is_some_and(|tx| tx.send(event).is_ok())
    }

    fn push(&self, call: StackCall) {
        if let Ok(mut record) = self.record.lock() {
            record.calls.push(call);
        }
    }
}

#[async_trait]
impl SipStack for MockSipStack {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<StackEvent>, SipError> {
        self.push(StackCall::Start);
        if self.unreachable {
            return Err(SipError::Connect {
                url: "wss://relay.invalid".into(),
                reason: "connection refused".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut record) = self.record.lock() {
            record.events = Some(tx);
        }
        Ok(rx)
    }

    async fn register(&self, account: &SipAccount) -> Result<(), SipError> {
        self.push(StackCall::Register(account.uri.clone()));
        Ok(())
    }

    async fn invite(&self, target: &str, _offer: &SessionDescription) -> Result<String, SipError> {
        self.push(StackCall::Invite(target.to_owned()));
        let id = match self.record.lock() {
            Ok(mut record) => {
                record.next_call += 1;
                record.next_call
            }
            Err(_) => 0,
        };
        Ok(format!("call-{id}"))
    }

    async fn answer(&self, call_id: &str, _answer: &SessionDescription) -> Result<(), SipError> {
        self.push(StackCall::Answer(call_id.to_owned()));
        Ok(())
    }

    async fn reject(&self, call_id: &str, code: u16) -> Result<(), SipError> {
        self.push(StackCall::Reject(call_id.to_owned(), code));
        Ok(())
    }

    async fn terminate(&self, call_id: &str) -> Result<(), SipError> {
        self.push(StackCall::Terminate(call_id.to_owned()));
        Ok(())
    }

    async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<(), SipError> {
        self.push(StackCall::Dtmf(call_id.to_owned(), digit));
        Ok(())
    }

    async fn stop(&self) {
        self.push(StackCall::Stop);
        if let Ok(mut record) = self.record.lock() {
            record.events = None;
        }
    }
}

/// Collects bus events for assertions.
pub struct EventRecorder {
    rx: broadcast::Receiver<CallEvent>,
}

impl EventRecorder {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            rx: bus.subscribe(),
        }
    }

    /// Waits for the next event of `kind`, skipping others. `None` on timeout.
    pub async fn next_of(&mut self, kind: EventKind) -> Option<CallEvent> {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                match self.rx.recv().await {
                    Ok(event) if event.kind() == kind => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Everything received so far, without waiting.
    pub fn drain(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
