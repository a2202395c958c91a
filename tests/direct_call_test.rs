use callcore::calls::direct::StackEvent;
use callcore::calls::direct::simulation::{ANSWER_AFTER_RING, RING_AFTER};
use callcore::calls::media::{MediaError, PeerEvent, RemoteTrack};
use callcore::calls::{CallControl, DirectCallControl};
use callcore::test_utils::{
    EventRecorder, MockCapture, MockPeerFactory, MockSipStack, RecordingSink, StackCall,
};
use callcore::types::media::SessionDescription;
use callcore::{
    Backend, CallError, CallEvent, CallState, ClientConfig, EventBus, EventKind,
    RegistrationConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const OWN_URI: &str = "sip:2000@pbx.example.com";
const SLACK: Duration = Duration::from_millis(10);

struct Harness {
    calls: Arc<DirectCallControl>,
    stack: Arc<MockSipStack>,
    peers: Arc<MockPeerFactory>,
    capture: Arc<MockCapture>,
    sink: Arc<RecordingSink>,
    events: EventRecorder,
}

impl Harness {
    fn with_stack(stack: MockSipStack) -> Self {
        let config = ClientConfig {
            backend: Backend::Direct,
            sip_relay_url: Some("wss://relay.example.com/sip".into()),
            registration: RegistrationConfig {
                uri: OWN_URI.into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let stack = Arc::new(stack);
        let peers = Arc::new(MockPeerFactory::new());
        let capture = Arc::new(MockCapture::new());
        let sink = Arc::new(RecordingSink::default());
        let bus = Arc::new(EventBus::new());
        let events = EventRecorder::new(&bus);
        let calls = DirectCallControl::new(
            &config,
            stack.clone(),
            peers.clone(),
            capture.clone(),
            sink.clone(),
            bus,
        );
        Self {
            calls,
            stack,
            peers,
            capture,
            sink,
            events,
        }
    }

    async fn registered() -> Self {
        let mut harness = Self::with_stack(MockSipStack::new());
        harness.calls.register().await.unwrap();
        assert!(harness.stack.emit(StackEvent::Registered));
        harness.events.next_of(EventKind::Registered).await.unwrap();
        harness
    }

    async fn simulated() -> Self {
        let mut harness = Self::with_stack(MockSipStack::unreachable());
        harness.calls.register().await.unwrap();
        harness.events.next_of(EventKind::Registered).await.unwrap();
        harness
    }

    async fn ringing_incoming(&mut self) {
        self.stack.emit(StackEvent::IncomingCall {
            call_id: "in-1".into(),
            caller: "sip:3000@pbx.example.com".into(),
            display_name: Some("Alice".into()),
            offer: SessionDescription::offer("v=0\r\ns=caller\r\n"),
        });
        self.events.next_of(EventKind::IncomingCall).await.unwrap();
    }

    async fn wait_for_state(&self, wanted: CallState) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.calls.state().await != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    async fn ended_count_after_settling(&mut self) -> usize {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.events
            .drain()
            .iter()
            .filter(|e| matches!(e, CallEvent::Ended { .. }))
            .count()
    }
}

fn write_wav(dir: &Path, samples: usize) -> PathBuf {
    let path = dir.join("clip.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..samples {
        writer.write_sample(((i % 80) as i16 - 40) * 300).unwrap();
    }
    writer.finalize().unwrap();
    path
}

#[tokio::test]
async fn test_call_before_start_is_not_registered() {
    let harness = Harness::with_stack(MockSipStack::new());
    let err = harness.calls.call("2001", None).await.unwrap_err();
    assert!(matches!(err, CallError::NotRegistered));
    assert!(harness.stack.calls().is_empty());
}

#[tokio::test]
async fn test_register_starts_stack_once() {
    let harness = Harness::registered().await;
    harness.calls.register().await.unwrap();
    assert_eq!(
        harness.stack.calls(),
        vec![
            StackCall::Start,
            StackCall::Register(OWN_URI.into()),
            StackCall::Register(OWN_URI.into()),
        ]
    );
    assert!(!harness.calls.is_simulated().await);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_falls_back_to_simulation() {
    let mut harness = Harness::simulated().await;
    assert!(harness.calls.is_simulated().await);

    let started = Instant::now();
    harness.calls.call("2001", None).await.unwrap();
    assert_eq!(harness.calls.state().await, CallState::Calling);

    harness.events.next_of(EventKind::Ringing).await.unwrap();
    let rang = started.elapsed();
    assert!(rang >= RING_AFTER && rang < RING_AFTER + SLACK);
    assert_eq!(harness.calls.state().await, CallState::RemoteRinging);

    harness.events.next_of(EventKind::Accepted).await.unwrap();
    let answered = started.elapsed();
    let expected = RING_AFTER + ANSWER_AFTER_RING;
    assert!(answered >= expected && answered < expected + SLACK);
    assert_eq!(harness.calls.state().await, CallState::Active);

    // Simulated calls never touch media.
    assert_eq!(harness.peers.created(), 0);
    assert_eq!(harness.capture.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_call_hangup_stops_script() {
    let mut harness = Harness::simulated().await;
    harness.calls.call("2001", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    harness.calls.hangup().await.unwrap();
    assert_eq!(harness.calls.state().await, CallState::Idle);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(
        harness
            .events
            .drain()
            .iter()
            .all(|e| !matches!(e, CallEvent::Accepted))
    );
    assert_eq!(harness.calls.state().await, CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_call_tones_and_injection() {
    let mut harness = Harness::simulated().await;
    harness.calls.call("2001", None).await.unwrap();
    harness.events.next_of(EventKind::Accepted).await.unwrap();

    harness.calls.send_tone('7').await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_wav(dir.path(), 800);
    let err = harness.calls.inject_audio_file(&path).await.unwrap_err();
    assert!(matches!(err, CallError::Media(MediaError::NoPeerConnection)));
}

#[tokio::test]
async fn test_outgoing_call_through_stack() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();
    assert!(
        harness
            .stack
            .calls()
            .contains(&StackCall::Invite("sip:2001@pbx.example.com".into()))
    );
    assert_eq!(harness.calls.state().await, CallState::Calling);

    harness.stack.emit(StackEvent::Progress {
        call_id: "call-1".into(),
        code: 100,
    });
    harness.events.next_of(EventKind::Proceeding).await.unwrap();
    harness.stack.emit(StackEvent::Progress {
        call_id: "call-1".into(),
        code: 180,
    });
    harness.events.next_of(EventKind::Ringing).await.unwrap();
    assert_eq!(harness.calls.state().await, CallState::RemoteRinging);

    harness.stack.emit(StackEvent::Confirmed {
        call_id: "call-1".into(),
        answer: Some(SessionDescription::answer("v=0\r\ns=far-end\r\n")),
    });
    harness.events.next_of(EventKind::Accepted).await.unwrap();
    assert_eq!(harness.calls.state().await, CallState::Active);
    let peer = harness.peers.last().unwrap();
    assert_eq!(peer.remote_description_attempts(), 1);
}

#[tokio::test]
async fn test_events_for_other_calls_are_ignored() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();

    harness.stack.emit(StackEvent::Confirmed {
        call_id: "stale".into(),
        answer: None,
    });
    harness.stack.emit(StackEvent::Ended {
        call_id: "stale".into(),
        code: None,
        reason: None,
    });
    assert_eq!(harness.ended_count_after_settling().await, 0);
    assert_eq!(harness.calls.state().await, CallState::Calling);
}

#[tokio::test]
async fn test_local_hangup_suppresses_stack_report() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();
    harness.stack.emit(StackEvent::Confirmed {
        call_id: "call-1".into(),
        answer: Some(SessionDescription::answer("v=0\r\n")),
    });
    harness.events.next_of(EventKind::Accepted).await.unwrap();

    harness.calls.hangup().await.unwrap();
    assert!(harness.stack.calls().contains(&StackCall::Terminate("call-1".into())));
    assert!(harness.capture.wait_released().await);

    harness.stack.emit(StackEvent::Ended {
        call_id: "call-1".into(),
        code: None,
        reason: Some("BYE".into()),
    });
    assert_eq!(harness.ended_count_after_settling().await, 1);
    assert_eq!(harness.calls.state().await, CallState::Idle);
}

#[tokio::test]
async fn test_remote_failure_ends_call_with_mapped_reason() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();

    harness.stack.emit(StackEvent::Failed {
        call_id: "call-1".into(),
        code: 404,
        reason: Some("Not Found".into()),
    });
    match harness.events.next_of(EventKind::Ended).await.unwrap() {
        CallEvent::Ended { code, reason } => {
            assert_eq!(code, Some(404));
            assert_eq!(reason, "Number not found");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(harness.wait_for_state(CallState::Idle).await);
    assert!(harness.capture.wait_released().await);
}

#[tokio::test]
async fn test_incoming_call_answer_and_confirm() {
    let mut harness = Harness::registered().await;
    harness.ringing_incoming().await;
    assert_eq!(harness.calls.state().await, CallState::Ringing);

    harness.calls.answer(None, None).await.unwrap();
    assert!(harness.stack.calls().contains(&StackCall::Answer("in-1".into())));
    assert_eq!(harness.calls.state().await, CallState::Proceeding);

    harness.stack.emit(StackEvent::Confirmed {
        call_id: "in-1".into(),
        answer: None,
    });
    harness.events.next_of(EventKind::Accepted).await.unwrap();
    assert_eq!(harness.calls.state().await, CallState::Active);
}

#[tokio::test]
async fn test_decline_suppresses_later_failure() {
    let mut harness = Harness::registered().await;
    harness.ringing_incoming().await;

    harness.calls.decline().await.unwrap();
    assert!(
        harness
            .stack
            .calls()
            .contains(&StackCall::Reject("in-1".into(), 603))
    );
    harness.stack.emit(StackEvent::Failed {
        call_id: "in-1".into(),
        code: 487,
        reason: None,
    });
    assert_eq!(harness.ended_count_after_settling().await, 1);
    assert_eq!(harness.peers.created(), 0);
}

#[tokio::test]
async fn test_incoming_while_busy_is_rejected_486() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();

    harness.stack.emit(StackEvent::IncomingCall {
        call_id: "in-2".into(),
        caller: "sip:3001@pbx.example.com".into(),
        display_name: None,
        offer: SessionDescription::offer("v=0\r\n"),
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
        harness
            .stack
            .calls()
            .contains(&StackCall::Reject("in-2".into(), 486))
    );
    assert_eq!(harness.calls.state().await, CallState::Calling);
    assert!(harness.events.drain().iter().all(|e| e.kind() != EventKind::IncomingCall));
}

#[tokio::test]
async fn test_remote_track_goes_to_sink() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();

    let peer = harness.peers.last().unwrap();
    peer.emit(PeerEvent::RemoteTrack(RemoteTrack::detached("audio-1", "audio/PCMU")));
    match harness.events.next_of(EventKind::Track).await.unwrap() {
        CallEvent::Track(track) => assert!(track.is_pcmu()),
        other => panic!("unexpected event {other:?}"),
    }
    let tracks = harness.sink.tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].id, "audio-1");
}

#[tokio::test]
async fn test_relay_loss_ends_call_and_requires_restart() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();

    harness.stack.emit(StackEvent::Disconnected);
    match harness.events.next_of(EventKind::Ended).await.unwrap() {
        CallEvent::Ended { reason, .. } => assert_eq!(reason, "Connection lost"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(harness.wait_for_state(CallState::Idle).await);
    let err = harness.calls.call("2001", None).await.unwrap_err();
    assert!(matches!(err, CallError::NotRegistered));
}

#[tokio::test]
async fn test_registration_failure_from_stack() {
    let mut harness = Harness::with_stack(MockSipStack::new());
    harness.calls.register().await.unwrap();
    harness.stack.emit(StackEvent::RegistrationFailed {
        code: Some(401),
        reason: "Authentication required".into(),
    });
    match harness
        .events
        .next_of(EventKind::RegistrationFailed)
        .await
        .unwrap()
    {
        CallEvent::RegistrationFailed { code, .. } => assert_eq!(code, Some(401)),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(harness.calls.state().await, CallState::Idle);
}

#[tokio::test]
async fn test_injection_hangs_up_live_call() {
    let mut harness = Harness::registered().await;
    harness.calls.call("2001", None).await.unwrap();
    harness.stack.emit(StackEvent::Confirmed {
        call_id: "call-1".into(),
        answer: Some(SessionDescription::answer("v=0\r\n")),
    });
    harness.events.next_of(EventKind::Accepted).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = write_wav(dir.path(), 400);
    harness.calls.inject_audio_file(&path).await.unwrap();

    harness.events.next_of(EventKind::Ended).await.unwrap();
    assert!(harness.wait_for_state(CallState::Idle).await);
    assert!(harness.stack.calls().contains(&StackCall::Terminate("call-1".into())));
}

#[tokio::test]
async fn test_shutdown_stops_stack() {
    let harness = Harness::registered().await;
    harness.calls.shutdown().await;
    assert_eq!(harness.stack.calls().last(), Some(&StackCall::Stop));
}
