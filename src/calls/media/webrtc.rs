//! webrtc-rs backed peer connections.
//!
//! Audio only: a single PCMU track is sent, fed from 20 ms PCM frames that
//! are μ-law encoded on the way out. Remote tracks are surfaced as
//! [`PeerEvent::RemoteTrack`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
use super::{AudioFrame, FRAME_DURATION, MediaError, RemoteTrack, SAMPLE_RATE};
use crate::types::media::{IceCandidate, SdpType, SessionDescription};

const TRACK_ID: &str = "audio";
const STREAM_ID: &str = "callcore";

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(MediaError::InvalidDescription(
                "rollback is not supported".into(),
            ));
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MediaError::InvalidDescription("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

/// Builds webrtc-rs peer connections with PCMU audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    fn create_api() -> Result<webrtc::api::API, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let api = Self::create_api()?;
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Some(Err(e)) => {
                        warn!(target: "Media", "Failed to serialize local candidate: {e}");
                        return;
                    }
                    None => PeerEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let track = RemoteTrack::from_webrtc(track);
                info!(target: "Media", "Remote track {} ({})", track.id, track.codec);
                let _ = tx.send(PeerEvent::RemoteTrack(track));
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(target: "Media", "Peer connection state: {state}");
                let _ = tx.send(PeerEvent::StateChanged(map_state(state)));
            })
        }));

        Ok(Arc::new(WebRtcPeerConnection {
            pc,
            track: Mutex::new(None),
            writer: Mutex::new(None),
        }))
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcPeerConnection {
    /// Encodes and writes `frames` to `track` until the feed ends.
    fn spawn_writer(
        track: Arc<TrackLocalStaticSample>,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let sample = Sample {
                    data: Bytes::from(frame.to_pcmu()),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!(target: "Media", "Audio write failed: {e}");
                }
            }
        })
    }

    async fn start_writer(&self, track: Arc<TrackLocalStaticSample>, frames: mpsc::Receiver<AudioFrame>) {
        let handle = Self::spawn_writer(track, frames);
        if let Some(previous) = self.writer.lock().await.replace(handle) {
            previous.abort();
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_audio_track(&self, frames: mpsc::Receiver<AudioFrame>) -> Result<(), MediaError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TRACK_ID.to_owned(),
            STREAM_ID.to_owned(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be read for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        *self.track.lock().await = Some(track.clone());
        self.start_writer(track, frames).await;
        Ok(())
    }

    async fn replace_audio_track(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), MediaError> {
        let track = self
            .track
            .lock()
            .await
            .clone()
            .ok_or(MediaError::NoPeerConnection)?;
        self.start_writer(track, frames).await;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(writer) = self.writer.lock().await.take() {
            writer.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!(target: "Media", "Error closing peer connection: {e}");
        }
    }
}
