//! Media for a call leg.
//!
//! - [`PeerConnection`]: the negotiation and transport seam, backed by
//!   webrtc-rs in [`WebRtcPeerFactory`]
//! - [`AudioCapture`] and [`AudioStream`]: paced 8 kHz PCM feeding the
//!   outgoing track
//! - [`playback`]: prerecorded WAV files injected in place of the microphone
//! - [`AudioSink`]: where remote audio goes on the direct path

pub mod capture;
pub mod g711;
mod leg;
pub mod peer;
pub mod playback;
pub mod webrtc;

pub(crate) use leg::CallMedia;
pub use capture::{AudioCapture, AudioStream, PcmSource, Silence, SilenceCapture};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
pub use playback::{WavSource, load_wav};
pub use webrtc::{WebRtcPeerConnection, WebRtcPeerFactory};

use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ::webrtc::track::track_remote::TrackRemote;

/// Telephony audio: mono, 8 kHz, 20 ms packets.
pub const SAMPLE_RATE: u32 = 8000;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const SAMPLES_PER_FRAME: usize = 160;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("audio capture failed: {0}")]
    Capture(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] ::webrtc::Error),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("no peer connection")]
    NoPeerConnection,

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported audio file: {0}")]
    UnsupportedAudio(String),

    #[error("media task failed: {0}")]
    Task(String),
}

/// One 20 ms block of 8 kHz mono PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn silence() -> Self {
        Self {
            samples: vec![0; SAMPLES_PER_FRAME],
        }
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }

    pub fn from_pcmu(payload: &[u8]) -> Self {
        Self {
            samples: g711::decode(payload),
        }
    }

    pub fn to_pcmu(&self) -> Vec<u8> {
        g711::encode(&self.samples)
    }
}

/// Remote audio received on a call leg.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub codec: String,
    inner: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub(crate) fn from_webrtc(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            codec: track.codec().capability.mime_type,
            inner: Some(track),
        }
    }

    /// A track with no media behind it, as produced by test peers.
    pub fn detached(id: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: String::new(),
            codec: codec.into(),
            inner: None,
        }
    }

    pub fn is_pcmu(&self) -> bool {
        self.codec.eq_ignore_ascii_case(::webrtc::api::media_engine::MIME_TYPE_PCMU)
    }

    /// Reads the next packet and decodes it. `None` once the track ends or
    /// when the payload is not PCMU.
    pub async fn read_frame(&self) -> Option<AudioFrame> {
        let track = self.inner.as_ref()?;
        let (packet, _) = track.read_rtp().await.ok()?;
        self.is_pcmu()
            .then(|| AudioFrame::from_pcmu(&packet.payload))
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("codec", &self.codec)
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

/// Consumer of remote audio on the direct path.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn attach(&self, track: RemoteTrack);
}

/// Drains remote audio without playing it, logging how much arrived.
#[derive(Debug, Default, Clone)]
pub struct DrainSink;

#[async_trait]
impl AudioSink for DrainSink {
    async fn attach(&self, track: RemoteTrack) {
        info!(target: "Media", "Remote track {} ({}) attached", track.id, track.codec);
        tokio::spawn(async move {
            let mut frames = 0usize;
            while track.read_frame().await.is_some() {
                frames += 1;
            }
            debug!(target: "Media", "Remote track {} ended after {frames} frames", track.id);
        });
    }
}
