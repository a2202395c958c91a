use super::capture::{AudioCapture, AudioStream};
use super::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use super::playback::WavSource;
use super::MediaError;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Everything a call holds on to for media: the peer connection, the
/// microphone (or the clip playing in its place) and helper tasks.
///
/// [`CallMedia::release`] tears all of it down; dropping it stops the audio
/// but leaves the peer connection open.
pub(crate) struct CallMedia {
    peer: Arc<dyn PeerConnection>,
    capture: Option<AudioStream>,
    playback: Option<AudioStream>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallMedia {
    /// Opens the capture device first so a bad device fails before any
    /// peer connection exists.
    pub async fn open(
        capture: &dyn AudioCapture,
        factory: &dyn PeerConnectionFactory,
        ice_servers: &[String],
        device_id: Option<&str>,
        muted: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), MediaError> {
        let mut stream = capture.open(device_id).await?;
        stream.set_muted(muted);
        let frames = stream
            .take_frames()
            .ok_or_else(|| MediaError::Capture("capture stream has no frames".into()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = factory.create(ice_servers, events_tx).await?;
        if let Err(e) = peer.add_audio_track(frames).await {
            peer.close().await;
            return Err(e);
        }

        Ok((
            Self {
                peer,
                capture: Some(stream),
                playback: None,
                tasks: Vec::new(),
            },
            events_rx,
        ))
    }

    pub fn peer(&self) -> Arc<dyn PeerConnection> {
        self.peer.clone()
    }

    /// Ties `task` to the lifetime of the call.
    pub fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn set_muted(&self, muted: bool) {
        for stream in self.capture.iter().chain(self.playback.iter()) {
            stream.set_muted(muted);
        }
    }

    /// Feeds `source` to the far end in place of the microphone. The returned
    /// receiver resolves when the clip has been played out.
    pub async fn play(&mut self, source: WavSource) -> Result<oneshot::Receiver<()>, MediaError> {
        let muted = self.capture.as_ref().is_some_and(AudioStream::is_muted);
        let mut stream = source.into_stream();
        stream.set_muted(muted);
        let frames = stream
            .take_frames()
            .ok_or_else(|| MediaError::Task("playback stream has no frames".into()))?;
        let finished = stream
            .take_finished()
            .ok_or_else(|| MediaError::Task("playback stream has no completion".into()))?;

        self.peer.replace_audio_track(frames).await?;
        if self.capture.take().is_some() {
            debug!(target: "Media", "Microphone released for playback");
        }
        self.playback = Some(stream);
        info!(target: "Media", "Playing prerecorded audio into the call");
        Ok(finished)
    }

    pub async fn release(self) {
        for task in &self.tasks {
            task.abort();
        }
        drop(self.capture);
        drop(self.playback);
        self.peer.close().await;
        debug!(target: "Media", "Call media released");
    }
}
