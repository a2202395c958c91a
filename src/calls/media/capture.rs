use super::{AudioFrame, FRAME_DURATION, MediaError};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const FRAME_BUFFER: usize = 50;

/// Something that yields PCM one frame at a time. `None` ends the stream.
pub trait PcmSource: Send + 'static {
    fn next_frame(&mut self) -> Option<AudioFrame>;
}

/// Endless silence.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl PcmSource for Silence {
    fn next_frame(&mut self) -> Option<AudioFrame> {
        Some(AudioFrame::silence())
    }
}

/// A running source, paced at one frame per 20 ms.
///
/// Dropping the stream stops it. While muted, silence is sent in place of
/// the source's frames.
pub struct AudioStream {
    frames: Option<mpsc::Receiver<AudioFrame>>,
    finished: Option<oneshot::Receiver<()>>,
    muted: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AudioStream {
    pub fn spawn(mut source: impl PcmSource, label: &str) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (finished_tx, finished_rx) = oneshot::channel();
        let muted = Arc::new(AtomicBool::new(false));
        let gate = muted.clone();
        let label = label.to_owned();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sent = 0usize;
            loop {
                ticker.tick().await;
                let Some(frame) = source.next_frame() else {
                    debug!(target: "Media", "{label}: source exhausted after {sent} frames");
                    let _ = finished_tx.send(());
                    return;
                };
                let frame = if gate.load(Ordering::Relaxed) {
                    AudioFrame::silence()
                } else {
                    frame
                };
                if frames_tx.send(frame).await.is_err() {
                    debug!(target: "Media", "{label}: consumer gone, stopping");
                    return;
                }
                sent += 1;
            }
        });

        Self {
            frames: Some(frames_rx),
            finished: Some(finished_rx),
            muted,
            task,
        }
    }

    /// The paced frames. Can be taken once.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }

    /// Resolves when the source runs out. Can be taken once.
    pub fn take_finished(&mut self) -> Option<oneshot::Receiver<()>> {
        self.finished.take()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("muted", &self.is_muted())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Source of the local microphone signal.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Opens `device_id`, or the default input when `None`.
    async fn open(&self, device_id: Option<&str>) -> Result<AudioStream, MediaError>;
}

/// Capture that knows only the `default` device and records silence from it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceCapture;

#[async_trait]
impl AudioCapture for SilenceCapture {
    async fn open(&self, device_id: Option<&str>) -> Result<AudioStream, MediaError> {
        match device_id {
            None | Some("default") => {
                info!(target: "Media", "Opened default audio input");
                Ok(AudioStream::spawn(Silence, "capture"))
            }
            Some(other) => Err(MediaError::Capture(format!(
                "audio input device not found: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(usize);

    impl PcmSource for Countdown {
        fn next_frame(&mut self) -> Option<AudioFrame> {
            self.0 = self.0.checked_sub(1)?;
            Some(AudioFrame {
                samples: vec![1000; super::super::SAMPLES_PER_FRAME],
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_source_signals_completion() {
        let mut stream = AudioStream::spawn(Countdown(3), "test");
        let mut frames = stream.take_frames().unwrap();
        let finished = stream.take_finished().unwrap();

        for _ in 0..3 {
            assert!(!frames.recv().await.unwrap().is_silent());
        }
        finished.await.unwrap();
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_sends_silence() {
        let mut stream = AudioStream::spawn(Countdown(10), "test");
        let mut frames = stream.take_frames().unwrap();
        assert!(!frames.recv().await.unwrap().is_silent());

        stream.set_muted(true);
        // Frames already buffered before the mute may still carry audio.
        let mut saw_silence = false;
        while let Some(frame) = frames.recv().await {
            saw_silence |= frame.is_silent();
        }
        assert!(saw_silence);
    }

    #[tokio::test]
    async fn test_unknown_device_fails_synchronously() {
        let err = SilenceCapture.open(Some("usb-headset-7")).await.unwrap_err();
        assert!(err.to_string().contains("usb-headset-7"));
        assert!(SilenceCapture.open(None).await.is_ok());
    }
}
