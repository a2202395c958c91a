//! Prerecorded audio played into a call in place of the microphone.

use super::capture::{AudioStream, PcmSource};
use super::{AudioFrame, MediaError, SAMPLE_RATE, SAMPLES_PER_FRAME};
use hound::{SampleFormat, WavReader};
use log::info;
use std::path::{Path, PathBuf};

/// Loads a 16-bit PCM WAV file as 8 kHz mono.
pub fn load_wav(path: &Path) -> Result<Vec<i16>, MediaError> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(MediaError::UnsupportedAudio(format!(
            "{}: only 16-bit PCM is supported, got {} bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(MediaError::UnsupportedAudio(format!(
            "{}: empty format",
            path.display()
        )));
    }

    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;
    let mono = downmix(&samples, usize::from(spec.channels));
    let resampled = resample(&mono, spec.sample_rate, SAMPLE_RATE);

    info!(
        target: "Media",
        "Loaded {} ({} Hz, {} ch): {:.1}s of audio",
        path.display(),
        spec.sample_rate,
        spec.channels,
        resampled.len() as f32 / SAMPLE_RATE as f32
    );
    Ok(resampled)
}

fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear interpolation; good enough for prompts and hold music.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let output_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..output_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let a = f64::from(samples[idx]);
            let b = f64::from(*samples.get(idx + 1).unwrap_or(&samples[idx]));
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Plays a loaded clip once, frame by frame. The last frame is zero-padded.
#[derive(Debug)]
pub struct WavSource {
    samples: Vec<i16>,
    position: usize,
}

impl WavSource {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }

    /// Reads `path` off the async runtime.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MediaError> {
        let path = path.into();
        let samples = tokio::task::spawn_blocking(move || load_wav(&path))
            .await
            .map_err(|e| MediaError::Task(e.to_string()))??;
        Ok(Self::new(samples))
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len().div_ceil(SAMPLES_PER_FRAME)
    }

    pub fn into_stream(self) -> AudioStream {
        AudioStream::spawn(self, "playback")
    }
}

impl PcmSource for WavSource {
    fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.position >= self.samples.len() {
            return None;
        }
        let end = (self.position + SAMPLES_PER_FRAME).min(self.samples.len());
        let mut samples = self.samples[self.position..end].to_vec();
        samples.resize(SAMPLES_PER_FRAME, 0);
        self.position = end;
        Some(AudioFrame { samples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_stereo_16k_becomes_mono_8k() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.wav");
        // 0.1 s of 16 kHz stereo, left 1000 / right 3000
        let interleaved: Vec<i16> = (0..1600).flat_map(|_| [1000i16, 3000]).collect();
        write_wav(&path, 16_000, 2, &interleaved);

        let samples = load_wav(&path).unwrap();
        assert_eq!(samples.len(), 800);
        assert!(samples.iter().all(|&s| s == 2000));
    }

    #[test]
    fn test_rejects_float_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(load_wav(&path), Err(MediaError::UnsupportedAudio(_))));
        assert!(matches!(
            load_wav(&dir.path().join("missing.wav")),
            Err(MediaError::Wav(_))
        ));
    }

    #[test]
    fn test_source_pads_last_frame() {
        let mut source = WavSource::new(vec![7; SAMPLES_PER_FRAME + 10]);
        assert_eq!(source.frame_count(), 2);
        assert!(source.next_frame().unwrap().samples.iter().all(|&s| s == 7));
        let last = source.next_frame().unwrap();
        assert_eq!(last.samples.len(), SAMPLES_PER_FRAME);
        assert_eq!(last.samples[9], 7);
        assert_eq!(last.samples[10], 0);
        assert!(source.next_frame().is_none());
    }
}
