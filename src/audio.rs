//! Audio data model and sample transforms

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Negotiated stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in hertz
    pub rate: u32,
    /// Sample width in bytes
    pub width: u16,
    /// Channel count
    pub channels: u16,
}

impl AudioFormat {
    /// 16 kHz, 16-bit, mono — the format speech services expect
    pub const SPEECH: Self = Self {
        rate: 16_000,
        width: 2,
        channels: 1,
    };

    /// Bytes per second of audio in this format
    #[must_use]
    pub const fn bytes_per_second(&self) -> usize {
        self.rate as usize * self.width as usize * self.channels as usize
    }

    /// Duration covered by `len` bytes of audio in this format
    #[must_use]
    pub fn duration_of(&self, len: usize) -> Duration {
        Duration::from_secs_f64(len as f64 / self.bytes_per_second() as f64)
    }
}

/// One chunk of PCM audio, immutable once produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Stream format of the samples
    pub format: AudioFormat,
    /// Raw interleaved samples
    pub samples: Vec<u8>,
    /// Producer timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl AudioChunk {
    /// Duration covered by this chunk
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples.len())
    }
}

/// Multiply 16-bit PCM samples by a constant, saturating at the sample width
#[must_use]
pub fn multiply_volume(samples: &[u8], multiplier: f32) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len());
    for pair in samples.chunks_exact(2) {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (f32::from(value) * multiplier).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    // Odd trailing byte passes through untouched
    if samples.len() % 2 == 1 {
        out.push(samples[samples.len() - 1]);
    }
    out
}

/// Extract a single channel from an interleaved 16-bit frame by byte stride.
///
/// # Errors
///
/// Returns [`Error::Dsp`] if the sample width is not 16-bit or the index is
/// out of range for the channel count.
pub fn select_channel(samples: &[u8], format: AudioFormat, index: u16) -> Result<Vec<u8>> {
    if format.width != 2 {
        return Err(Error::Dsp(
            "channel selection requires 16-bit samples".to_string(),
        ));
    }
    if index >= format.channels {
        return Err(Error::Dsp(format!(
            "channel index {index} out of range for {} channels",
            format.channels
        )));
    }

    let frame_bytes = usize::from(format.width) * usize::from(format.channels);
    let offset = usize::from(index) * usize::from(format.width);
    let mut out = Vec::with_capacity(samples.len() / usize::from(format.channels));
    for frame in samples.chunks_exact(frame_bytes) {
        out.extend_from_slice(&frame[offset..offset + usize::from(format.width)]);
    }
    Ok(out)
}

/// Silence of identical shape to the given samples
#[must_use]
pub fn silence_like(samples: &[u8]) -> Vec<u8> {
    vec![0u8; samples.len()]
}

/// Rolling byte ring with a fixed capacity.
///
/// Holds the most recent `capacity` bytes pushed into it; used for the
/// pre-roll buffer so streaming can replay audio captured before a
/// speech-detected edge.
#[derive(Debug)]
pub struct AudioRing {
    buffer: VecDeque<u8>,
    capacity: usize,
}

impl AudioRing {
    /// Create a ring holding at most `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push samples, evicting the oldest bytes beyond capacity
    pub fn push(&mut self, samples: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if samples.len() >= self.capacity {
            self.buffer.clear();
            self.buffer.extend(&samples[samples.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buffer.len() + samples.len()).saturating_sub(self.capacity);
        self.buffer.drain(..overflow);
        self.buffer.extend(samples);
    }

    /// Take the buffered bytes in arrival order, clearing the ring
    pub fn take(&mut self) -> Vec<u8> {
        self.buffer.drain(..).collect()
    }

    /// Number of buffered bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Shared microphone mute window.
///
/// The snd pipeline mutes around feedback playback; the mic pipeline
/// checks the gate per chunk and substitutes silence while muted.
#[derive(Debug, Clone, Default)]
pub struct MuteGate(std::sync::Arc<std::sync::Mutex<Option<std::time::Instant>>>);

impl MuteGate {
    /// Mute the microphone until `duration` from now, extending any
    /// existing window
    pub fn mute_for(&self, duration: Duration) {
        let until = std::time::Instant::now() + duration;
        let mut guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(match *guard {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// True while inside the mute window
    #[must_use]
    pub fn is_muted(&self) -> bool {
        let mut guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *guard {
            Some(until) if std::time::Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }
}

/// Re-chunk a byte stream into fixed-size chunks, carrying the remainder
/// between calls.
#[derive(Debug, Default)]
pub struct Rechunker {
    leftover: Vec<u8>,
}

impl Rechunker {
    /// Append samples and return every complete chunk of `chunk_bytes`
    pub fn push(&mut self, samples: &[u8], chunk_bytes: usize) -> Vec<Vec<u8>> {
        self.leftover.extend_from_slice(samples);
        let mut chunks = Vec::new();
        while self.leftover.len() >= chunk_bytes {
            let rest = self.leftover.split_off(chunk_bytes);
            chunks.push(std::mem::replace(&mut self.leftover, rest));
        }
        chunks
    }
}

/// A WAV file loaded for feedback playback
#[derive(Debug, Clone)]
pub struct WavAudio {
    /// Format read from the WAV header
    pub format: AudioFormat,
    /// PCM sample bytes
    pub samples: Vec<u8>,
}

impl WavAudio {
    /// Load 16-bit PCM audio from a WAV file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or is not
    /// 16-bit integer PCM.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(Error::Config(format!(
                "{}: only 16-bit PCM WAV is supported",
                path.display()
            )));
        }

        let mut samples = Vec::new();
        for sample in reader.samples::<i16>() {
            let sample = sample.map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            samples.extend_from_slice(&sample.to_le_bytes());
        }

        Ok(Self {
            format: AudioFormat {
                rate: spec.sample_rate,
                width: 2,
                channels: spec.channels,
            },
            samples,
        })
    }

    /// Playback duration of the loaded audio
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples.len())
    }

    /// Split into playback chunks of `samples_per_chunk` frames
    #[must_use]
    pub fn chunks(&self, samples_per_chunk: usize) -> Vec<Vec<u8>> {
        let chunk_bytes =
            samples_per_chunk * usize::from(self.format.width) * usize::from(self.format.channels);
        self.samples
            .chunks(chunk_bytes.max(1))
            .map(<[u8]>::to_vec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn volume_multiplies_and_saturates() {
        let samples = pcm(&[1000, -1000, 30000, -30000]);
        let doubled = multiply_volume(&samples, 2.0);
        let values: Vec<i16> = doubled
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![2000, -2000, 32767, -32768]);
    }

    #[test]
    fn volume_identity_preserves_samples() {
        let samples = pcm(&[12, -7, 0, 32767]);
        assert_eq!(multiply_volume(&samples, 1.0), samples);
    }

    #[test]
    fn channel_selection_by_stride() {
        let format = AudioFormat {
            rate: 16_000,
            width: 2,
            channels: 2,
        };
        // Interleaved stereo: L=1,R=2, L=3,R=4
        let samples = pcm(&[1, 2, 3, 4]);

        assert_eq!(select_channel(&samples, format, 0).unwrap(), pcm(&[1, 3]));
        assert_eq!(select_channel(&samples, format, 1).unwrap(), pcm(&[2, 4]));
    }

    #[test]
    fn channel_selection_rejects_bad_input() {
        let format = AudioFormat {
            rate: 16_000,
            width: 2,
            channels: 2,
        };
        assert!(select_channel(&[0, 0, 0, 0], format, 2).is_err());

        let wide = AudioFormat {
            width: 4,
            ..format
        };
        assert!(select_channel(&[0u8; 8], wide, 0).is_err());
    }

    #[test]
    fn silence_matches_shape() {
        let samples = pcm(&[5, -5, 9]);
        let quiet = silence_like(&samples);
        assert_eq!(quiet.len(), samples.len());
        assert!(quiet.iter().all(|&b| b == 0));
    }

    #[test]
    fn ring_keeps_most_recent_bytes() {
        let mut ring = AudioRing::new(4);
        ring.push(&[1, 2]);
        ring.push(&[3, 4, 5]);
        assert_eq!(ring.take(), vec![2, 3, 4, 5]);
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_handles_oversized_push() {
        let mut ring = AudioRing::new(3);
        ring.push(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(ring.take(), vec![4, 5, 6]);
    }

    #[test]
    fn zero_capacity_ring_stays_empty() {
        let mut ring = AudioRing::new(0);
        ring.push(&[1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn rechunker_carries_leftover() {
        let mut rechunker = Rechunker::default();
        assert!(rechunker.push(&[1, 2, 3], 4).is_empty());
        let chunks = rechunker.push(&[4, 5, 6, 7, 8, 9], 4);
        assert_eq!(chunks, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        let chunks = rechunker.push(&[10, 11, 12], 4);
        assert_eq!(chunks, vec![vec![9, 10, 11, 12]]);
    }

    #[test]
    fn chunk_duration_from_format() {
        let chunk = AudioChunk {
            format: AudioFormat::SPEECH,
            samples: vec![0u8; 32_000],
            timestamp_ms: 0,
        };
        assert_eq!(chunk.duration(), Duration::from_secs(1));
    }

    #[test]
    fn mute_gate_window() {
        let gate = MuteGate::default();
        assert!(!gate.is_muted());

        gate.mute_for(Duration::from_secs(60));
        assert!(gate.is_muted());

        // A shorter window never truncates a longer one
        gate.mute_for(Duration::from_millis(1));
        assert!(gate.is_muted());
    }

    #[test]
    fn mute_gate_expires() {
        let gate = MuteGate::default();
        gate.mute_for(Duration::ZERO);
        assert!(!gate.is_muted());
    }

    #[test]
    fn wav_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for value in [0i16, 1000, -1000, 500] {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();

        let wav = WavAudio::load(&path).unwrap();
        assert_eq!(wav.format.rate, 22_050);
        assert_eq!(wav.format.channels, 1);
        assert_eq!(wav.samples.len(), 8);

        let chunks = wav.chunks(2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4);
    }
}
