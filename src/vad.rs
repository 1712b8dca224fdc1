//! Voice activity detection
//!
//! The scorer turns a per-chunk speech probability into a trigger edge:
//! `trigger_level` chunks over `threshold` within a rolling window fire a
//! single speech-detected event. The probability source sits behind a
//! trait so an external model can replace the built-in energy estimate.

use crate::{Error, Result};

/// Full-scale reference for the energy estimate; an RMS at this fraction
/// of full scale maps to probability 0.5
const ENERGY_REFERENCE: f32 = 0.06;

/// Per-chunk speech probability source
pub trait SpeechProbability: Send {
    /// Probability (0-1) that the chunk contains speech.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dsp`] when the detector cannot score the chunk;
    /// the caller skips the chunk and continues.
    fn probability(&mut self, samples: &[u8]) -> Result<f32>;

    /// Clear internal state between utterances
    fn reset(&mut self) {}
}

/// RMS-energy speech estimate over 16-bit PCM
#[derive(Debug, Default)]
pub struct EnergyDetector;

impl SpeechProbability for EnergyDetector {
    fn probability(&mut self, samples: &[u8]) -> Result<f32> {
        if samples.len() % 2 != 0 {
            return Err(Error::Dsp("odd sample buffer".to_string()));
        }
        Ok((rms(samples) / ENERGY_REFERENCE / 2.0).clamp(0.0, 1.0))
    }
}

/// RMS of 16-bit PCM normalized to 0-1 full scale
#[must_use]
pub fn rms(samples: &[u8]) -> f32 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for pair in samples.chunks_exact(2) {
        let value = f64::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0;
        sum_squares += value * value;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / count as f64).sqrt() as f32;
    rms
}

/// Trigger-counting scorer over a probability source
pub struct VadScorer {
    detector: Box<dyn SpeechProbability>,
    threshold: f32,
    trigger_level: u32,
    activation: u32,
}

impl VadScorer {
    /// Create a scorer with the given probability source
    #[must_use]
    pub fn new(detector: Box<dyn SpeechProbability>, threshold: f32, trigger_level: u32) -> Self {
        Self {
            detector,
            threshold,
            trigger_level: trigger_level.max(1),
            activation: 0,
        }
    }

    /// Score one chunk; true exactly when the trigger level is reached.
    ///
    /// Chunks over the threshold raise the activation count; chunks under
    /// it decay the count by one, forming the rolling window.
    pub fn push(&mut self, samples: &[u8]) -> bool {
        let probability = match self.detector.probability(samples) {
            Ok(probability) => probability,
            Err(e) => {
                tracing::debug!(error = %e, "vad stage skipped for chunk");
                return false;
            }
        };

        if probability >= self.threshold {
            self.activation += 1;
            if self.activation >= self.trigger_level {
                self.activation = 0;
                return true;
            }
        } else {
            self.activation = self.activation.saturating_sub(1);
        }
        false
    }

    /// Clear trigger state between utterances
    pub fn reset(&mut self) {
        self.activation = 0;
        self.detector.reset();
    }
}

impl std::fmt::Debug for VadScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadScorer")
            .field("threshold", &self.threshold)
            .field("trigger_level", &self.trigger_level)
            .field("activation", &self.activation)
            .finish_non_exhaustive()
    }
}
