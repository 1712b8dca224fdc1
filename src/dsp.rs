//! Mic DSP stages
//!
//! Auto-gain and noise suppression sit behind [`AudioProcessor`] so a
//! hardware or model-backed implementation can be swapped in. The
//! built-in stages are energy-based approximations; a stage that fails
//! is skipped for that chunk only.

use crate::audio::multiply_volume;
use crate::vad::rms;
use crate::{Error, Result};

/// One in-place transform over a chunk of 16-bit PCM
pub trait AudioProcessor: Send {
    /// Process one chunk, returning the transformed samples.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dsp`] when the stage cannot process the chunk;
    /// the pipeline passes the chunk through unchanged.
    fn process(&mut self, samples: &[u8]) -> Result<Vec<u8>>;
}

/// Automatic gain control toward a target level.
///
/// `level` maps 0-31 to a target of -`level` dBFS, matching the usual
/// capture-DSP convention. Gain is smoothed across chunks to avoid
/// pumping.
pub struct AutoGain {
    target_rms: f32,
    gain: f32,
}

impl AutoGain {
    /// Smoothing factor applied to gain updates per chunk
    const SMOOTHING: f32 = 0.2;

    /// Create a stage targeting -`level` dBFS
    #[must_use]
    pub fn new(level: u8) -> Self {
        let dbfs = -f32::from(level.min(31));
        Self {
            target_rms: 10f32.powf(dbfs / 20.0),
            gain: 1.0,
        }
    }
}

impl AudioProcessor for AutoGain {
    fn process(&mut self, samples: &[u8]) -> Result<Vec<u8>> {
        if samples.len() % 2 != 0 {
            return Err(Error::Dsp("odd sample buffer".to_string()));
        }
        let level = rms(samples);
        if level > 0.0 {
            let desired = (self.target_rms / level).clamp(0.1, 16.0);
            self.gain += (desired - self.gain) * Self::SMOOTHING;
        }
        Ok(multiply_volume(samples, self.gain))
    }
}

/// Noise gate: attenuates chunks whose energy sits below a floor scaled
/// by the suppression level (1-4).
pub struct NoiseGate {
    floor: f32,
    attenuation: f32,
}

impl NoiseGate {
    /// Base noise floor at level 1, as a fraction of full scale
    const BASE_FLOOR: f32 = 0.005;

    /// Create a gate for suppression level 1-4
    #[must_use]
    pub fn new(level: u8) -> Self {
        let level = level.clamp(1, 4);
        Self {
            floor: Self::BASE_FLOOR * f32::from(level),
            attenuation: 1.0 / (f32::from(level) + 1.0),
        }
    }
}

impl AudioProcessor for NoiseGate {
    fn process(&mut self, samples: &[u8]) -> Result<Vec<u8>> {
        if samples.len() % 2 != 0 {
            return Err(Error::Dsp("odd sample buffer".to_string()));
        }
        if rms(samples) < self.floor {
            return Ok(multiply_volume(samples, self.attenuation));
        }
        Ok(samples.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16, len: usize) -> Vec<u8> {
        std::iter::repeat(amplitude.to_le_bytes())
            .take(len)
            .flatten()
            .collect()
    }

    #[test]
    fn auto_gain_amplifies_quiet_signal() {
        let mut stage = AutoGain::new(3);
        let quiet = tone(500, 512);

        // Run a few chunks so the smoothed gain settles upward
        let mut out = quiet.clone();
        for _ in 0..20 {
            out = stage.process(&quiet).unwrap();
        }
        assert!(rms(&out) > rms(&quiet));
    }

    #[test]
    fn auto_gain_reduces_hot_signal() {
        let mut stage = AutoGain::new(20);
        let hot = tone(28_000, 512);

        let mut out = hot.clone();
        for _ in 0..20 {
            out = stage.process(&hot).unwrap();
        }
        assert!(rms(&out) < rms(&hot));
    }

    #[test]
    fn noise_gate_attenuates_below_floor() {
        let mut gate = NoiseGate::new(4);
        let hiss = tone(30, 512);
        let out = gate.process(&hiss).unwrap();
        assert!(rms(&out) < rms(&hiss));
    }

    #[test]
    fn noise_gate_passes_speech_untouched() {
        let mut gate = NoiseGate::new(4);
        let speech = tone(8000, 512);
        assert_eq!(gate.process(&speech).unwrap(), speech);
    }

    #[test]
    fn stages_reject_odd_buffers() {
        assert!(AutoGain::new(5).process(&[1, 2, 3]).is_err());
        assert!(NoiseGate::new(2).process(&[1]).is_err());
    }
}
