//! Satellite configuration
//!
//! Built once from the CLI in `main` and passed by reference at
//! construction; nothing reads configuration ambiently.

use std::path::PathBuf;
use std::time::Duration;

use crate::audio::AudioFormat;
use crate::{Error, Result};

/// How the satellite decides when audio flows upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteMode {
    /// Stream continuously while a server is connected
    Always,
    /// Stream only after local voice activity is detected
    VadGated,
    /// Stream only after a local wake word detection
    LocalWake,
}

/// Satellite configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind URI for the main server listener (`tcp://` or `unix://`)
    pub uri: String,

    /// Advertised satellite name
    pub name: String,

    /// Advertised area name
    pub area: Option<String>,

    pub mic: MicConfig,
    pub snd: SndConfig,
    pub wake: WakeConfig,
    pub vad: VadConfig,
    pub event: EventConfig,
    pub timer: TimerConfig,
    pub discovery: DiscoveryConfig,

    /// Command run once before serving
    pub startup_command: Option<Vec<String>>,
}

impl Config {
    /// Satellite mode implied by the configured services
    #[must_use]
    pub fn mode(&self) -> SatelliteMode {
        if self.wake.enabled() {
            SatelliteMode::LocalWake
        } else if self.vad.enabled {
            SatelliteMode::VadGated
        } else {
            SatelliteMode::Always
        }
    }

    /// Fail-fast validation of the assembled configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a missing mic endpoint, out-of-range
    /// DSP levels, or a feedback WAV path that does not exist.
    pub fn validate(&self) -> Result<()> {
        if !self.mic.enabled() {
            return Err(Error::Config(
                "either --mic-uri or --mic-command is required".to_string(),
            ));
        }
        if self.mic.uri.is_some() && self.mic.command.is_some() {
            return Err(Error::Config(
                "--mic-uri and --mic-command are mutually exclusive".to_string(),
            ));
        }
        if self.mic.noise_suppression > 4 {
            return Err(Error::Config(format!(
                "--mic-noise-suppression must be 0-4, got {}",
                self.mic.noise_suppression
            )));
        }
        if self.mic.auto_gain > 31 {
            return Err(Error::Config(format!(
                "--mic-auto-gain must be 0-31, got {}",
                self.mic.auto_gain
            )));
        }
        if let Some(index) = self.mic.channel_index {
            if index >= self.mic.channels {
                return Err(Error::Config(format!(
                    "--mic-channel-index {index} out of range for {} channels",
                    self.mic.channels
                )));
            }
        }
        if self.wake.enabled() && self.wake.names.is_empty() {
            return Err(Error::Config(
                "--wake-word-name is required with a wake service".to_string(),
            ));
        }

        for (flag, wav) in [
            ("--awake-wav", &self.snd.awake_wav),
            ("--done-wav", &self.snd.done_wav),
            ("--timer-finished-wav", &self.timer.finished_wav),
        ] {
            if let Some(path) = wav {
                if !path.is_file() {
                    return Err(Error::Config(format!(
                        "{flag} {} does not exist",
                        path.display()
                    )));
                }
            }
        }

        for command in self.hook_commands() {
            if command.is_empty() {
                return Err(Error::Config("empty hook command".to_string()));
            }
        }

        Ok(())
    }

    fn hook_commands(&self) -> impl Iterator<Item = &Vec<String>> {
        let event = &self.event;
        let timer = &self.timer;
        [
            &self.startup_command,
            &event.connected,
            &event.disconnected,
            &event.detect,
            &event.detection,
            &event.voice_started,
            &event.voice_stopped,
            &event.transcript,
            &event.synthesize,
            &event.tts_start,
            &event.tts_stop,
            &event.tts_played,
            &event.streaming_start,
            &event.streaming_stop,
            &event.error,
            &timer.started,
            &timer.updated,
            &timer.cancelled,
            &timer.finished,
        ]
        .into_iter()
        .filter_map(Option::as_ref)
    }
}

/// Microphone service configuration
#[derive(Debug, Clone)]
pub struct MicConfig {
    /// Remote mic peer URI
    pub uri: Option<String>,

    /// Local capture subprocess (program + args)
    pub command: Option<Vec<String>>,

    /// Capture sample rate in hertz
    pub rate: u32,

    /// Capture sample width in bytes
    pub width: u16,

    /// Capture channel count
    pub channels: u16,

    /// Samples read at a time from a capture subprocess
    pub samples_per_chunk: usize,

    /// Pre-DSP gain (1.0 = no change)
    pub volume_multiplier: f32,

    /// Automatic gain control target (0-31 dBFS, 0 = off)
    pub auto_gain: u8,

    /// Noise suppression level (0-4, 0 = off)
    pub noise_suppression: u8,

    /// Downmix to this input channel when set
    pub channel_index: Option<u16>,

    /// Extra mute window after the awake WAV finishes
    pub seconds_to_mute_after_awake_wav: f32,

    /// Disable the feedback mute entirely
    pub no_mute_during_awake_wav: bool,
}

impl MicConfig {
    /// True if a mic endpoint is configured
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.uri.is_some() || self.command.is_some()
    }

    /// Capture format
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        AudioFormat {
            rate: self.rate,
            width: self.width,
            channels: self.channels,
        }
    }

    /// True if any per-chunk transform is active
    #[must_use]
    pub fn needs_processing(&self) -> bool {
        (self.volume_multiplier - 1.0).abs() > f32::EPSILON
            || self.auto_gain > 0
            || self.noise_suppression > 0
            || self.channel_index.is_some()
    }
}

/// Sound output service configuration
#[derive(Debug, Clone)]
pub struct SndConfig {
    /// Remote snd peer URI
    pub uri: Option<String>,

    /// Local playback subprocess (program + args)
    pub command: Option<Vec<String>>,

    /// Output sample rate in hertz
    pub rate: u32,

    /// Output sample width in bytes
    pub width: u16,

    /// Output channel count
    pub channels: u16,

    /// Samples written at a time to a playback subprocess
    pub samples_per_chunk: usize,

    /// Post-mix gain (1.0 = no change)
    pub volume_multiplier: f32,

    /// WAV played after a wake word detection
    pub awake_wav: Option<PathBuf>,

    /// WAV played after a voice command is recognized
    pub done_wav: Option<PathBuf>,

    /// Queued playback requests before the drop policy applies
    pub queue_max: usize,
}

impl SndConfig {
    /// True if a sound endpoint is configured
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.uri.is_some() || self.command.is_some()
    }

    /// Output format
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        AudioFormat {
            rate: self.rate,
            width: self.width,
            channels: self.channels,
        }
    }
}

/// A wake word to arm, with an optional server pipeline to run for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeWordEntry {
    pub name: String,
    pub pipeline: Option<String>,
}

/// Wake word service configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Remote wake peer URI
    pub uri: Option<String>,

    /// Local wake subprocess (program + args)
    pub command: Option<Vec<String>>,

    /// Wake words to arm
    pub names: Vec<WakeWordEntry>,

    /// Minimum interval between accepted detections; `None` disables
    pub refractory_seconds: Option<f32>,
}

impl WakeConfig {
    /// True if a wake endpoint is configured
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.uri.is_some() || self.command.is_some()
    }

    /// Armed wake word names
    #[must_use]
    pub fn active_names(&self) -> Vec<String> {
        self.names.iter().map(|w| w.name.clone()).collect()
    }

    /// Refractory window as a duration, if enabled
    #[must_use]
    pub fn refractory(&self) -> Option<Duration> {
        self.refractory_seconds
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f32)
    }
}

/// Voice activity detector configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub enabled: bool,

    /// Speech probability threshold (0-1)
    pub threshold: f32,

    /// Chunks over threshold before activation
    pub trigger_level: u32,

    /// Seconds of pre-roll audio kept for replay on activation
    pub buffer_seconds: f32,

    /// Seconds of streaming without a server detection before
    /// returning to waiting-for-speech; `None` disables
    pub wake_word_timeout: Option<f32>,
}

/// External event sink configuration: a forwarding peer plus
/// per-event-kind subprocess hooks
#[derive(Debug, Clone, Default)]
pub struct EventConfig {
    /// Event peer URI for forwarded lifecycle events
    pub uri: Option<String>,

    pub connected: Option<Vec<String>>,
    pub disconnected: Option<Vec<String>>,
    pub detect: Option<Vec<String>>,
    pub detection: Option<Vec<String>>,
    pub voice_started: Option<Vec<String>>,
    pub voice_stopped: Option<Vec<String>>,
    pub transcript: Option<Vec<String>>,
    pub synthesize: Option<Vec<String>>,
    pub tts_start: Option<Vec<String>>,
    pub tts_stop: Option<Vec<String>>,
    pub tts_played: Option<Vec<String>>,
    pub streaming_start: Option<Vec<String>>,
    pub streaming_stop: Option<Vec<String>>,
    pub error: Option<Vec<String>>,
}

impl EventConfig {
    /// True if an event peer is configured
    #[must_use]
    pub const fn peer_enabled(&self) -> bool {
        self.uri.is_some()
    }
}

/// Voice timer configuration
#[derive(Debug, Clone, Default)]
pub struct TimerConfig {
    pub started: Option<Vec<String>>,
    pub updated: Option<Vec<String>>,
    pub cancelled: Option<Vec<String>>,
    pub finished: Option<Vec<String>>,

    /// WAV played when a timer finishes
    pub finished_wav: Option<PathBuf>,

    /// Times to play the finished WAV
    pub finished_wav_plays: u32,

    /// Delay between finished WAV repeats
    pub finished_wav_delay: f32,
}

/// Zeroconf discovery configuration
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    pub enabled: bool,

    /// Instance name; defaults to a MAC-derived identifier
    pub name: Option<String>,

    /// Advertised host address; defaults to interface detection
    pub host: Option<String>,
}

/// Split a command string into program + args on whitespace.
///
/// Returns `None` for an empty or missing string.
#[must_use]
pub fn split_command(command: Option<&str>) -> Option<Vec<String>> {
    let command = command?.trim();
    if command.is_empty() {
        return None;
    }
    Some(command.split_whitespace().map(ToString::to_string).collect())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        uri: "tcp://127.0.0.1:10700".to_string(),
        name: "Test Satellite".to_string(),
        area: None,
        mic: MicConfig {
            uri: Some("tcp://127.0.0.1:10600".to_string()),
            command: None,
            rate: 16_000,
            width: 2,
            channels: 1,
            samples_per_chunk: 1024,
            volume_multiplier: 1.0,
            auto_gain: 0,
            noise_suppression: 0,
            channel_index: None,
            seconds_to_mute_after_awake_wav: 0.5,
            no_mute_during_awake_wav: false,
        },
        snd: SndConfig {
            uri: None,
            command: None,
            rate: 22_050,
            width: 2,
            channels: 1,
            samples_per_chunk: 1024,
            volume_multiplier: 1.0,
            awake_wav: None,
            done_wav: None,
            queue_max: 16,
        },
        wake: WakeConfig {
            uri: None,
            command: None,
            names: Vec::new(),
            refractory_seconds: Some(5.0),
        },
        vad: VadConfig {
            enabled: false,
            threshold: 0.5,
            trigger_level: 1,
            buffer_seconds: 2.0,
            wake_word_timeout: Some(5.0),
        },
        event: EventConfig::default(),
        timer: TimerConfig {
            finished_wav_plays: 1,
            ..TimerConfig::default()
        },
        discovery: DiscoveryConfig::default(),
        startup_command: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selection_prefers_wake_over_vad() {
        let mut config = test_config();
        assert_eq!(config.mode(), SatelliteMode::Always);

        config.vad.enabled = true;
        assert_eq!(config.mode(), SatelliteMode::VadGated);

        config.wake.uri = Some("tcp://127.0.0.1:10400".to_string());
        config.wake.names.push(WakeWordEntry {
            name: "ok_nabu".to_string(),
            pipeline: None,
        });
        assert_eq!(config.mode(), SatelliteMode::LocalWake);
    }

    #[test]
    fn validate_requires_mic() {
        let mut config = test_config();
        config.mic.uri = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--mic-uri"));
    }

    #[test]
    fn validate_rejects_dsp_out_of_range() {
        let mut config = test_config();
        config.mic.noise_suppression = 5;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.mic.auto_gain = 32;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_channel_index_out_of_range() {
        let mut config = test_config();
        config.mic.channels = 2;
        config.mic.channel_index = Some(2);
        assert!(config.validate().is_err());

        config.mic.channel_index = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_wav() {
        let mut config = test_config();
        config.snd.uri = Some("tcp://127.0.0.1:10601".to_string());
        config.snd.awake_wav = Some(PathBuf::from("/nonexistent/awake.wav"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_wake_names_with_wake_service() {
        let mut config = test_config();
        config.wake.uri = Some("tcp://127.0.0.1:10400".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--wake-word-name"));
    }

    #[test]
    fn split_command_on_whitespace() {
        assert_eq!(
            split_command(Some("aplay -r 22050 -c 1")),
            Some(vec![
                "aplay".to_string(),
                "-r".to_string(),
                "22050".to_string(),
                "-c".to_string(),
                "1".to_string(),
            ])
        );
        assert_eq!(split_command(Some("  ")), None);
        assert_eq!(split_command(None), None);
    }

    #[test]
    fn mic_needs_processing_flags() {
        let mut config = test_config();
        assert!(!config.mic.needs_processing());

        config.mic.volume_multiplier = 1.5;
        assert!(config.mic.needs_processing());

        config.mic.volume_multiplier = 1.0;
        config.mic.channel_index = Some(0);
        assert!(config.mic.needs_processing());
    }

    #[test]
    fn refractory_zero_disables() {
        let mut config = test_config();
        config.wake.refractory_seconds = Some(0.0);
        assert!(config.wake.refractory().is_none());

        config.wake.refractory_seconds = Some(5.0);
        assert_eq!(config.wake.refractory(), Some(Duration::from_secs(5)));
    }
}
