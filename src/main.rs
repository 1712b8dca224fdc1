use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use beacon_satellite::config::{
    split_command, Config, DiscoveryConfig, EventConfig, MicConfig, SndConfig, TimerConfig,
    VadConfig, WakeConfig, WakeWordEntry,
};
use beacon_satellite::{Daemon, Error};

/// Beacon Satellite - Wyoming voice satellite daemon
#[derive(Parser)]
#[command(name = "beacon-satellite", version, about)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Bind address for the server listener (tcp:// or unix://)
    #[arg(long)]
    uri: String,

    /// Name of the satellite
    #[arg(long, default_value = "Beacon Satellite")]
    name: String,

    /// Area name of the satellite
    #[arg(long)]
    area: Option<String>,

    // Microphone input
    /// URI of the Wyoming microphone service
    #[arg(long)]
    mic_uri: Option<String>,

    /// Program to run for microphone input
    #[arg(long)]
    mic_command: Option<String>,

    /// Sample rate of mic-command audio (hertz)
    #[arg(long, default_value = "16000")]
    mic_command_rate: u32,

    /// Sample width of mic-command audio (bytes)
    #[arg(long, default_value = "2")]
    mic_command_width: u16,

    /// Sample channels of mic-command audio
    #[arg(long, default_value = "1")]
    mic_command_channels: u16,

    /// Samples to read at a time from mic-command
    #[arg(long, default_value = "1024")]
    mic_command_samples_per_chunk: usize,

    /// Multiplier for mic audio (1.0 = no change)
    #[arg(long, default_value = "1.0")]
    mic_volume_multiplier: f32,

    /// Noise suppression level (0-4, 4 is max)
    #[arg(long, default_value = "0")]
    mic_noise_suppression: u8,

    /// Automatic gain control (0-31 dBFS)
    #[arg(long, default_value = "0")]
    mic_auto_gain: u8,

    /// Take microphone input from a specific channel (first is 0)
    #[arg(long)]
    mic_channel_index: Option<u16>,

    /// Seconds to keep the mic muted after the awake WAV finishes
    #[arg(long, default_value = "0.5")]
    mic_seconds_to_mute_after_awake_wav: f32,

    /// Don't mute the microphone while the awake WAV is playing
    #[arg(long)]
    mic_no_mute_during_awake_wav: bool,

    // Sound output
    /// URI of the Wyoming sound service
    #[arg(long)]
    snd_uri: Option<String>,

    /// Program to run for sound output
    #[arg(long)]
    snd_command: Option<String>,

    /// Sample rate of snd-command audio (hertz)
    #[arg(long, default_value = "22050")]
    snd_command_rate: u32,

    /// Sample width of snd-command audio (bytes)
    #[arg(long, default_value = "2")]
    snd_command_width: u16,

    /// Sample channels of snd-command audio
    #[arg(long, default_value = "1")]
    snd_command_channels: u16,

    /// Samples to write at a time to snd-command
    #[arg(long, default_value = "1024")]
    snd_command_samples_per_chunk: usize,

    /// Multiplier for output audio (1.0 = no change)
    #[arg(long, default_value = "1.0")]
    snd_volume_multiplier: f32,

    // Local wake word detection
    /// URI of the Wyoming wake word service
    #[arg(long)]
    wake_uri: Option<String>,

    /// Program to run for wake word detection
    #[arg(long)]
    wake_command: Option<String>,

    /// Wake word name to listen for, with an optional pipeline name
    #[arg(long, num_args = 1..=2, value_names = ["NAME", "PIPELINE"], action = clap::ArgAction::Append, value_parser = clap::value_parser!(String))]
    wake_word_name: Vec<Vec<String>>,

    /// Seconds before another detection of the same wake word is handled
    #[arg(long, default_value = "5.0")]
    wake_refractory_seconds: f32,

    // Voice activity detection
    /// Wait for speech before streaming audio
    #[arg(long)]
    vad: bool,

    /// Speech probability threshold (0-1)
    #[arg(long, default_value = "0.5")]
    vad_threshold: f32,

    /// Chunks over threshold before activation
    #[arg(long, default_value = "1")]
    vad_trigger_level: u32,

    /// Seconds of audio to keep before activation
    #[arg(long, default_value = "2.0")]
    vad_buffer_seconds: f32,

    /// Seconds before going back to waiting for speech when the wake
    /// word isn't detected
    #[arg(long, default_value = "5.0")]
    vad_wake_word_timeout: f32,

    // External event handlers
    /// URI of a Wyoming service to forward events to
    #[arg(long)]
    event_uri: Option<String>,

    /// Command run when the satellite starts
    #[arg(long)]
    startup_command: Option<String>,

    /// Command run when connected to the server
    #[arg(long)]
    connected_command: Option<String>,

    /// Command run when disconnected from the server
    #[arg(long)]
    disconnected_command: Option<String>,

    /// Command run when wake word detection starts
    #[arg(long)]
    detect_command: Option<String>,

    /// Command run when a wake word is detected (name on stdin)
    #[arg(long)]
    detection_command: Option<String>,

    /// Command run when the user starts speaking
    #[arg(long)]
    stt_start_command: Option<String>,

    /// Command run when the user stops speaking
    #[arg(long)]
    stt_stop_command: Option<String>,

    /// Command run when a transcript is received (text on stdin)
    #[arg(long)]
    transcript_command: Option<String>,

    /// Command run when text-to-speech text is received (text on stdin)
    #[arg(long)]
    synthesize_command: Option<String>,

    /// Command run when the text-to-speech response starts
    #[arg(long)]
    tts_start_command: Option<String>,

    /// Command run when the text-to-speech response stops
    #[arg(long)]
    tts_stop_command: Option<String>,

    /// Command run when text-to-speech audio has finished playing
    #[arg(long)]
    tts_played_command: Option<String>,

    /// Command run when audio streaming starts
    #[arg(long)]
    streaming_start_command: Option<String>,

    /// Command run when audio streaming stops
    #[arg(long)]
    streaming_stop_command: Option<String>,

    /// Command run when an error occurs (text on stdin)
    #[arg(long)]
    error_command: Option<String>,

    /// Command run when a timer starts (JSON on stdin)
    #[arg(long)]
    timer_started_command: Option<String>,

    /// Command run when a timer is paused, resumed, or changed (JSON on stdin)
    #[arg(long)]
    timer_updated_command: Option<String>,

    /// Command run when a timer is cancelled (id on stdin)
    #[arg(long, alias = "timer-canceled-command")]
    timer_cancelled_command: Option<String>,

    /// Command run when a timer finishes (id on stdin)
    #[arg(long)]
    timer_finished_command: Option<String>,

    // Sounds
    /// WAV file to play when the wake word is detected
    #[arg(long)]
    awake_wav: Option<PathBuf>,

    /// WAV file to play when a voice command is done
    #[arg(long)]
    done_wav: Option<PathBuf>,

    /// WAV file to play when a timer finishes
    #[arg(long)]
    timer_finished_wav: Option<PathBuf>,

    /// Times to play the timer finished WAV and delay between repeats in
    /// seconds
    #[arg(long, num_args = 2, value_names = ["REPEAT", "DELAY"])]
    timer_finished_wav_repeat: Option<Vec<f32>>,

    // Zeroconf
    /// Disable discovery over zeroconf
    #[arg(long)]
    no_zeroconf: bool,

    /// Name used for zeroconf discovery (default: MAC address)
    #[arg(long)]
    zeroconf_name: Option<String>,

    /// Host address for zeroconf discovery (default: detect)
    #[arg(long)]
    zeroconf_host: Option<String>,

    // Diagnostics
    /// Log DEBUG messages
    #[arg(long)]
    debug: bool,

    /// Directory to store audio for debugging
    #[arg(long)]
    debug_recording_dir: Option<PathBuf>,

    /// Log line format (full or compact)
    #[arg(long, default_value = "full")]
    log_format: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "debug"
    } else {
        "info,beacon_satellite=info"
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter));
    if cli.log_format == "compact" {
        subscriber.compact().init();
    } else {
        subscriber.init();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            match e.downcast_ref::<Error>() {
                Some(Error::Config(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.debug_recording_dir.is_some() {
        tracing::warn!("--debug-recording-dir is accepted but recording is not supported");
    }

    let config = build_config(cli)?;
    config.validate()?;
    tracing::debug!(mode = ?config.mode(), "configuration validated");

    let daemon = Daemon::new(config);
    daemon.run().await?;

    Ok(())
}

fn build_config(cli: Cli) -> anyhow::Result<Config> {
    let wake_names = cli
        .wake_word_name
        .into_iter()
        .filter_map(|mut entry| {
            if entry.is_empty() {
                return None;
            }
            let pipeline = (entry.len() > 1).then(|| entry.remove(1));
            Some(WakeWordEntry {
                name: entry.remove(0),
                pipeline,
            })
        })
        .collect();

    let (finished_wav_plays, finished_wav_delay) = match cli.timer_finished_wav_repeat.as_deref() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some([repeat, delay]) => (repeat.max(0.0) as u32, *delay),
        _ => (1, 0.0),
    };

    Ok(Config {
        uri: cli.uri,
        name: cli.name,
        area: cli.area,
        mic: MicConfig {
            uri: cli.mic_uri,
            command: split_command(cli.mic_command.as_deref()),
            rate: cli.mic_command_rate,
            width: cli.mic_command_width,
            channels: cli.mic_command_channels,
            samples_per_chunk: cli.mic_command_samples_per_chunk,
            volume_multiplier: cli.mic_volume_multiplier,
            auto_gain: cli.mic_auto_gain,
            noise_suppression: cli.mic_noise_suppression,
            channel_index: cli.mic_channel_index,
            seconds_to_mute_after_awake_wav: cli.mic_seconds_to_mute_after_awake_wav,
            no_mute_during_awake_wav: cli.mic_no_mute_during_awake_wav,
        },
        snd: SndConfig {
            uri: cli.snd_uri,
            command: split_command(cli.snd_command.as_deref()),
            rate: cli.snd_command_rate,
            width: cli.snd_command_width,
            channels: cli.snd_command_channels,
            samples_per_chunk: cli.snd_command_samples_per_chunk,
            volume_multiplier: cli.snd_volume_multiplier,
            awake_wav: cli.awake_wav,
            done_wav: cli.done_wav,
            queue_max: 16,
        },
        wake: WakeConfig {
            uri: cli.wake_uri,
            command: split_command(cli.wake_command.as_deref()),
            names: wake_names,
            refractory_seconds: (cli.wake_refractory_seconds > 0.0)
                .then_some(cli.wake_refractory_seconds),
        },
        vad: VadConfig {
            enabled: cli.vad,
            threshold: cli.vad_threshold,
            trigger_level: cli.vad_trigger_level,
            buffer_seconds: cli.vad_buffer_seconds,
            wake_word_timeout: (cli.vad_wake_word_timeout > 0.0)
                .then_some(cli.vad_wake_word_timeout),
        },
        event: EventConfig {
            uri: cli.event_uri,
            connected: split_command(cli.connected_command.as_deref()),
            disconnected: split_command(cli.disconnected_command.as_deref()),
            detect: split_command(cli.detect_command.as_deref()),
            detection: split_command(cli.detection_command.as_deref()),
            voice_started: split_command(cli.stt_start_command.as_deref()),
            voice_stopped: split_command(cli.stt_stop_command.as_deref()),
            transcript: split_command(cli.transcript_command.as_deref()),
            synthesize: split_command(cli.synthesize_command.as_deref()),
            tts_start: split_command(cli.tts_start_command.as_deref()),
            tts_stop: split_command(cli.tts_stop_command.as_deref()),
            tts_played: split_command(cli.tts_played_command.as_deref()),
            streaming_start: split_command(cli.streaming_start_command.as_deref()),
            streaming_stop: split_command(cli.streaming_stop_command.as_deref()),
            error: split_command(cli.error_command.as_deref()),
        },
        timer: TimerConfig {
            started: split_command(cli.timer_started_command.as_deref()),
            updated: split_command(cli.timer_updated_command.as_deref()),
            cancelled: split_command(cli.timer_cancelled_command.as_deref()),
            finished: split_command(cli.timer_finished_command.as_deref()),
            finished_wav: cli.timer_finished_wav,
            finished_wav_plays,
            finished_wav_delay,
        },
        discovery: DiscoveryConfig {
            enabled: !cli.no_zeroconf,
            name: cli.zeroconf_name,
            host: cli.zeroconf_host,
        },
        startup_command: split_command(cli.startup_command.as_deref()),
    })
}
