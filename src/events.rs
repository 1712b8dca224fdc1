//! Lifecycle events and their fan-out
//!
//! The state machine publishes lifecycle events on a single ordered
//! channel; the dispatcher delivers each one to the configured event
//! peer, the matching subprocess hook, and the feedback WAV scheduler.
//! Delivery order matches the state machine's observation order.

use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::audio::WavAudio;
use crate::config::Config;
use crate::hooks::{self, StdinPayload};
use crate::peer::PeerHandle;
use crate::protocol::{Event, TimerInfo};
use crate::snd::{PlaybackReason, SndHandle, SndRequest};
use crate::Result;

/// Satellite lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Startup,
    Connected,
    Disconnected,
    Detect,
    Detection { name: Option<String> },
    VoiceStarted,
    VoiceStopped,
    Transcript { text: String },
    Synthesize { text: String },
    TtsStart,
    TtsStop,
    TtsPlayed,
    StreamingStart,
    StreamingStop,
    Error { text: String },
    TimerStarted(TimerInfo),
    TimerUpdated(TimerInfo),
    TimerCancelled { id: String },
    TimerFinished { id: String },
}

impl LifecycleEvent {
    /// Stable kind label for logs and rate limiting
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Detect => "detect",
            Self::Detection { .. } => "detection",
            Self::VoiceStarted => "voice-started",
            Self::VoiceStopped => "voice-stopped",
            Self::Transcript { .. } => "transcript",
            Self::Synthesize { .. } => "synthesize",
            Self::TtsStart => "tts-start",
            Self::TtsStop => "tts-stop",
            Self::TtsPlayed => "played",
            Self::StreamingStart => "streaming-start",
            Self::StreamingStop => "streaming-stop",
            Self::Error { .. } => "error",
            Self::TimerStarted(_) => "timer-started",
            Self::TimerUpdated(_) => "timer-updated",
            Self::TimerCancelled { .. } => "timer-cancelled",
            Self::TimerFinished { .. } => "timer-finished",
        }
    }

    /// Wire event forwarded to the event peer, if this kind has one
    #[must_use]
    pub fn to_wire(&self) -> Option<Event> {
        match self {
            Self::Startup => None,
            Self::Connected => Some(Event::new("satellite-connected")),
            Self::Disconnected => Some(Event::new("satellite-disconnected")),
            Self::Detect => Some(Event::new("detect")),
            Self::Detection { name } => Some(match name {
                Some(name) => Event::with_data("detection", json!({ "name": name })),
                None => Event::new("detection"),
            }),
            Self::VoiceStarted => Some(Event::new("voice-started")),
            Self::VoiceStopped => Some(Event::new("voice-stopped")),
            Self::Transcript { text } => {
                Some(Event::with_data("transcript", json!({ "text": text })))
            }
            Self::Synthesize { text } => {
                Some(Event::with_data("synthesize", json!({ "text": text })))
            }
            Self::TtsStart => Some(Event::new("audio-start")),
            Self::TtsStop => Some(Event::new("audio-stop")),
            Self::TtsPlayed => Some(Event::new("played")),
            Self::StreamingStart => Some(Event::new("streaming-started")),
            Self::StreamingStop => Some(Event::new("streaming-stopped")),
            Self::Error { text } => Some(Event::with_data("error", json!({ "text": text }))),
            Self::TimerStarted(timer) => Some(Event::with_data(
                "timer-started",
                serde_json::to_value(timer).unwrap_or_default(),
            )),
            Self::TimerUpdated(timer) => Some(Event::with_data(
                "timer-updated",
                serde_json::to_value(timer).unwrap_or_default(),
            )),
            Self::TimerCancelled { id } => {
                Some(Event::with_data("timer-cancelled", json!({ "id": id })))
            }
            Self::TimerFinished { id } => {
                Some(Event::with_data("timer-finished", json!({ "id": id })))
            }
        }
    }

    /// Hook command and stdin payload for this event, if configured
    fn hook<'a>(&self, config: &'a Config) -> Option<(&'a [String], StdinPayload)> {
        let (command, payload) = match self {
            Self::Startup => (&config.startup_command, StdinPayload::None),
            Self::Connected => (&config.event.connected, StdinPayload::None),
            Self::Disconnected => (&config.event.disconnected, StdinPayload::None),
            Self::Detect => (&config.event.detect, StdinPayload::None),
            Self::Detection { name } => (
                &config.event.detection,
                StdinPayload::Text(name.clone().unwrap_or_default()),
            ),
            Self::VoiceStarted => (&config.event.voice_started, StdinPayload::None),
            Self::VoiceStopped => (&config.event.voice_stopped, StdinPayload::None),
            Self::Transcript { text } => {
                (&config.event.transcript, StdinPayload::Text(text.clone()))
            }
            Self::Synthesize { text } => {
                (&config.event.synthesize, StdinPayload::Text(text.clone()))
            }
            Self::TtsStart => (&config.event.tts_start, StdinPayload::None),
            Self::TtsStop => (&config.event.tts_stop, StdinPayload::None),
            Self::TtsPlayed => (&config.event.tts_played, StdinPayload::None),
            Self::StreamingStart => (&config.event.streaming_start, StdinPayload::None),
            Self::StreamingStop => (&config.event.streaming_stop, StdinPayload::None),
            Self::Error { text } => (&config.event.error, StdinPayload::Text(text.clone())),
            Self::TimerStarted(timer) => (
                &config.timer.started,
                StdinPayload::Json(serde_json::to_value(timer).unwrap_or_default()),
            ),
            Self::TimerUpdated(timer) => (
                &config.timer.updated,
                StdinPayload::Json(serde_json::to_value(timer).unwrap_or_default()),
            ),
            Self::TimerCancelled { id } => {
                (&config.timer.cancelled, StdinPayload::Text(id.clone()))
            }
            Self::TimerFinished { id } => {
                (&config.timer.finished, StdinPayload::Text(id.clone()))
            }
        };
        command.as_deref().map(|command| (command, payload))
    }
}

/// Sender half of the fan-out dispatcher
#[derive(Debug, Clone)]
pub struct FanoutHandle {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl FanoutHandle {
    /// Publish one lifecycle event, preserving emission order
    pub async fn emit(&self, event: LifecycleEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("fan-out gone, lifecycle event discarded");
        }
    }
}

/// Build a [`FanoutHandle`] over a bare channel, for tests that observe
/// emitted lifecycle events directly
#[cfg(test)]
pub(crate) fn test_fanout_handle(tx: mpsc::Sender<LifecycleEvent>) -> FanoutHandle {
    FanoutHandle { tx }
}

/// Feedback WAVs preloaded at startup
struct FeedbackSounds {
    awake: Option<WavAudio>,
    done: Option<WavAudio>,
    timer_finished: Option<WavAudio>,
}

impl FeedbackSounds {
    fn load(config: &Config) -> Result<Self> {
        let load = |path: &Option<std::path::PathBuf>| -> Result<Option<WavAudio>> {
            path.as_deref().map(WavAudio::load).transpose()
        };
        Ok(Self {
            awake: load(&config.snd.awake_wav)?,
            done: load(&config.snd.done_wav)?,
            timer_finished: load(&config.timer.finished_wav)?,
        })
    }
}

/// Spawn the fan-out dispatcher.
///
/// # Errors
///
/// Returns [`crate::Error::Config`] when a configured feedback WAV
/// cannot be loaded.
pub fn spawn_fanout(
    config: &Config,
    event_peer: Option<PeerHandle>,
    snd: Option<SndHandle>,
    shutdown: watch::Receiver<bool>,
) -> Result<FanoutHandle> {
    let sounds = FeedbackSounds::load(config)?;
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(fanout_loop(
        config.clone(),
        sounds,
        event_peer,
        snd,
        rx,
        shutdown,
    ));
    Ok(FanoutHandle { tx })
}

async fn fanout_loop(
    config: Config,
    sounds: FeedbackSounds,
    event_peer: Option<PeerHandle>,
    snd: Option<SndHandle>,
    mut rx: mpsc::Receiver<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            () = shutdown_flip(&mut shutdown) => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        tracing::debug!(kind = event.kind(), "lifecycle event");

        // Event peer: best-effort, the peer's own retry applies
        if let Some(peer) = &event_peer {
            if let Some(wire) = event.to_wire() {
                peer.send_raw(wire).await;
            }
        }

        // Subprocess hook: fire-and-forget
        if let Some((command, payload)) = event.hook(&config) {
            hooks::fire(command, payload);
        }

        // Feedback scheduler
        if let Some(snd) = &snd {
            schedule_feedback(&config, &sounds, snd, &event).await;
        }
    }

    tracing::debug!("fan-out stopped");
}

async fn schedule_feedback(
    config: &Config,
    sounds: &FeedbackSounds,
    snd: &SndHandle,
    event: &LifecycleEvent,
) {
    match event {
        LifecycleEvent::Detection { .. } => {
            if let Some(wav) = &sounds.awake {
                snd.send(SndRequest::PlayWav {
                    wav: wav.clone(),
                    reason: PlaybackReason::Feedback,
                    repeat: 1,
                    delay: Duration::ZERO,
                    mute_mic: !config.mic.no_mute_during_awake_wav,
                })
                .await;
            }
        }
        LifecycleEvent::TtsStop => {
            if let Some(wav) = &sounds.done {
                snd.send(SndRequest::PlayWav {
                    wav: wav.clone(),
                    reason: PlaybackReason::Feedback,
                    repeat: 1,
                    delay: Duration::ZERO,
                    mute_mic: false,
                })
                .await;
            }
        }
        LifecycleEvent::TimerFinished { .. } => {
            if let Some(wav) = &sounds.timer_finished {
                snd.send(SndRequest::PlayWav {
                    wav: wav.clone(),
                    reason: PlaybackReason::TimerFinished,
                    repeat: config.timer.finished_wav_plays,
                    delay: Duration::from_secs_f32(config.timer.finished_wav_delay.max(0.0)),
                    mute_mic: !config.mic.no_mute_during_awake_wav,
                })
                .await;
            }
        }
        _ => {}
    }
}

async fn shutdown_flip(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
