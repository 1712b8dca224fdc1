//! Microphone pipeline
//!
//! Pulls chunks from the mic source, runs the transform chain (channel
//! select, volume, DSP, mute gate, VAD), and broadcasts processed chunks
//! to subscribers. The broadcaster never blocks on a slow subscriber;
//! lagging receivers drop chunks with a warning on their side.

use tokio::sync::{broadcast, mpsc, watch};

use crate::audio::{multiply_volume, select_channel, silence_like, AudioChunk, AudioRing, MuteGate};
use crate::config::{MicConfig, VadConfig};
use crate::dsp::{AudioProcessor, AutoGain, NoiseGate};
use crate::peer::PeerNotice;
use crate::protocol::Message;
use crate::vad::{EnergyDetector, VadScorer};

/// Broadcast capacity; a subscriber more than this many chunks behind
/// starts losing audio
const BROADCAST_CAPACITY: usize = 64;

/// Edges from the mic pipeline to the state machine
#[derive(Debug)]
pub enum MicNotice {
    /// VAD trigger fired; carries the pre-roll audio captured before the
    /// edge, oldest first
    SpeechDetected { preroll: Option<AudioChunk> },
}

/// Spawn the mic pipeline over a source notice stream.
///
/// Returns the processed-chunk broadcast and the notice stream. The VAD
/// scorer runs only when `vad` is enabled (VAD-gated mode).
pub fn spawn_mic(
    config: MicConfig,
    vad: Option<VadConfig>,
    source: mpsc::Receiver<PeerNotice>,
    mute: MuteGate,
    shutdown: watch::Receiver<bool>,
) -> (broadcast::Sender<AudioChunk>, mpsc::Receiver<MicNotice>) {
    let (chunks_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let (notice_tx, notice_rx) = mpsc::channel(8);
    tokio::spawn(mic_loop(
        config,
        vad,
        source,
        mute,
        chunks_tx.clone(),
        notice_tx,
        shutdown,
    ));
    (chunks_tx, notice_rx)
}

struct VadState {
    scorer: VadScorer,
    ring: AudioRing,
}

async fn mic_loop(
    config: MicConfig,
    vad: Option<VadConfig>,
    mut source: mpsc::Receiver<PeerNotice>,
    mute: MuteGate,
    chunks_tx: broadcast::Sender<AudioChunk>,
    notice_tx: mpsc::Sender<MicNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut auto_gain = (config.auto_gain > 0).then(|| AutoGain::new(config.auto_gain));
    let mut noise_gate =
        (config.noise_suppression > 0).then(|| NoiseGate::new(config.noise_suppression));

    let mut vad_state = vad.filter(|v| v.enabled).map(|v| {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let ring_capacity =
            (v.buffer_seconds.max(0.0) * config.format().bytes_per_second() as f32) as usize;
        VadState {
            scorer: VadScorer::new(Box::new(EnergyDetector), v.threshold, v.trigger_level),
            ring: AudioRing::new(ring_capacity),
        }
    });

    loop {
        let notice = tokio::select! {
            () = shutdown_flip(&mut shutdown) => break,
            notice = source.recv() => match notice {
                Some(notice) => notice,
                None => break,
            },
        };

        let chunk = match notice {
            PeerNotice::Connected => {
                tracing::info!("mic source connected");
                continue;
            }
            PeerNotice::Disconnected => {
                tracing::warn!("mic source disconnected");
                continue;
            }
            PeerNotice::Message(Message::AudioChunk(chunk)) => chunk,
            PeerNotice::Message(other) => {
                tracing::debug!(event = ?other, "unexpected mic event skipped");
                continue;
            }
        };

        let chunk = process_chunk(
            &config,
            auto_gain.as_mut(),
            noise_gate.as_mut(),
            &mute,
            chunk,
        );

        if let Some(state) = &mut vad_state {
            // Muted silence never scores; the window survives the gap
            if !mute.is_muted() && state.scorer.push(&chunk.samples) {
                // The triggering chunk belongs to the utterance onset too
                state.ring.push(&chunk.samples);
                let preroll = (!state.ring.is_empty()).then(|| AudioChunk {
                    format: chunk.format,
                    samples: state.ring.take(),
                    timestamp_ms: chunk.timestamp_ms,
                });
                state.scorer.reset();
                if notice_tx
                    .send(MicNotice::SpeechDetected { preroll })
                    .await
                    .is_err()
                {
                    break;
                }
            } else {
                state.ring.push(&chunk.samples);
            }
        }

        // Errors only mean no subscribers right now
        let _ = chunks_tx.send(chunk);
    }

    tracing::debug!("mic pipeline stopped");
}

fn process_chunk(
    config: &MicConfig,
    auto_gain: Option<&mut AutoGain>,
    noise_gate: Option<&mut NoiseGate>,
    mute: &MuteGate,
    mut chunk: AudioChunk,
) -> AudioChunk {
    if let Some(index) = config.channel_index {
        match select_channel(&chunk.samples, chunk.format, index) {
            Ok(samples) => {
                chunk.samples = samples;
                chunk.format.channels = 1;
            }
            Err(e) => {
                tracing::debug!(error = %e, "channel select skipped for chunk");
            }
        }
    }

    if (config.volume_multiplier - 1.0).abs() > f32::EPSILON {
        chunk.samples = multiply_volume(&chunk.samples, config.volume_multiplier);
    }

    for stage in [
        auto_gain.map(|s| s as &mut dyn AudioProcessor),
        noise_gate.map(|s| s as &mut dyn AudioProcessor),
    ]
    .into_iter()
    .flatten()
    {
        match stage.process(&chunk.samples) {
            Ok(samples) => chunk.samples = samples,
            Err(e) => {
                tracing::debug!(error = %e, "dsp stage skipped for chunk");
            }
        }
    }

    if mute.is_muted() {
        chunk.samples = silence_like(&chunk.samples);
    }

    chunk
}

async fn shutdown_flip(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
