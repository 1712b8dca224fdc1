//! Sound playback pipeline
//!
//! A single actor serializes playback: server TTS streams and local
//! feedback WAVs never interleave. Each playback is bracketed with
//! `audio-start`/`audio-stop` when the sink speaks the protocol; a raw
//! subprocess sink receives only the audio bytes. Feedback playback
//! mutes the microphone through the shared gate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::audio::{multiply_volume, AudioChunk, AudioFormat, MuteGate, WavAudio};
use crate::config::SndConfig;
use crate::peer::{PeerHandle, SndProcessHandle};
use crate::protocol::Message;

/// Why a playback was requested; determines shedding priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackReason {
    /// Wake/done feedback cue
    Feedback,
    /// Timer finished cue
    TimerFinished,
}

/// Playback requests accepted by the actor
#[derive(Debug)]
pub enum SndRequest {
    /// Server TTS utterance begins
    TtsStart { format: AudioFormat },
    /// One TTS chunk
    TtsChunk(AudioChunk),
    /// Server TTS utterance complete
    TtsStop,
    /// Abort the in-flight utterance (server went away mid-TTS)
    TtsAbort,
    /// Play a local WAV cue
    PlayWav {
        wav: WavAudio,
        reason: PlaybackReason,
        repeat: u32,
        delay: Duration,
        mute_mic: bool,
    },
}

/// Notices back to the state machine
#[derive(Debug, PartialEq, Eq)]
pub enum SndNotice {
    /// The current TTS utterance has drained to the sink
    TtsPlayed,
}

/// Where playback audio goes
pub enum SndSink {
    /// Framed protocol peer; playback is bracketed with start/stop
    Peer(PeerHandle),
    /// Write-only subprocess; only sample bytes are written
    Process(SndProcessHandle),
}

/// Sender half of the playback pipeline
#[derive(Debug, Clone)]
pub struct SndHandle {
    tx: mpsc::Sender<SndRequest>,
}

impl SndHandle {
    /// Queue a playback request, waiting for space
    pub async fn send(&self, request: SndRequest) {
        if self.tx.send(request).await.is_err() {
            tracing::debug!("snd pipeline gone, request discarded");
        }
    }
}

/// Build a [`SndHandle`] over a bare channel, for tests that observe
/// playback requests directly
#[cfg(test)]
pub(crate) fn test_snd_handle(tx: mpsc::Sender<SndRequest>) -> SndHandle {
    SndHandle { tx }
}

/// Spawn the playback actor.
///
/// `mute` is shared with the mic pipeline; `extra_mute` extends the mute
/// window past the end of feedback playback.
pub fn spawn_snd(
    config: SndConfig,
    sink: SndSink,
    mute: MuteGate,
    extra_mute: Duration,
    notice_tx: mpsc::Sender<SndNotice>,
    shutdown: watch::Receiver<bool>,
) -> SndHandle {
    let (tx, rx) = mpsc::channel(config.queue_max.max(4));
    tokio::spawn(snd_loop(
        config, sink, mute, extra_mute, rx, notice_tx, shutdown,
    ));
    SndHandle { tx }
}

struct TtsState {
    started: Instant,
    queued: Duration,
}

async fn snd_loop(
    config: SndConfig,
    sink: SndSink,
    mute: MuteGate,
    extra_mute: Duration,
    mut rx: mpsc::Receiver<SndRequest>,
    notice_tx: mpsc::Sender<SndNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Feedback requests arriving mid-utterance wait here
    let mut pending: VecDeque<SndRequest> = VecDeque::new();
    let mut tts: Option<TtsState> = None;

    loop {
        let request = if tts.is_none() {
            if let Some(request) = pending.pop_front() {
                Some(request)
            } else {
                tokio::select! {
                    () = shutdown_flip(&mut shutdown) => break,
                    request = rx.recv() => request,
                }
            }
        } else {
            tokio::select! {
                () = shutdown_flip(&mut shutdown) => break,
                request = rx.recv() => request,
            }
        };
        let Some(request) = request else { break };

        match request {
            SndRequest::TtsStart { format } => {
                if let SndSink::Peer(peer) = &sink {
                    peer.send(&Message::AudioStart {
                        format,
                        timestamp_ms: 0,
                    })
                    .await;
                }
                tts = Some(TtsState {
                    started: Instant::now(),
                    queued: Duration::ZERO,
                });
            }
            SndRequest::TtsChunk(chunk) => {
                if let Some(state) = &mut tts {
                    state.queued += chunk.duration();
                }
                write_chunk(&sink, &config, chunk).await;
            }
            SndRequest::TtsStop => {
                if let Some(state) = tts.take() {
                    finish_tts(&sink, &state, false).await;
                    let _ = notice_tx.send(SndNotice::TtsPlayed).await;
                }
            }
            SndRequest::TtsAbort => {
                // The state machine reports the abort itself; no notice
                if let Some(state) = tts.take() {
                    finish_tts(&sink, &state, true).await;
                }
            }
            SndRequest::PlayWav {
                wav,
                reason,
                repeat,
                delay,
                mute_mic,
            } => {
                if tts.is_some() {
                    enqueue_pending(
                        &mut pending,
                        SndRequest::PlayWav {
                            wav,
                            reason,
                            repeat,
                            delay,
                            mute_mic,
                        },
                        config.queue_max,
                    );
                } else {
                    play_wav(&sink, &config, &mute, extra_mute, &wav, repeat, delay, mute_mic)
                        .await;
                }
            }
        }
    }

    tracing::debug!("snd pipeline stopped");
}

/// Buffer a feedback request behind the active utterance, shedding the
/// oldest feedback cue when the queue is at capacity. TTS is never shed.
fn enqueue_pending(pending: &mut VecDeque<SndRequest>, request: SndRequest, queue_max: usize) {
    if pending.len() >= queue_max {
        if let Some(dropped) = pending.pop_front() {
            tracing::warn!(?dropped, "snd queue full, oldest feedback dropped");
        }
    }
    pending.push_back(request);
}

async fn write_chunk(sink: &SndSink, config: &SndConfig, mut chunk: AudioChunk) {
    if (config.volume_multiplier - 1.0).abs() > f32::EPSILON {
        chunk.samples = multiply_volume(&chunk.samples, config.volume_multiplier);
    }
    match sink {
        SndSink::Peer(peer) => peer.send(&Message::AudioChunk(chunk)).await,
        SndSink::Process(process) => process.write(chunk.samples).await,
    }
}

/// Close out an utterance. A framed sink acknowledges on write; a
/// write-only sink is given the estimated remaining playback time plus a
/// grace period, unless the utterance was aborted.
async fn finish_tts(sink: &SndSink, state: &TtsState, aborted: bool) {
    match sink {
        SndSink::Peer(peer) => {
            peer.send(&Message::AudioStop { timestamp_ms: 0 }).await;
        }
        SndSink::Process(_) => {
            if !aborted {
                let elapsed = state.started.elapsed();
                let remaining = state.queued.saturating_sub(elapsed);
                tokio::time::sleep(remaining + Duration::from_millis(150)).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn play_wav(
    sink: &SndSink,
    config: &SndConfig,
    mute: &MuteGate,
    extra_mute: Duration,
    wav: &WavAudio,
    repeat: u32,
    delay: Duration,
    mute_mic: bool,
) {
    for play in 0..repeat {
        if mute_mic {
            mute.mute_for(wav.duration() + extra_mute);
        }

        if let SndSink::Peer(peer) = sink {
            peer.send(&Message::AudioStart {
                format: wav.format,
                timestamp_ms: 0,
            })
            .await;
        }

        let mut timestamp_ms: u64 = 0;
        for samples in wav.chunks(config.samples_per_chunk) {
            let duration = wav.format.duration_of(samples.len());
            write_chunk(
                sink,
                config,
                AudioChunk {
                    format: wav.format,
                    samples,
                    timestamp_ms,
                },
            )
            .await;
            #[allow(clippy::cast_possible_truncation)]
            {
                timestamp_ms += duration.as_millis() as u64;
            }
        }

        if let SndSink::Peer(peer) = sink {
            peer.send(&Message::AudioStop {
                timestamp_ms,
            })
            .await;
        }

        if play + 1 < repeat && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn shutdown_flip(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
