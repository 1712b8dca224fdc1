//! Satellite state machine
//!
//! A single actor owns the session state and linearizes every transition:
//! server events, mic chunks, VAD edges, wake detections, playback
//! notices. Peers are reached only through channel handles; the actor
//! owns no transport.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};

use crate::audio::AudioChunk;
use crate::config::{Config, SatelliteMode};
use crate::events::{FanoutHandle, LifecycleEvent};
use crate::mic::MicNotice;
use crate::protocol::{Event, Message, PipelineStage, RunPipeline};
use crate::snd::{SndHandle, SndNotice, SndRequest};
use crate::timers::{TimerCommand, TimerHandle};
use crate::wake::WakeNotice;

/// Error lifecycle events are limited to one per second per kind
const ERROR_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Session state; exactly one at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No active server session
    Idle,
    /// VAD-gated mode, waiting for speech
    WaitingForSpeech,
    /// Local-wake mode, waiting for a detection
    WaitingForWake,
    /// Forwarding mic audio upstream
    Streaming,
    /// Server TTS response in flight
    AwaitingTts,
    /// Paused by the server
    Paused,
}

/// Edges from the server listener to the state machine
#[derive(Debug)]
pub enum ServerNotice {
    /// A session became active
    Connected,
    /// The active session went away
    Disconnected,
    /// An event from the active session
    Message(Message),
}

/// Channel endpoints wiring the actor to its collaborators
pub struct SatelliteIo {
    /// Inbound edges from the server listener
    pub server_rx: mpsc::Receiver<ServerNotice>,
    /// Outbound events to the active session
    pub server_tx: mpsc::Sender<Event>,
    /// Processed mic audio
    pub mic_chunks: broadcast::Receiver<AudioChunk>,
    /// VAD edges from the mic pipeline
    pub mic_notices: mpsc::Receiver<MicNotice>,
    /// Wake detections (local-wake mode only)
    pub wake_notices: Option<mpsc::Receiver<WakeNotice>>,
    /// Gate opening wake-peer audio forwarding
    pub wake_gate: Option<watch::Sender<bool>>,
    /// Playback pipeline, when a snd endpoint is configured
    pub snd: Option<SndHandle>,
    /// Playback notices, present exactly when `snd` is
    pub snd_notices: Option<mpsc::Receiver<SndNotice>>,
    /// Lifecycle event fan-out
    pub fanout: FanoutHandle,
    /// Timer registry
    pub timers: TimerHandle,
}

/// The satellite state machine actor
pub struct Satellite {
    config: Config,
    mode: SatelliteMode,
    state: SessionState,
    server_connected: bool,
    /// TTS bracket open (survives a pause edge, unlike the state)
    tts_active: bool,
    /// Wake-word timeout deadline while streaming in VAD-gated mode
    vad_deadline: Option<Instant>,
    /// Last error emission per kind
    error_emitted: HashMap<String, Instant>,
    /// Unrecognized server messages seen
    unknown_count: u64,
    /// Audio chunks shed because the server writer was backed up
    shed_audio: u64,
    io: SatelliteIo,
}

impl Satellite {
    /// Create the actor in its idle state
    #[must_use]
    pub fn new(config: Config, io: SatelliteIo) -> Self {
        let mode = config.mode();
        Self {
            config,
            mode,
            state: SessionState::Idle,
            server_connected: false,
            tts_active: false,
            vad_deadline: None,
            error_emitted: HashMap::new(),
            unknown_count: 0,
            shed_audio: 0,
            io,
        }
    }

    /// Run until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.sync_wake_gate();

        loop {
            let wake_recv = async {
                match &mut self.io.wake_notices {
                    Some(rx) => rx.recv().await,
                    None => futures::future::pending().await,
                }
            };
            let snd_recv = async {
                match &mut self.io.snd_notices {
                    Some(rx) => rx.recv().await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                () = shutdown_flip(&mut shutdown) => break,

                notice = self.io.server_rx.recv() => match notice {
                    Some(ServerNotice::Connected) => self.on_server_connected().await,
                    Some(ServerNotice::Disconnected) => self.on_server_disconnected().await,
                    Some(ServerNotice::Message(message)) => self.on_server_message(message).await,
                    None => break,
                },

                chunk = self.io.mic_chunks.recv() => match chunk {
                    Ok(chunk) => self.on_mic_chunk(chunk).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "state machine lagging on mic audio");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                notice = self.io.mic_notices.recv() => match notice {
                    Some(MicNotice::SpeechDetected { preroll }) => {
                        self.on_speech_detected(preroll).await;
                    }
                    None => break,
                },

                notice = wake_recv => match notice {
                    Some(WakeNotice::Detection { name, pipeline }) => {
                        self.on_wake_detection(name, pipeline).await;
                    }
                    None => break,
                },

                notice = snd_recv => match notice {
                    Some(SndNotice::TtsPlayed) => self.on_tts_played().await,
                    None => break,
                },
            }
        }

        tracing::debug!(
            unknown = self.unknown_count,
            shed_audio = self.shed_audio,
            "state machine stopped"
        );
    }

    // -- server edges -------------------------------------------------------

    async fn on_server_connected(&mut self) {
        self.server_connected = true;
        tracing::info!("connected to server");
        self.emit(LifecycleEvent::Connected).await;
        self.sync_wake_gate();
    }

    async fn on_server_disconnected(&mut self) {
        tracing::info!("disconnected from server");
        self.server_connected = false;

        if self.tts_active {
            // Abort the in-flight utterance; the snd queue for it drains
            self.tts_active = false;
            self.emit(LifecycleEvent::TtsStop).await;
            if let Some(snd) = &self.io.snd {
                snd.send(SndRequest::TtsAbort).await;
            }
            self.emit(LifecycleEvent::TtsPlayed).await;
        }
        if self.is_forwarding() {
            self.emit(LifecycleEvent::StreamingStop).await;
        }

        self.state = SessionState::Idle;
        self.vad_deadline = None;
        self.emit(LifecycleEvent::Disconnected).await;
        self.sync_wake_gate();
    }

    #[allow(clippy::too_many_lines)]
    async fn on_server_message(&mut self, message: Message) {
        match message {
            Message::RunSatellite | Message::ResumeSatellite => {
                self.enter_mode_initial().await;
            }
            Message::PauseSatellite => self.on_pause().await,

            Message::Transcript { text } => {
                tracing::info!(text = %text, "transcript");
                self.emit(LifecycleEvent::Transcript { text }).await;
                if self.mode != SatelliteMode::Always && self.state == SessionState::Streaming {
                    self.stop_streaming().await;
                    // TTS follows unless audio output is disabled
                    self.state = if self.config.snd.enabled() {
                        SessionState::AwaitingTts
                    } else {
                        self.waiting_state()
                    };
                    self.sync_wake_gate();
                }
            }
            Message::Synthesize { text } => {
                self.emit(LifecycleEvent::Synthesize { text }).await;
            }
            Message::VoiceStarted => self.emit(LifecycleEvent::VoiceStarted).await,
            Message::VoiceStopped => self.emit(LifecycleEvent::VoiceStopped).await,

            Message::Detection { name } => {
                // Server-side wake detection (remote wake stage)
                self.vad_deadline = None;
                self.emit(LifecycleEvent::Detection { name }).await;
            }

            Message::AudioStart { format, .. } => {
                self.tts_active = true;
                if self.state != SessionState::Paused {
                    self.state = SessionState::AwaitingTts;
                }
                self.emit(LifecycleEvent::TtsStart).await;
                if let Some(snd) = &self.io.snd {
                    snd.send(SndRequest::TtsStart { format }).await;
                }
                self.sync_wake_gate();
            }
            Message::AudioChunk(chunk) => {
                if self.tts_active {
                    if let Some(snd) = &self.io.snd {
                        snd.send(SndRequest::TtsChunk(chunk)).await;
                    }
                }
            }
            Message::AudioStop { .. } => {
                if self.tts_active {
                    self.tts_active = false;
                    self.emit(LifecycleEvent::TtsStop).await;
                    if let Some(snd) = &self.io.snd {
                        snd.send(SndRequest::TtsStop).await;
                    } else {
                        // No sink to drain; the utterance is done
                        self.on_tts_played().await;
                    }
                }
            }

            Message::Error { text } => {
                tracing::warn!(error = %text, "server error");
                self.emit_error(text).await;
            }

            Message::TimerStarted(timer) => {
                self.io.timers.send(TimerCommand::Started(timer)).await;
            }
            Message::TimerUpdated(timer) => {
                self.io.timers.send(TimerCommand::Updated(timer)).await;
            }
            Message::TimerCancelled { id } => {
                self.io.timers.send(TimerCommand::Cancelled { id }).await;
            }
            Message::TimerFinished { id } => {
                self.io.timers.send(TimerCommand::Finished { id }).await;
            }

            Message::Ping { .. } | Message::Pong { .. } | Message::Describe | Message::Info(_) => {
                // Handled by the listener session
            }

            Message::Unknown(event) => {
                self.unknown_count += 1;
                tracing::debug!(
                    event_type = %event.event_type,
                    total = self.unknown_count,
                    "unrecognized server event skipped"
                );
            }

            other => {
                tracing::debug!(message = ?other, "unexpected server message skipped");
            }
        }
    }

    // -- mic edges ----------------------------------------------------------

    async fn on_mic_chunk(&mut self, chunk: AudioChunk) {
        if !self.is_forwarding() {
            return;
        }

        // Silence run past the wake-word window sends us back to waiting
        if let Some(deadline) = self.vad_deadline {
            if Instant::now() >= deadline {
                self.vad_deadline = None;
                self.emit(LifecycleEvent::VoiceStopped).await;
                self.stop_streaming().await;
                self.state = SessionState::WaitingForSpeech;
                tracing::info!("wake word timeout, waiting for speech");
                return;
            }
        }

        self.send_server_audio(chunk);
    }

    async fn on_speech_detected(&mut self, preroll: Option<AudioChunk>) {
        if self.state != SessionState::WaitingForSpeech || !self.server_connected {
            return;
        }

        tracing::info!("speech detected, streaming audio");
        self.send_server(Message::RunPipeline(self.run_pipeline(None, None)))
            .await;
        self.send_server(Message::AudioStart {
            format: self.config.mic.format(),
            timestamp_ms: 0,
        })
        .await;
        if let Some(preroll) = preroll {
            // Pre-speech audio first so the server hears the onset
            self.send_server(Message::AudioChunk(preroll)).await;
        }

        self.state = SessionState::Streaming;
        self.vad_deadline = self
            .config
            .vad
            .wake_word_timeout
            .map(|timeout| Instant::now() + Duration::from_secs_f32(timeout));
        self.emit(LifecycleEvent::VoiceStarted).await;
        self.emit(LifecycleEvent::StreamingStart).await;
    }

    // -- wake edges ---------------------------------------------------------

    async fn on_wake_detection(&mut self, name: Option<String>, pipeline: Option<String>) {
        if self.state != SessionState::WaitingForWake || !self.server_connected {
            return;
        }

        tracing::info!(?name, "streaming audio");
        self.send_server(Message::Detection { name: name.clone() }).await;
        self.send_server(Message::RunPipeline(
            self.run_pipeline(name.clone(), pipeline),
        ))
        .await;
        self.send_server(Message::AudioStart {
            format: self.config.mic.format(),
            timestamp_ms: 0,
        })
        .await;

        self.state = SessionState::Streaming;
        self.sync_wake_gate();
        self.emit(LifecycleEvent::Detection { name }).await;
        self.emit(LifecycleEvent::StreamingStart).await;
    }

    // -- snd edges ----------------------------------------------------------

    async fn on_tts_played(&mut self) {
        self.emit(LifecycleEvent::TtsPlayed).await;
        self.send_server(Message::Played).await;

        if self.state == SessionState::AwaitingTts {
            self.state = match self.mode {
                SatelliteMode::Always => SessionState::Streaming,
                SatelliteMode::VadGated => SessionState::WaitingForSpeech,
                SatelliteMode::LocalWake => SessionState::WaitingForWake,
            };
            if self.state == SessionState::WaitingForWake {
                self.emit(LifecycleEvent::Detect).await;
                tracing::info!("waiting for wake word");
            }
            self.sync_wake_gate();
        }
    }

    // -- transitions --------------------------------------------------------

    async fn enter_mode_initial(&mut self) {
        if self.is_forwarding() {
            // Close the open utterance before starting over
            self.stop_streaming().await;
        }
        self.vad_deadline = None;

        match self.mode {
            SatelliteMode::Always => {
                tracing::info!("streaming audio");
                self.send_server(Message::RunPipeline(self.run_pipeline(None, None)))
                    .await;
                self.send_server(Message::AudioStart {
                    format: self.config.mic.format(),
                    timestamp_ms: 0,
                })
                .await;
                self.state = SessionState::Streaming;
                self.emit(LifecycleEvent::StreamingStart).await;
            }
            SatelliteMode::VadGated => {
                tracing::info!("waiting for speech");
                self.state = SessionState::WaitingForSpeech;
            }
            SatelliteMode::LocalWake => {
                tracing::info!("waiting for wake word");
                self.state = SessionState::WaitingForWake;
                self.emit(LifecycleEvent::Detect).await;
            }
        }
        self.sync_wake_gate();
    }

    async fn on_pause(&mut self) {
        if self.state == SessionState::Paused {
            tracing::debug!("already paused");
            return;
        }

        tracing::info!("satellite paused");
        if self.is_forwarding() {
            self.stop_streaming().await;
        }
        self.state = SessionState::Paused;
        self.vad_deadline = None;
        self.sync_wake_gate();
    }

    /// Close the upstream utterance bracket and report the stop
    async fn stop_streaming(&mut self) {
        self.send_server(Message::AudioStop { timestamp_ms: 0 }).await;
        self.emit(LifecycleEvent::StreamingStop).await;
    }

    /// True while mic audio flows upstream. Always mode keeps the stream
    /// open through the TTS response.
    fn is_forwarding(&self) -> bool {
        match self.state {
            SessionState::Streaming => true,
            SessionState::AwaitingTts => self.mode == SatelliteMode::Always,
            _ => false,
        }
    }

    fn waiting_state(&self) -> SessionState {
        match self.mode {
            SatelliteMode::Always => SessionState::Streaming,
            SatelliteMode::VadGated => SessionState::WaitingForSpeech,
            SatelliteMode::LocalWake => SessionState::WaitingForWake,
        }
    }

    fn run_pipeline(
        &self,
        wake_word_name: Option<String>,
        pipeline: Option<String>,
    ) -> RunPipeline {
        let snd_enabled = self.config.snd.enabled();
        RunPipeline {
            start_stage: PipelineStage::Asr,
            end_stage: if snd_enabled {
                PipelineStage::Tts
            } else {
                PipelineStage::Handle
            },
            name: pipeline,
            wake_word_name,
            restart_on_end: self.mode == SatelliteMode::Always,
            snd_format: snd_enabled.then(|| self.config.snd.format()),
        }
    }

    fn sync_wake_gate(&self) {
        if let Some(gate) = &self.io.wake_gate {
            let open = self.state == SessionState::WaitingForWake && self.server_connected;
            let _ = gate.send(open);
        }
    }

    async fn emit(&self, event: LifecycleEvent) {
        self.io.fanout.emit(event).await;
    }

    /// Emit an error lifecycle event, at most one per second per kind
    async fn emit_error(&mut self, text: String) {
        let kind = error_kind(&text).to_string();
        let now = Instant::now();
        if let Some(last) = self.error_emitted.get(&kind) {
            if now.duration_since(*last) < ERROR_RATE_LIMIT {
                return;
            }
        }
        self.error_emitted.insert(kind, now);
        self.emit(LifecycleEvent::Error { text }).await;
    }

    async fn send_server(&self, message: Message) {
        if !self.server_connected {
            return;
        }
        if self.io.server_tx.send(message.to_event()).await.is_err() {
            tracing::debug!("server writer gone, event discarded");
        }
    }

    /// Forward steady-state mic audio without ever blocking on the
    /// server writer; a backed-up session sheds chunks instead of
    /// wedging the actor
    fn send_server_audio(&mut self, chunk: AudioChunk) {
        if !self.server_connected {
            return;
        }
        match self
            .io
            .server_tx
            .try_send(Message::AudioChunk(chunk).to_event())
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shed_audio += 1;
                if self.shed_audio.is_power_of_two() {
                    tracing::warn!(
                        dropped = self.shed_audio,
                        "server writer backed up, audio dropped"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Coarse error kind for rate limiting, taken from the message prefix
fn error_kind(text: &str) -> &str {
    text.split([':', ' ']).next().unwrap_or("error")
}

async fn shutdown_flip(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::config::test_config;
    use crate::events::test_fanout_handle;
    use crate::snd::test_snd_handle;
    use crate::timers::test_timer_handle;

    #[test]
    fn error_kind_takes_prefix() {
        assert_eq!(error_kind("stt: engine crashed"), "stt");
        assert_eq!(error_kind("timeout waiting"), "timeout");
        assert_eq!(error_kind(""), "");
    }

    /// Channel-backed harness around the state machine actor
    struct Harness {
        server_tx: mpsc::Sender<ServerNotice>,
        upstream_rx: mpsc::Receiver<Event>,
        chunks_tx: broadcast::Sender<AudioChunk>,
        mic_notice_tx: mpsc::Sender<MicNotice>,
        wake_tx: Option<mpsc::Sender<WakeNotice>>,
        gate_rx: Option<watch::Receiver<bool>>,
        snd_rx: mpsc::Receiver<SndRequest>,
        snd_notice_tx: mpsc::Sender<SndNotice>,
        lifecycle_rx: mpsc::Receiver<LifecycleEvent>,
        timer_rx: mpsc::Receiver<TimerCommand>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn start(config: Config, with_wake: bool) -> Harness {
        let (server_tx, server_rx) = mpsc::channel(32);
        let (upstream_tx, upstream_rx) = mpsc::channel(64);
        let (chunks_tx, _) = broadcast::channel(32);
        let (mic_notice_tx, mic_notices) = mpsc::channel(8);
        let (snd_tx, snd_rx) = mpsc::channel(32);
        let (snd_notice_tx, snd_notices) = mpsc::channel(8);
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(64);
        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (wake_tx, wake_notices, wake_gate, gate_rx) = if with_wake {
            let (wake_tx, wake_rx) = mpsc::channel(8);
            let (gate_tx, gate_rx) = watch::channel(false);
            (Some(wake_tx), Some(wake_rx), Some(gate_tx), Some(gate_rx))
        } else {
            (None, None, None, None)
        };

        let satellite = Satellite::new(
            config,
            SatelliteIo {
                server_rx,
                server_tx: upstream_tx,
                mic_chunks: chunks_tx.subscribe(),
                mic_notices,
                wake_notices,
                wake_gate,
                snd: Some(test_snd_handle(snd_tx)),
                snd_notices: Some(snd_notices),
                fanout: test_fanout_handle(lifecycle_tx),
                timers: test_timer_handle(timer_tx),
            },
        );
        tokio::spawn(satellite.run(shutdown_rx));

        Harness {
            server_tx,
            upstream_rx,
            chunks_tx,
            mic_notice_tx,
            wake_tx,
            gate_rx,
            snd_rx,
            snd_notice_tx,
            lifecycle_rx,
            timer_rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn always_config() -> Config {
        let mut config = test_config();
        config.snd.uri = Some("tcp://127.0.0.1:10601".to_string());
        config
    }

    fn vad_config() -> Config {
        let mut config = test_config();
        config.vad.enabled = true;
        config
    }

    fn wake_config() -> Config {
        let mut config = test_config();
        config.snd.uri = Some("tcp://127.0.0.1:10601".to_string());
        config.wake.uri = Some("tcp://127.0.0.1:10400".to_string());
        config.wake.names.push(crate::config::WakeWordEntry {
            name: "ok_nabu".to_string(),
            pipeline: Some("kitchen".to_string()),
        });
        config
    }

    fn chunk(timestamp_ms: u64) -> AudioChunk {
        AudioChunk {
            format: AudioFormat::SPEECH,
            samples: vec![1, 2, 3, 4],
            timestamp_ms,
        }
    }

    async fn server_send(harness: &Harness, message: Message) {
        harness
            .server_tx
            .send(ServerNotice::Message(message))
            .await
            .unwrap();
    }

    async fn upstream(harness: &mut Harness) -> Event {
        tokio::time::timeout(Duration::from_secs(1), harness.upstream_rx.recv())
            .await
            .expect("timed out waiting for upstream event")
            .expect("upstream closed")
    }

    async fn lifecycle(harness: &mut Harness) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(1), harness.lifecycle_rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("lifecycle closed")
    }

    async fn connect_and_run(harness: &mut Harness) {
        harness
            .server_tx
            .send(ServerNotice::Connected)
            .await
            .unwrap();
        assert_eq!(lifecycle(harness).await, LifecycleEvent::Connected);
        server_send(harness, Message::RunSatellite).await;
    }

    #[tokio::test]
    async fn always_mode_happy_path() {
        let mut harness = start(always_config(), false);
        connect_and_run(&mut harness).await;

        // run-pipeline brackets the session
        let event = upstream(&mut harness).await;
        assert_eq!(event.event_type, "run-pipeline");
        let data = event.data.unwrap();
        assert_eq!(data["start_stage"], "asr");
        assert_eq!(data["end_stage"], "tts");
        assert_eq!(data["restart_on_end"], true);

        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        // Mic audio flows upstream continuously
        harness.chunks_tx.send(chunk(0)).unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "audio-chunk");

        // Server runs the pipeline to completion
        server_send(
            &harness,
            Message::Transcript {
                text: "hello".to_string(),
            },
        )
        .await;
        server_send(
            &harness,
            Message::Synthesize {
                text: "hi".to_string(),
            },
        )
        .await;
        server_send(
            &harness,
            Message::AudioStart {
                format: AudioFormat::SPEECH,
                timestamp_ms: 0,
            },
        )
        .await;
        server_send(&harness, Message::AudioChunk(chunk(0))).await;
        server_send(&harness, Message::AudioStop { timestamp_ms: 0 }).await;

        assert_eq!(
            lifecycle(&mut harness).await,
            LifecycleEvent::Transcript {
                text: "hello".to_string()
            }
        );
        assert_eq!(
            lifecycle(&mut harness).await,
            LifecycleEvent::Synthesize {
                text: "hi".to_string()
            }
        );
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsStart);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsStop);

        // TTS stream reached the playback pipeline in order
        assert!(matches!(
            harness.snd_rx.recv().await.unwrap(),
            SndRequest::TtsStart { .. }
        ));
        assert!(matches!(
            harness.snd_rx.recv().await.unwrap(),
            SndRequest::TtsChunk(_)
        ));
        assert!(matches!(
            harness.snd_rx.recv().await.unwrap(),
            SndRequest::TtsStop
        ));

        // Sink drain completes the utterance
        harness.snd_notice_tx.send(SndNotice::TtsPlayed).await.unwrap();
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsPlayed);
        assert_eq!(upstream(&mut harness).await.event_type, "played");

        // Still streaming afterwards
        harness.chunks_tx.send(chunk(1)).unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "audio-chunk");
    }

    #[tokio::test]
    async fn vad_mode_streams_preroll_first() {
        let mut harness = start(vad_config(), false);
        connect_and_run(&mut harness).await;

        // Waiting for speech: no upstream traffic, mic audio dropped
        harness.chunks_tx.send(chunk(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.upstream_rx.try_recv().is_err());

        let preroll = AudioChunk {
            format: AudioFormat::SPEECH,
            samples: vec![9u8; 64],
            timestamp_ms: 10,
        };
        harness
            .mic_notice_tx
            .send(MicNotice::SpeechDetected {
                preroll: Some(preroll),
            })
            .await
            .unwrap();

        let event = upstream(&mut harness).await;
        assert_eq!(event.event_type, "run-pipeline");
        assert_eq!(event.data.unwrap()["start_stage"], "asr");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");

        // Pre-roll audio precedes live chunks
        let first_chunk = upstream(&mut harness).await;
        assert_eq!(first_chunk.event_type, "audio-chunk");
        assert_eq!(first_chunk.payload.unwrap(), vec![9u8; 64]);

        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::VoiceStarted);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        harness.chunks_tx.send(chunk(20)).unwrap();
        let live = upstream(&mut harness).await;
        assert_eq!(live.event_type, "audio-chunk");
        assert_eq!(live.payload.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn vad_mode_times_out_without_detection() {
        let mut config = vad_config();
        config.vad.wake_word_timeout = Some(0.0);
        let mut harness = start(config, false);
        connect_and_run(&mut harness).await;

        harness
            .mic_notice_tx
            .send(MicNotice::SpeechDetected { preroll: None })
            .await
            .unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "run-pipeline");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::VoiceStarted);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        // The zero-length window expires on the next chunk
        harness.chunks_tx.send(chunk(0)).unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "audio-stop");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::VoiceStopped);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStop);

        // Back to waiting: audio no longer forwarded
        harness.chunks_tx.send(chunk(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_detection_clears_vad_timeout() {
        let mut config = vad_config();
        config.vad.wake_word_timeout = Some(0.0);
        let mut harness = start(config, false);
        connect_and_run(&mut harness).await;

        harness
            .mic_notice_tx
            .send(MicNotice::SpeechDetected { preroll: None })
            .await
            .unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "run-pipeline");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        lifecycle(&mut harness).await;
        lifecycle(&mut harness).await;

        // Remote wake stage confirmed the word; the window is cleared
        server_send(
            &harness,
            Message::Detection {
                name: Some("ok_nabu".to_string()),
            },
        )
        .await;
        assert_eq!(
            lifecycle(&mut harness).await,
            LifecycleEvent::Detection {
                name: Some("ok_nabu".to_string())
            }
        );

        harness.chunks_tx.send(chunk(0)).unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "audio-chunk");
    }

    #[tokio::test]
    async fn disconnect_mid_tts_aborts_utterance() {
        let mut harness = start(always_config(), false);
        connect_and_run(&mut harness).await;
        assert_eq!(upstream(&mut harness).await.event_type, "run-pipeline");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        server_send(
            &harness,
            Message::AudioStart {
                format: AudioFormat::SPEECH,
                timestamp_ms: 0,
            },
        )
        .await;
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsStart);
        assert!(matches!(
            harness.snd_rx.recv().await.unwrap(),
            SndRequest::TtsStart { .. }
        ));

        harness
            .server_tx
            .send(ServerNotice::Disconnected)
            .await
            .unwrap();

        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsStop);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsPlayed);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStop);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::Disconnected);
        assert!(matches!(
            harness.snd_rx.recv().await.unwrap(),
            SndRequest::TtsAbort
        ));

        // Idle: nothing flows upstream
        harness.chunks_tx.send(chunk(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let mut harness = start(always_config(), false);
        connect_and_run(&mut harness).await;
        assert_eq!(upstream(&mut harness).await.event_type, "run-pipeline");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        server_send(&harness, Message::PauseSatellite).await;
        assert_eq!(upstream(&mut harness).await.event_type, "audio-stop");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStop);

        // Paused: no audio upstream, repeated pause is a no-op
        harness.chunks_tx.send(chunk(0)).unwrap();
        server_send(&harness, Message::PauseSatellite).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.upstream_rx.try_recv().is_err());
        assert!(harness.lifecycle_rx.try_recv().is_err());

        // Resume returns to the mode-initial state
        server_send(&harness, Message::RunSatellite).await;
        assert_eq!(upstream(&mut harness).await.event_type, "run-pipeline");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);
    }

    #[tokio::test]
    async fn local_wake_detection_starts_session() {
        let mut harness = start(wake_config(), true);
        connect_and_run(&mut harness).await;
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::Detect);

        // Waiting for wake word: gate open
        let gate = harness.gate_rx.clone().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(*gate.borrow());

        harness
            .wake_tx
            .as_ref()
            .unwrap()
            .send(WakeNotice::Detection {
                name: Some("ok_nabu".to_string()),
                pipeline: Some("kitchen".to_string()),
            })
            .await
            .unwrap();

        let event = upstream(&mut harness).await;
        assert_eq!(event.event_type, "detection");
        assert_eq!(event.data.unwrap()["name"], "ok_nabu");

        let event = upstream(&mut harness).await;
        assert_eq!(event.event_type, "run-pipeline");
        let data = event.data.unwrap();
        assert_eq!(data["wake_word_name"], "ok_nabu");
        assert_eq!(data["name"], "kitchen");
        assert_eq!(data["restart_on_end"], false);

        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(
            lifecycle(&mut harness).await,
            LifecycleEvent::Detection {
                name: Some("ok_nabu".to_string())
            }
        );
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        // Gate closed while streaming
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!*gate.borrow());

        // Transcript ends the utterance and hands off to TTS
        harness.chunks_tx.send(chunk(0)).unwrap();
        assert_eq!(upstream(&mut harness).await.event_type, "audio-chunk");
        server_send(
            &harness,
            Message::Transcript {
                text: "lights on".to_string(),
            },
        )
        .await;
        assert_eq!(
            lifecycle(&mut harness).await,
            LifecycleEvent::Transcript {
                text: "lights on".to_string()
            }
        );
        assert_eq!(upstream(&mut harness).await.event_type, "audio-stop");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStop);

        // After TTS drains we are back to waiting for the wake word
        server_send(
            &harness,
            Message::AudioStart {
                format: AudioFormat::SPEECH,
                timestamp_ms: 0,
            },
        )
        .await;
        server_send(&harness, Message::AudioStop { timestamp_ms: 0 }).await;
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsStart);
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsStop);
        harness.snd_notice_tx.send(SndNotice::TtsPlayed).await.unwrap();
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::TtsPlayed);
        assert_eq!(upstream(&mut harness).await.event_type, "played");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::Detect);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(*gate.borrow());
    }

    #[tokio::test]
    async fn wake_detection_ignored_without_server() {
        let mut harness = start(wake_config(), true);

        harness
            .wake_tx
            .as_ref()
            .unwrap()
            .send(WakeNotice::Detection {
                name: Some("ok_nabu".to_string()),
                pipeline: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.upstream_rx.try_recv().is_err());
        assert!(harness.lifecycle_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timer_events_reach_registry() {
        let mut harness = start(always_config(), false);
        connect_and_run(&mut harness).await;

        let timer = crate::protocol::TimerInfo {
            id: "t1".to_string(),
            name: None,
            total_seconds: 60,
            remaining_seconds: Some(60),
            is_active: true,
            is_paused: false,
        };
        server_send(&harness, Message::TimerStarted(timer.clone())).await;
        server_send(
            &harness,
            Message::TimerCancelled {
                id: "t1".to_string(),
            },
        )
        .await;

        assert!(matches!(
            harness.timer_rx.recv().await.unwrap(),
            TimerCommand::Started(_)
        ));
        assert!(matches!(
            harness.timer_rx.recv().await.unwrap(),
            TimerCommand::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn server_errors_are_rate_limited() {
        let mut harness = start(always_config(), false);
        connect_and_run(&mut harness).await;
        assert_eq!(upstream(&mut harness).await.event_type, "run-pipeline");
        assert_eq!(upstream(&mut harness).await.event_type, "audio-start");
        assert_eq!(lifecycle(&mut harness).await, LifecycleEvent::StreamingStart);

        for _ in 0..5 {
            server_send(
                &harness,
                Message::Error {
                    text: "stt: engine crashed".to_string(),
                },
            )
            .await;
        }

        assert_eq!(
            lifecycle(&mut harness).await,
            LifecycleEvent::Error {
                text: "stt: engine crashed".to_string()
            }
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.lifecycle_rx.try_recv().is_err());
    }
}
