//! Daemon - the satellite process
//!
//! Wires the configured peers, pipelines, and actors together and runs
//! until interrupted. Every task observes one root shutdown signal and
//! must release its resources within a short grace period.

use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::audio::MuteGate;
use crate::config::Config;
use crate::discovery::MdnsAdvertiser;
use crate::events::{spawn_fanout, LifecycleEvent};
use crate::mic::spawn_mic;
use crate::peer::{
    spawn_mic_command, spawn_peer, spawn_snd_command, Endpoint, PeerHandle, PeerNotice,
    PeerOptions, PeerTransport, ReconnectPolicy,
};
use crate::protocol::satellite_info;
use crate::satellite::{Satellite, SatelliteIo};
use crate::server::{spawn_server, ServerBinding};
use crate::snd::{spawn_snd, SndSink};
use crate::timers::spawn_timers;
use crate::wake::spawn_wake;
use crate::Result;

/// Time allowed for tasks to release sockets and subprocesses on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The satellite daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a daemon from a validated configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transport`] when the bind URI cannot be
    /// bound and [`crate::Error::Config`] when a feedback WAV cannot be
    /// loaded.
    #[allow(clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let mode = config.mode();
        tracing::info!(?mode, name = %config.name, "starting satellite");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Main server listener; bind failures are fatal
        let binding = ServerBinding::bind(&config.uri).await?;
        let tcp_port = binding.tcp_port();

        // Zeroconf advertisement (TCP binds only)
        let mut advertiser = None;
        if config.discovery.enabled {
            if let Some(port) = tcp_port {
                match MdnsAdvertiser::new() {
                    Ok(mut mdns) => {
                        if let Err(e) = mdns.register(&config.discovery, port) {
                            tracing::warn!(error = %e, "zeroconf registration failed");
                        } else {
                            advertiser = Some(mdns);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "zeroconf unavailable"),
                }
            }
        }

        let mute = MuteGate::default();

        // Mic source: framed peer or raw capture subprocess
        let (mic_source, _mic_peer) = if let Some(command) = config.mic.command.clone() {
            let source = spawn_mic_command(
                command,
                config.mic.format(),
                config.mic.samples_per_chunk,
                ReconnectPolicy::default(),
                shutdown_rx.clone(),
            );
            (source, None)
        } else {
            let uri = config.mic.uri.as_deref().unwrap_or_default();
            let (handle, source) = spawn_peer(
                PeerOptions {
                    label: "mic",
                    transport: PeerTransport::Endpoint(Endpoint::parse(uri)?),
                    handshake: true,
                    reconnect: ReconnectPolicy::default(),
                },
                shutdown_rx.clone(),
            );
            (source, Some(handle))
        };

        let vad = (mode == crate::config::SatelliteMode::VadGated).then(|| config.vad.clone());
        let (mic_chunks, mic_notices) = spawn_mic(
            config.mic.clone(),
            vad,
            mic_source,
            mute.clone(),
            shutdown_rx.clone(),
        );

        // Snd sink: framed peer or raw playback subprocess
        let (snd, snd_notice_rx) = if config.snd.enabled() {
            let sink = if let Some(command) = config.snd.command.clone() {
                SndSink::Process(spawn_snd_command(
                    command,
                    ReconnectPolicy::default(),
                    shutdown_rx.clone(),
                ))
            } else {
                let uri = config.snd.uri.as_deref().unwrap_or_default();
                let (handle, notices) = spawn_peer(
                    PeerOptions {
                        label: "snd",
                        transport: PeerTransport::Endpoint(Endpoint::parse(uri)?),
                        handshake: true,
                        reconnect: ReconnectPolicy::default(),
                    },
                    shutdown_rx.clone(),
                );
                drain_notices("snd", notices);
                SndSink::Peer(handle)
            };

            let (notice_tx, notice_rx) = mpsc::channel(8);
            let handle = spawn_snd(
                config.snd.clone(),
                sink,
                mute.clone(),
                Duration::from_secs_f32(config.mic.seconds_to_mute_after_awake_wav.max(0.0)),
                notice_tx,
                shutdown_rx.clone(),
            );
            (Some(handle), Some(notice_rx))
        } else {
            (None, None)
        };

        // Event peer
        let event_peer: Option<PeerHandle> = match config.event.uri.as_deref() {
            Some(uri) => {
                let (handle, notices) = spawn_peer(
                    PeerOptions {
                        label: "event",
                        transport: PeerTransport::Endpoint(Endpoint::parse(uri)?),
                        handshake: true,
                        reconnect: ReconnectPolicy::default(),
                    },
                    shutdown_rx.clone(),
                );
                drain_notices("event", notices);
                Some(handle)
            }
            None => None,
        };

        // Fan-out and timer registry
        let fanout = spawn_fanout(&config, event_peer, snd.clone(), shutdown_rx.clone())?;
        let timers = spawn_timers(fanout.clone(), shutdown_rx.clone());

        // Wake coordinator (local-wake mode only)
        let (wake_notices, wake_gate) = if config.wake.enabled() {
            let transport = if let Some(command) = config.wake.command.clone() {
                PeerTransport::Command(command)
            } else {
                let uri = config.wake.uri.as_deref().unwrap_or_default();
                PeerTransport::Endpoint(Endpoint::parse(uri)?)
            };
            let (handle, notices) = spawn_peer(
                PeerOptions {
                    label: "wake",
                    transport,
                    handshake: true,
                    reconnect: ReconnectPolicy::default(),
                },
                shutdown_rx.clone(),
            );
            let (gate_tx, gate_rx) = watch::channel(false);
            let wake_notices = spawn_wake(
                config.wake.clone(),
                handle,
                notices,
                mic_chunks.subscribe(),
                gate_rx,
                shutdown_rx.clone(),
            );
            (Some(wake_notices), Some(gate_tx))
        } else {
            (None, None)
        };

        // Server listener and the state machine
        let (server_notice_tx, server_notice_rx) = mpsc::channel(64);
        let (server_out_tx, server_out_rx) = mpsc::channel(64);
        let info = satellite_info(
            &config.name,
            config.area.as_deref(),
            config.snd.enabled().then(|| config.snd.format()),
            &config.wake.active_names(),
        );
        spawn_server(
            binding,
            info,
            server_out_rx,
            server_notice_tx,
            shutdown_rx.clone(),
        );

        fanout.emit(LifecycleEvent::Startup).await;
        tracing::info!("ready");

        let satellite = Satellite::new(
            config,
            SatelliteIo {
                server_rx: server_notice_rx,
                server_tx: server_out_tx,
                mic_chunks: mic_chunks.subscribe(),
                mic_notices,
                wake_notices,
                wake_gate,
                snd,
                snd_notices: snd_notice_rx,
                fanout,
                timers,
            },
        );
        let satellite_task = tokio::spawn(satellite.run(shutdown_rx));

        // Run until interrupted
        wait_for_signal().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);

        if tokio::time::timeout(SHUTDOWN_GRACE, satellite_task)
            .await
            .is_err()
        {
            tracing::warn!("state machine did not stop within grace period");
        }
        drop(advertiser);

        Ok(())
    }
}

/// Keep an otherwise-unconsumed peer notice stream from backing up
fn drain_notices(label: &'static str, mut notices: mpsc::Receiver<PeerNotice>) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                PeerNotice::Connected => tracing::debug!(peer = label, "connected"),
                PeerNotice::Disconnected => tracing::debug!(peer = label, "disconnected"),
                PeerNotice::Message(message) => {
                    tracing::debug!(peer = label, message = ?message, "event ignored");
                }
            }
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
