//! Main server listener
//!
//! Accepts inbound connections from upstream voice-assistant servers. At
//! most one session is active at a time; a newly accepted connection
//! becomes the active session and the previous one is closed. The
//! listener answers `describe` itself and relays everything else to the
//! state machine.

use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};

use crate::peer::Endpoint;
use crate::protocol::{read_event, write_event, Event, Message};
use crate::satellite::ServerNotice;
use crate::{Error, Result};

/// Ping cadence once the server has pinged us
const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Missing pong past this window drops the session
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// A session write must complete within this window; a peer that stops
/// reading loses its session rather than stalling the listener
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bound listening socket
#[derive(Debug)]
pub enum ServerBinding {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ServerBinding {
    /// Bind the configured URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unsupported URI and
    /// [`Error::Transport`] when the address cannot be bound.
    pub async fn bind(uri: &str) -> Result<Self> {
        match Endpoint::parse(uri)? {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), port))
                    .await
                    .map_err(|e| Error::Transport(format!("bind {host}:{port}: {e}")))?;
                tracing::info!(uri = %uri, "listening");
                Ok(Self::Tcp(listener))
            }
            Endpoint::Unix(path) => {
                // A stale socket file from a previous run blocks the bind
                if path.exists() {
                    std::fs::remove_file(&path).ok();
                }
                let listener = UnixListener::bind(&path)
                    .map_err(|e| Error::Transport(format!("bind {}: {e}", path.display())))?;
                tracing::info!(uri = %uri, "listening");
                Ok(Self::Unix(listener))
            }
        }
    }

    /// Bound TCP port, when applicable (used for discovery)
    #[must_use]
    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            Self::Unix(_) => None,
        }
    }

    async fn accept(&self) -> std::io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                tracing::debug!(%addr, "server connection accepted");
                stream.set_nodelay(true).ok();
                let (reader, writer) = stream.into_split();
                Ok((Box::new(BufReader::new(reader)), Box::new(writer)))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("server connection accepted");
                let (reader, writer) = stream.into_split();
                Ok((Box::new(BufReader::new(reader)), Box::new(writer)))
            }
        }
    }
}

/// Spawn the listener actor.
///
/// `info` is the satellite's `describe` reply. `outbound_rx` carries
/// events from the state machine to the active session; events sent
/// while no session is active are dropped.
pub fn spawn_server(
    binding: ServerBinding,
    info: Event,
    outbound_rx: mpsc::Receiver<Event>,
    notice_tx: mpsc::Sender<ServerNotice>,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(server_loop(binding, info, outbound_rx, notice_tx, shutdown));
}

enum SessionEvent {
    Frame(u64, Event),
    Closed(u64),
}

struct Session {
    id: u64,
    writer: BoxedWriter,
    read_task: tokio::task::JoinHandle<()>,
    /// Ping loop armed after the server's first ping
    ping_enabled: bool,
    last_pong: Instant,
}

impl Session {
    fn close(self) {
        self.read_task.abort();
    }

    /// Write one event with an upper bound on how long the remote may
    /// stall us. Returns false when the session should be dropped.
    async fn write(&mut self, event: &Event) -> bool {
        match tokio::time::timeout(WRITE_TIMEOUT, write_event(&mut self.writer, event)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(session = self.id, error = %e, "session write failed");
                false
            }
            Err(_) => {
                tracing::warn!(session = self.id, "session write timed out");
                false
            }
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn server_loop(
    binding: ServerBinding,
    info: Event,
    mut outbound_rx: mpsc::Receiver<Event>,
    notice_tx: mpsc::Sender<ServerNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(64);
    let mut active: Option<Session> = None;
    let mut next_id: u64 = 0;

    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown_flip(&mut shutdown) => break,

            accepted = binding.accept() => {
                let (reader, writer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                // The newest connection wins; close out the previous one
                if let Some(prev) = active.take() {
                    tracing::info!(session = prev.id, "replacing active session");
                    prev.close();
                    if notice_tx.send(ServerNotice::Disconnected).await.is_err() {
                        break;
                    }
                }

                next_id += 1;
                let id = next_id;
                let read_task = tokio::spawn(session_read_loop(id, reader, session_tx.clone()));
                active = Some(Session {
                    id,
                    writer,
                    read_task,
                    ping_enabled: false,
                    last_pong: Instant::now(),
                });
                if notice_tx.send(ServerNotice::Connected).await.is_err() {
                    break;
                }
            }

            session = session_rx.recv() => match session {
                Some(SessionEvent::Frame(id, event)) => {
                    let Some(session) = active.as_mut().filter(|s| s.id == id) else {
                        continue; // stale read task
                    };

                    match Message::from_event(event) {
                        Message::Describe => {
                            if !session.write(&info).await {
                                drop_session(&mut active, &notice_tx).await;
                            }
                        }
                        Message::Ping { text } => {
                            if !session.ping_enabled {
                                tracing::debug!(session = id, "ping enabled");
                                session.ping_enabled = true;
                                session.last_pong = Instant::now();
                            }
                            let pong = Message::Pong { text }.to_event();
                            if !session.write(&pong).await {
                                drop_session(&mut active, &notice_tx).await;
                            }
                        }
                        Message::Pong { .. } => {
                            session.last_pong = Instant::now();
                        }
                        message => {
                            if notice_tx.send(ServerNotice::Message(message)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(SessionEvent::Closed(id)) => {
                    if active.as_ref().is_some_and(|s| s.id == id) {
                        drop_session(&mut active, &notice_tx).await;
                    }
                }
                None => break,
            },

            out = outbound_rx.recv() => match out {
                Some(event) => {
                    if let Some(session) = active.as_mut() {
                        if !session.write(&event).await {
                            drop_session(&mut active, &notice_tx).await;
                        }
                    }
                    // No active session: the event is dropped
                }
                None => break,
            },

            _ = ping_tick.tick() => {
                if let Some(session) = active.as_mut() {
                    if !session.ping_enabled {
                        continue;
                    }
                    if session.last_pong.elapsed() > PONG_TIMEOUT {
                        tracing::warn!(session = session.id, "pong timeout");
                        drop_session(&mut active, &notice_tx).await;
                        continue;
                    }
                    let ping = Message::Ping { text: None }.to_event();
                    if !session.write(&ping).await {
                        drop_session(&mut active, &notice_tx).await;
                    }
                }
            }
        }
    }

    if let Some(session) = active.take() {
        session.close();
    }
    tracing::debug!("server listener stopped");
}

async fn drop_session(active: &mut Option<Session>, notice_tx: &mpsc::Sender<ServerNotice>) {
    if let Some(session) = active.take() {
        tracing::info!(session = session.id, "session closed");
        session.close();
        let _ = notice_tx.send(ServerNotice::Disconnected).await;
    }
}

async fn session_read_loop(id: u64, mut reader: BoxedReader, tx: mpsc::Sender<SessionEvent>) {
    loop {
        match read_event(&mut reader).await {
            Ok(Some(event)) => {
                if tx.send(SessionEvent::Frame(id, event)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session = id, error = %e, "session read failed");
                break;
            }
        }
    }
    let _ = tx.send(SessionEvent::Closed(id)).await;
}

async fn shutdown_flip(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
