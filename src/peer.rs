//! Durable protocol peers
//!
//! A peer owns one connection to a remote Wyoming service: it dials,
//! optionally handshakes with `describe`/`info`, then relays events in
//! both directions until the transport fails, at which point it backs off
//! and reconnects forever until shut down. Mic and snd subprocess
//! endpoints get the same supervision with raw-PCM adapters.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};

use crate::audio::{AudioChunk, AudioFormat};
use crate::protocol::{read_event, write_event, Event, Message};
use crate::{Error, Result};

/// Outbound queue capacity per peer
const OUTBOUND_CAPACITY: usize = 64;

/// Inbound notice capacity per peer
const NOTICE_CAPACITY: usize = 64;

/// Handshake must complete within this window
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between pings once the remote advertises support
const PING_INTERVAL: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A parsed peer endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a `tcp://host:port` or `unix://path` URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for any other scheme or a malformed
    /// authority.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(addr) = uri.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| Error::Config(format!("missing port in {uri}")))?;
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in {uri}")))?;
            if host.is_empty() {
                return Err(Error::Config(format!("missing host in {uri}")));
            }
            return Ok(Self::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::Config(format!("missing path in {uri}")));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        Err(Error::Config(format!(
            "unsupported URI scheme: {uri} (expected tcp:// or unix://)"
        )))
    }

    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::Transport(format!("dial {host}:{port}: {e}")))?;
                stream.set_nodelay(true).ok();
                let (reader, writer) = stream.into_split();
                Ok((Box::new(BufReader::new(reader)), Box::new(writer)))
            }
            Self::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::Transport(format!("dial {}: {e}", path.display())))?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(BufReader::new(reader)), Box::new(writer)))
            }
        }
    }
}

/// How a peer reaches its service: a socket endpoint, or a subprocess
/// speaking the framed protocol over stdio
#[derive(Debug)]
pub enum PeerTransport {
    Endpoint(Endpoint),
    Command(Vec<String>),
}

impl PeerTransport {
    /// Connect, returning reader/writer halves and the child guard when
    /// the transport is a subprocess (dropping the guard kills it).
    async fn connect(
        &self,
    ) -> Result<(BoxedReader, BoxedWriter, Option<tokio::process::Child>)> {
        match self {
            Self::Endpoint(endpoint) => {
                let (reader, writer) = endpoint.connect().await?;
                Ok((reader, writer, None))
            }
            Self::Command(command) => {
                let mut child = spawn_command(command, Stdio::piped(), Stdio::piped())?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::DeviceBusy("no child stdout".to_string()))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::DeviceBusy("no child stdin".to_string()))?;
                Ok((
                    Box::new(BufReader::new(stdout)),
                    Box::new(stdin),
                    Some(child),
                ))
            }
        }
    }
}

/// Capped exponential backoff with jitter for reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First retry delay
    pub initial: Duration,
    /// Delay cap
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given retry attempt: `min(initial * 2^attempt, max)`
    /// with ±20% jitter derived from the system clock.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max);

        let jitter_nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();

        // Scale clock nanos to a factor in [-0.2, 0.2]
        let jitter_fraction = f64::from(jitter_nanos % 400) / 1000.0 - 0.2;
        let jittered = base.mul_f64(1.0 + jitter_fraction);
        jittered.min(self.max)
    }
}

/// Inbound edge from a peer to its consumer
#[derive(Debug)]
pub enum PeerNotice {
    /// Transport established (and handshake finished, when configured)
    Connected,
    /// Transport lost; the peer is backing off to reconnect
    Disconnected,
    /// Decoded message from the remote
    Message(Message),
}

/// Peer construction options
#[derive(Debug)]
pub struct PeerOptions {
    /// Short label for logs (`mic`, `snd`, `wake`, `event`)
    pub label: &'static str,

    pub transport: PeerTransport,

    /// Send `describe` and await `info` before entering steady state
    pub handshake: bool,

    pub reconnect: ReconnectPolicy,
}

/// Bounded outbound queue shared between a peer's handle and its write
/// loop.
///
/// Audio enqueues at capacity evict the oldest queued audio chunk (the
/// head of the stream is the stalest sample); events that must not be
/// dropped always enqueue, so the queue can exceed capacity by the small
/// volume of lifecycle traffic.
#[derive(Debug, Clone)]
struct OutboundQueue {
    inner: Arc<Mutex<VecDeque<Event>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event that must not be dropped
    fn push(&self, event: Event) {
        self.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Enqueue an audio chunk; at capacity the oldest queued audio chunk
    /// is dropped from the head to make room. Returns false when any
    /// chunk (old or new) was shed.
    fn push_audio(&self, event: Event) -> bool {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            let Some(stale) = queue.iter().position(Event::is_audio_chunk) else {
                // Saturated with must-send events; shed the new chunk
                return false;
            };
            queue.remove(stale);
            queue.push_back(event);
            drop(queue);
            self.notify.notify_one();
            return false;
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Wait for the next queued event
    async fn pop(&self) -> Event {
        loop {
            if let Some(event) = self.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn try_pop(&self) -> Option<Event> {
        self.lock().pop_front()
    }
}

/// Cloneable sender half of a peer
#[derive(Debug, Clone)]
pub struct PeerHandle {
    outbound: OutboundQueue,
    dropped_audio: Arc<AtomicU64>,
}

impl PeerHandle {
    /// Enqueue an event that must not be dropped
    #[allow(clippy::unused_async)]
    pub async fn send(&self, message: &Message) {
        self.outbound.push(message.to_event());
    }

    /// Enqueue a raw wire event that must not be dropped
    #[allow(clippy::unused_async)]
    pub async fn send_raw(&self, event: Event) {
        self.outbound.push(event);
    }

    /// Enqueue an audio chunk; when the queue is saturated the oldest
    /// queued chunk is dropped from the head.
    ///
    /// Returns false when a chunk was shed, so the producer can pause
    /// intake briefly.
    pub fn send_audio(&self, message: &Message) -> bool {
        if self.outbound.push_audio(message.to_event()) {
            return true;
        }
        let dropped = self.dropped_audio.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped.is_power_of_two() {
            tracing::warn!(dropped, "peer outbound queue full, audio dropped");
        }
        false
    }

    /// Total audio chunks shed so far
    #[must_use]
    pub fn dropped_audio(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    /// Next queued outbound event, for tests that stand in for the peer
    /// write loop
    #[cfg(test)]
    pub(crate) async fn next_outbound(&self) -> Event {
        self.outbound.pop().await
    }

    /// Non-blocking variant of [`Self::next_outbound`]
    #[cfg(test)]
    pub(crate) fn try_next_outbound(&self) -> Option<Event> {
        self.outbound.try_pop()
    }
}

/// Spawn a supervised peer.
///
/// Returns the sender handle and the inbound notice stream. The peer runs
/// until `shutdown` flips or every consumer of the notice stream is gone.
pub fn spawn_peer(
    options: PeerOptions,
    shutdown: watch::Receiver<bool>,
) -> (PeerHandle, mpsc::Receiver<PeerNotice>) {
    let outbound = OutboundQueue::new(OUTBOUND_CAPACITY);
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);

    let handle = PeerHandle {
        outbound: outbound.clone(),
        dropped_audio: Arc::new(AtomicU64::new(0)),
    };

    tokio::spawn(peer_loop(options, outbound, notice_tx, shutdown));

    (handle, notice_rx)
}

/// Internal edge from a connection's read task to its supervisor
enum ConnEvent {
    Frame(Event),
    Closed(Option<Error>),
}

async fn peer_loop(
    options: PeerOptions,
    outbound: OutboundQueue,
    notice_tx: mpsc::Sender<PeerNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let label = options.label;
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            () = wait_shutdown(&mut shutdown) => break,
            connected = options.transport.connect() => connected,
        };

        let (reader, mut writer, _child_guard) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                let delay = options.reconnect.delay_for_attempt(attempt);
                tracing::debug!(peer = label, error = %e, ?delay, "connect failed");
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    () = wait_shutdown(&mut shutdown) => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let (conn_tx, mut conn_rx) = mpsc::channel::<ConnEvent>(32);
        let read_task = tokio::spawn(read_loop(reader, conn_tx));

        let mut ping_supported = false;
        if options.handshake {
            match handshake(&mut writer, &mut conn_rx).await {
                Ok(supported) => ping_supported = supported,
                Err(e) => {
                    tracing::warn!(peer = label, error = %e, "handshake failed");
                    read_task.abort();
                    let delay = options.reconnect.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        () = wait_shutdown(&mut shutdown) => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            }
        }

        attempt = 0;
        tracing::info!(peer = label, "connected");
        if notice_tx.send(PeerNotice::Connected).await.is_err() {
            read_task.abort();
            break;
        }

        let disconnect = run_connection(
            label,
            &mut writer,
            &mut conn_rx,
            &outbound,
            &notice_tx,
            &mut shutdown,
            ping_supported,
        )
        .await;
        read_task.abort();

        match disconnect {
            Disconnect::Shutdown => break,
            Disconnect::ConsumerGone => break,
            Disconnect::Transport => {
                tracing::warn!(peer = label, "disconnected");
                if notice_tx.send(PeerNotice::Disconnected).await.is_err() {
                    break;
                }
                let delay = options.reconnect.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    () = wait_shutdown(&mut shutdown) => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::debug!(peer = label, "peer stopped");
}

enum Disconnect {
    Transport,
    Shutdown,
    ConsumerGone,
}

#[allow(clippy::too_many_lines, clippy::too_many_arguments)]
async fn run_connection(
    label: &'static str,
    writer: &mut BoxedWriter,
    conn_rx: &mut mpsc::Receiver<ConnEvent>,
    outbound: &OutboundQueue,
    notice_tx: &mpsc::Sender<PeerNotice>,
    shutdown: &mut watch::Receiver<bool>,
    ping_supported: bool,
) -> Disconnect {
    let mut last_traffic = Instant::now();
    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_tick.reset();

    loop {
        tokio::select! {
            () = wait_shutdown(shutdown) => return Disconnect::Shutdown,

            conn = conn_rx.recv() => match conn {
                Some(ConnEvent::Frame(event)) => {
                    last_traffic = Instant::now();
                    match Message::from_event(event) {
                        // Answer pings locally; they never reach the consumer
                        Message::Ping { text } => {
                            let pong = Message::Pong { text }.to_event();
                            if write_event(writer, &pong).await.is_err() {
                                return Disconnect::Transport;
                            }
                        }
                        Message::Pong { .. } => {}
                        message => {
                            if notice_tx.send(PeerNotice::Message(message)).await.is_err() {
                                return Disconnect::ConsumerGone;
                            }
                        }
                    }
                }
                Some(ConnEvent::Closed(err)) => {
                    if let Some(err) = err {
                        tracing::debug!(peer = label, error = %err, "read loop closed");
                    }
                    return Disconnect::Transport;
                }
                None => return Disconnect::Transport,
            },

            event = outbound.pop() => {
                if let Err(e) = write_event(writer, &event).await {
                    tracing::debug!(peer = label, error = %e, "write failed");
                    return Disconnect::Transport;
                }
            },

            _ = ping_tick.tick() => {
                if last_traffic.elapsed() > PING_INTERVAL * 2 && ping_supported {
                    tracing::warn!(peer = label, "no traffic within ping window");
                    return Disconnect::Transport;
                }
                if ping_supported {
                    let ping = Message::Ping { text: None }.to_event();
                    if write_event(writer, &ping).await.is_err() {
                        return Disconnect::Transport;
                    }
                }
            }
        }
    }
}

async fn read_loop(mut reader: BoxedReader, conn_tx: mpsc::Sender<ConnEvent>) {
    loop {
        match read_event(&mut reader).await {
            Ok(Some(event)) => {
                if conn_tx.send(ConnEvent::Frame(event)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = conn_tx.send(ConnEvent::Closed(None)).await;
                return;
            }
            Err(e) => {
                let _ = conn_tx.send(ConnEvent::Closed(Some(e))).await;
                return;
            }
        }
    }
}

/// Send `describe` and wait for `info`.
///
/// Returns whether the remote advertises ping support.
async fn handshake(
    writer: &mut BoxedWriter,
    conn_rx: &mut mpsc::Receiver<ConnEvent>,
) -> Result<bool> {
    write_event(writer, &Event::new("describe")).await?;

    let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                return Err(Error::Transport("handshake timed out".to_string()));
            }
            conn = conn_rx.recv() => match conn {
                Some(ConnEvent::Frame(event)) => {
                    if event.event_type == "info" {
                        let ping_supported = event
                            .data
                            .as_ref()
                            .and_then(|d| d.get("ping_supported"))
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false);
                        return Ok(ping_supported);
                    }
                    // Anything else before info is a protocol quirk; skip it
                }
                Some(ConnEvent::Closed(err)) => {
                    return Err(err.unwrap_or_else(|| {
                        Error::Transport("closed during handshake".to_string())
                    }));
                }
                None => {
                    return Err(Error::Transport("closed during handshake".to_string()));
                }
            }
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Subprocess endpoints
// ---------------------------------------------------------------------------

/// Spawn a capture subprocess that writes raw PCM to stdout.
///
/// Chunks of `samples_per_chunk` frames are decoded into `audio-chunk`
/// messages on the returned notice stream, so consumers see the same
/// interface as a framed mic peer. The child is restarted with backoff
/// if it exits.
pub fn spawn_mic_command(
    command: Vec<String>,
    format: AudioFormat,
    samples_per_chunk: usize,
    reconnect: ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<PeerNotice> {
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
    tokio::spawn(mic_command_loop(
        command,
        format,
        samples_per_chunk,
        reconnect,
        notice_tx,
        shutdown,
    ));
    notice_rx
}

async fn mic_command_loop(
    command: Vec<String>,
    format: AudioFormat,
    samples_per_chunk: usize,
    reconnect: ReconnectPolicy,
    notice_tx: mpsc::Sender<PeerNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let chunk_bytes = samples_per_chunk * usize::from(format.width) * usize::from(format.channels);
    let mut attempt: u32 = 0;
    let started = Instant::now();

    while !*shutdown.borrow() {
        let mut child = match spawn_command(&command, Stdio::null(), Stdio::piped()) {
            Ok(child) => child,
            Err(e) => {
                let delay = reconnect.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(error = %e, ?delay, "mic command failed to start");
                tokio::select! {
                    () = wait_shutdown(&mut shutdown) => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };
        let Some(mut stdout) = child.stdout.take() else {
            break;
        };

        attempt = 0;
        if notice_tx.send(PeerNotice::Connected).await.is_err() {
            break;
        }

        let mut buf = vec![0u8; chunk_bytes];
        loop {
            let read = tokio::select! {
                () = wait_shutdown(&mut shutdown) => {
                    let _ = child.start_kill();
                    return;
                }
                read = stdout.read_exact(&mut buf) => read,
            };
            match read {
                Ok(_) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timestamp_ms = started.elapsed().as_millis() as u64;
                    let chunk = Message::AudioChunk(AudioChunk {
                        format,
                        samples: buf.clone(),
                        timestamp_ms,
                    });
                    if notice_tx.send(PeerNotice::Message(chunk)).await.is_err() {
                        let _ = child.start_kill();
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "mic command stream ended");
                    break;
                }
            }
        }

        let _ = child.start_kill();
        if notice_tx.send(PeerNotice::Disconnected).await.is_err() {
            break;
        }
        let delay = reconnect.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            () = wait_shutdown(&mut shutdown) => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sender half of a playback subprocess; only raw audio bytes are written
#[derive(Debug, Clone)]
pub struct SndProcessHandle {
    samples_tx: mpsc::Sender<Vec<u8>>,
}

impl SndProcessHandle {
    /// Queue raw samples for the child's stdin
    pub async fn write(&self, samples: Vec<u8>) {
        if self.samples_tx.send(samples).await.is_err() {
            tracing::debug!("snd command gone, samples discarded");
        }
    }
}

/// Spawn a playback subprocess that reads raw PCM from stdin.
///
/// The child is restarted with backoff if it exits.
pub fn spawn_snd_command(
    command: Vec<String>,
    reconnect: ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
) -> SndProcessHandle {
    let (samples_tx, samples_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
    tokio::spawn(snd_command_loop(command, reconnect, samples_rx, shutdown));
    SndProcessHandle { samples_tx }
}

async fn snd_command_loop(
    command: Vec<String>,
    reconnect: ReconnectPolicy,
    mut samples_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    while !*shutdown.borrow() {
        let mut child = match spawn_command(&command, Stdio::piped(), Stdio::null()) {
            Ok(child) => child,
            Err(e) => {
                let delay = reconnect.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(error = %e, ?delay, "snd command failed to start");
                tokio::select! {
                    () = wait_shutdown(&mut shutdown) => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };
        let Some(mut stdin) = child.stdin.take() else {
            break;
        };
        attempt = 0;

        loop {
            let samples = tokio::select! {
                () = wait_shutdown(&mut shutdown) => {
                    let _ = child.start_kill();
                    return;
                }
                samples = samples_rx.recv() => samples,
            };
            match samples {
                Some(samples) => {
                    if let Err(e) = stdin.write_all(&samples).await {
                        tracing::warn!(error = %e, "snd command write failed");
                        break;
                    }
                }
                None => {
                    let _ = child.start_kill();
                    return;
                }
            }
        }

        let _ = child.start_kill();
        let delay = reconnect.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            () = wait_shutdown(&mut shutdown) => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Build a [`SndProcessHandle`] over a bare channel, for tests that
/// observe raw sink writes without spawning a child
#[cfg(test)]
pub(crate) fn test_process_handle(samples_tx: mpsc::Sender<Vec<u8>>) -> SndProcessHandle {
    SndProcessHandle { samples_tx }
}

/// Build a [`PeerHandle`] with no peer behind it, for tests that observe
/// outbound events via [`PeerHandle::next_outbound`]
#[cfg(test)]
pub(crate) fn test_peer_handle() -> PeerHandle {
    PeerHandle {
        outbound: OutboundQueue::new(OUTBOUND_CAPACITY),
        dropped_audio: Arc::new(AtomicU64::new(0)),
    }
}

fn spawn_command(
    command: &[String],
    stdin: Stdio,
    stdout: Stdio,
) -> Result<tokio::process::Child> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::DeviceBusy("empty command".to_string()))?;
    Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::DeviceBusy(format!("{program}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_uri() {
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.2:10700").unwrap(),
            Endpoint::Tcp {
                host: "10.0.0.2".to_string(),
                port: 10_700,
            }
        );
    }

    #[test]
    fn parses_unix_uri() {
        assert_eq!(
            Endpoint::parse("unix:///run/satellite.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/satellite.sock"))
        );
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(Endpoint::parse("http://example.com").is_err());
        assert!(Endpoint::parse("tcp://nohost").is_err());
        assert!(Endpoint::parse("tcp://:1234").is_err());
        assert!(Endpoint::parse("tcp://host:notaport").is_err());
        assert!(Endpoint::parse("unix://").is_err());
    }

    fn audio_event(marker: u8) -> Event {
        Message::AudioChunk(AudioChunk {
            format: AudioFormat::SPEECH,
            samples: vec![marker],
            timestamp_ms: u64::from(marker),
        })
        .to_event()
    }

    #[test]
    fn queue_sheds_oldest_audio_from_the_head() {
        let queue = OutboundQueue::new(2);
        assert!(queue.push_audio(audio_event(1)));
        assert!(queue.push_audio(audio_event(2)));

        // At capacity: the oldest queued chunk makes room for the new one
        assert!(!queue.push_audio(audio_event(3)));

        assert_eq!(queue.try_pop().unwrap().payload.unwrap(), vec![2]);
        assert_eq!(queue.try_pop().unwrap().payload.unwrap(), vec![3]);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn queue_never_sheds_lifecycle_events() {
        let queue = OutboundQueue::new(2);
        queue.push(Event::new("detect"));
        queue.push(Event::new("streaming-started"));

        // Saturated with must-send events: the new chunk is the one shed
        assert!(!queue.push_audio(audio_event(1)));

        assert_eq!(queue.try_pop().unwrap().event_type, "detect");
        assert_eq!(queue.try_pop().unwrap().event_type, "streaming-started");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn queue_eviction_skips_lifecycle_at_the_head() {
        let queue = OutboundQueue::new(2);
        queue.push(Event::new("detect"));
        assert!(queue.push_audio(audio_event(1)));

        // The audio chunk behind the lifecycle event is the one evicted
        assert!(!queue.push_audio(audio_event(2)));

        assert_eq!(queue.try_pop().unwrap().event_type, "detect");
        assert_eq!(queue.try_pop().unwrap().payload.unwrap(), vec![2]);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn queue_pop_wakes_on_push() {
        let queue = OutboundQueue::new(4);
        let waiter = queue.clone();
        let popped = tokio::spawn(async move { waiter.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Event::new("ping"));

        let event = tokio::time::timeout(Duration::from_secs(1), popped)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "ping");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();

        let d0 = policy.delay_for_attempt(0);
        assert!(d0 >= Duration::from_millis(800), "{d0:?}");
        assert!(d0 <= Duration::from_millis(1200), "{d0:?}");

        let d2 = policy.delay_for_attempt(2);
        assert!(d2 >= Duration::from_millis(3200), "{d2:?}");
        assert!(d2 <= Duration::from_millis(4800), "{d2:?}");

        // 2^10 seconds is far past the cap
        let d10 = policy.delay_for_attempt(10);
        assert!(d10 <= Duration::from_secs(30), "{d10:?}");
    }

    #[test]
    fn backoff_survives_huge_attempts() {
        let policy = ReconnectPolicy::default();
        let d = policy.delay_for_attempt(u32::MAX);
        assert!(d <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn peer_connects_and_relays_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            // Peer publishes, we echo a transcript back
            let event = read_event(&mut reader).await.unwrap().unwrap();
            assert_eq!(event.event_type, "detect");

            let reply = Message::Transcript {
                text: "hello".to_string(),
            };
            write_event(&mut writer, &reply.to_event()).await.unwrap();
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mut notices) = spawn_peer(
            PeerOptions {
                label: "test",
                transport: PeerTransport::Endpoint(Endpoint::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: addr.port(),
                }),
                handshake: false,
                reconnect: ReconnectPolicy::default(),
            },
            shutdown_rx,
        );

        assert!(matches!(
            notices.recv().await.unwrap(),
            PeerNotice::Connected
        ));

        handle
            .send(&Message::Detect {
                names: vec!["ok_nabu".to_string()],
            })
            .await;

        let notice = notices.recv().await.unwrap();
        match notice {
            PeerNotice::Message(Message::Transcript { text }) => assert_eq!(text, "hello"),
            other => panic!("unexpected notice: {other:?}"),
        }

        server.await.unwrap();
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn peer_reports_disconnect_and_reconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection dropped immediately, second held open
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_handle, mut notices) = spawn_peer(
            PeerOptions {
                label: "test",
                transport: PeerTransport::Endpoint(Endpoint::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: addr.port(),
                }),
                handshake: false,
                reconnect: ReconnectPolicy {
                    initial: Duration::from_millis(10),
                    max: Duration::from_millis(50),
                },
            },
            shutdown_rx,
        );

        assert!(matches!(
            notices.recv().await.unwrap(),
            PeerNotice::Connected
        ));
        assert!(matches!(
            notices.recv().await.unwrap(),
            PeerNotice::Disconnected
        ));
        assert!(matches!(
            notices.recv().await.unwrap(),
            PeerNotice::Connected
        ));

        shutdown_tx.send(true).unwrap();
        server.abort();
    }
}
