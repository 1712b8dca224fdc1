//! Wake word coordinator
//!
//! Relays mic audio to the wake peer while the state machine is waiting
//! for a wake word, arms the configured model names on every connect,
//! and debounces detections with a per-name refractory window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};

use crate::audio::AudioChunk;
use crate::config::WakeConfig;
use crate::peer::{PeerHandle, PeerNotice};
use crate::protocol::Message;

/// Pause applied to audio intake when the wake peer queue is saturated
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(50);

/// Edges from the wake coordinator to the state machine
#[derive(Debug, PartialEq, Eq)]
pub enum WakeNotice {
    /// An accepted (non-refractory) detection
    Detection {
        name: Option<String>,
        /// Server pipeline mapped from the detected name
        pipeline: Option<String>,
    },
}

/// Spawn the wake coordinator.
///
/// `gate` is true only while the satellite is waiting for a wake word;
/// outside that window audio is not forwarded but the peer stays up.
pub fn spawn_wake(
    config: WakeConfig,
    peer: PeerHandle,
    peer_notices: mpsc::Receiver<PeerNotice>,
    chunks: broadcast::Receiver<AudioChunk>,
    gate: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<WakeNotice> {
    let (notice_tx, notice_rx) = mpsc::channel(8);
    tokio::spawn(wake_loop(
        config,
        peer,
        peer_notices,
        chunks,
        gate,
        notice_tx,
        shutdown,
    ));
    notice_rx
}

async fn wake_loop(
    config: WakeConfig,
    peer: PeerHandle,
    mut peer_notices: mpsc::Receiver<PeerNotice>,
    mut chunks: broadcast::Receiver<AudioChunk>,
    gate: watch::Receiver<bool>,
    notice_tx: mpsc::Sender<WakeNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let refractory = config.refractory();
    // Refractory deadline per wake word name
    let mut deadlines: HashMap<Option<String>, Instant> = HashMap::new();

    loop {
        tokio::select! {
            () = shutdown_flip(&mut shutdown) => break,

            notice = peer_notices.recv() => match notice {
                Some(PeerNotice::Connected) => {
                    // Re-arm the model set on every (re)connect
                    peer.send(&Message::Detect {
                        names: config.active_names(),
                    })
                    .await;
                    tracing::info!(names = ?config.active_names(), "wake service armed");
                }
                Some(PeerNotice::Disconnected) => {
                    tracing::warn!("wake service disconnected");
                }
                Some(PeerNotice::Message(Message::Detection { name })) => {
                    let now = Instant::now();
                    if let Some(deadline) = deadlines.get(&name) {
                        if now < *deadline {
                            tracing::debug!(?name, "detection inside refractory window");
                            continue;
                        }
                    }
                    if let Some(refractory) = refractory {
                        deadlines.insert(name.clone(), now + refractory);
                    } else {
                        deadlines.remove(&name);
                    }

                    let pipeline = pipeline_for(&config, name.as_deref());
                    tracing::info!(?name, ?pipeline, "wake word detected");
                    if notice_tx
                        .send(WakeNotice::Detection { name, pipeline })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(PeerNotice::Message(other)) => {
                    tracing::debug!(event = ?other, "unexpected wake event skipped");
                }
                None => break,
            },

            chunk = chunks.recv() => match chunk {
                Ok(chunk) => {
                    if !*gate.borrow() {
                        continue;
                    }
                    if !peer.send_audio(&Message::AudioChunk(chunk)) {
                        tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "wake coordinator lagging on mic audio");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::debug!("wake coordinator stopped");
}

/// Resolve the server pipeline mapped to a detected wake word
fn pipeline_for(config: &WakeConfig, detected: Option<&str>) -> Option<String> {
    let detected = normalize_wake_word(detected?);
    config
        .names
        .iter()
        .find(|entry| normalize_wake_word(&entry.name) == detected)
        .and_then(|entry| entry.pipeline.clone())
}

/// Normalize a wake word name for comparison: lowercase, strip version
/// suffixes like `v1.0`, collapse non-alphanumerics to single spaces.
#[must_use]
pub fn normalize_wake_word(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let stripped = strip_versions(&lowered);

    let mapped: String = stripped
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove `v<digits>(.<digits>)+` version markers
fn strip_versions(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let chars: Vec<char> = name.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == 'v' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            let mut saw_dotted = false;
            while j < chars.len() && chars[j] == '.' {
                let mut k = j + 1;
                while k < chars.len() && chars[k].is_ascii_digit() {
                    k += 1;
                }
                if k == j + 1 {
                    break;
                }
                saw_dotted = true;
                j = k;
            }
            if saw_dotted && j > i + 1 {
                i = j;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
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
    use crate::config::WakeWordEntry;

    fn wake_config(refractory_seconds: Option<f32>) -> WakeConfig {
        WakeConfig {
            uri: Some("tcp://127.0.0.1:10400".to_string()),
            command: None,
            names: vec![
                WakeWordEntry {
                    name: "ok_nabu".to_string(),
                    pipeline: Some("kitchen".to_string()),
                },
                WakeWordEntry {
                    name: "hey_jarvis".to_string(),
                    pipeline: None,
                },
            ],
            refractory_seconds,
        }
    }

    #[test]
    fn normalizes_wake_words() {
        assert_eq!(normalize_wake_word("ok_nabu"), "ok nabu");
        assert_eq!(normalize_wake_word("  OK Nabu  "), "ok nabu");
        assert_eq!(normalize_wake_word("ok_nabu_v1.0"), "ok nabu");
        assert_eq!(normalize_wake_word("hey-jarvis-v2.3.1"), "hey jarvis");
        // A bare "v" or undotted number is not a version marker
        assert_eq!(normalize_wake_word("nova"), "nova");
        assert_eq!(normalize_wake_word("v2"), "v2");
    }

    #[test]
    fn maps_detection_to_pipeline() {
        let config = wake_config(Some(5.0));
        assert_eq!(
            pipeline_for(&config, Some("ok nabu v1.0")),
            Some("kitchen".to_string())
        );
        assert_eq!(pipeline_for(&config, Some("hey_jarvis")), None);
        assert_eq!(pipeline_for(&config, Some("unknown")), None);
        assert_eq!(pipeline_for(&config, None), None);
    }

    async fn run_detections(
        refractory_seconds: Option<f32>,
        detections: usize,
    ) -> Vec<WakeNotice> {
        let (peer_tx, peer_rx) = mpsc::channel(16);
        let (chunks_tx, _) = broadcast::channel::<AudioChunk>(8);
        let (_gate_tx, gate_rx) = watch::channel(true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Outbound side of the peer is irrelevant here
        let mut notices = spawn_wake(
            wake_config(refractory_seconds),
            crate::peer::test_peer_handle(),
            peer_rx,
            chunks_tx.subscribe(),
            gate_rx,
            shutdown_rx,
        );

        for _ in 0..detections {
            peer_tx
                .send(PeerNotice::Message(Message::Detection {
                    name: Some("ok_nabu".to_string()),
                }))
                .await
                .unwrap();
        }
        drop(peer_tx);

        let mut accepted = Vec::new();
        while let Some(notice) = notices.recv().await {
            accepted.push(notice);
        }
        accepted
    }

    #[tokio::test]
    async fn refractory_window_drops_repeat_detections() {
        let accepted = run_detections(Some(5.0), 2).await;
        assert_eq!(
            accepted,
            vec![WakeNotice::Detection {
                name: Some("ok_nabu".to_string()),
                pipeline: Some("kitchen".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn no_refractory_accepts_every_detection() {
        let accepted = run_detections(None, 3).await;
        assert_eq!(accepted.len(), 3);
    }

    #[tokio::test]
    async fn refractory_is_per_name() {
        let (peer_tx, peer_rx) = mpsc::channel(16);
        let (chunks_tx, _) = broadcast::channel::<AudioChunk>(8);
        let (_gate_tx, gate_rx) = watch::channel(true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut notices = spawn_wake(
            wake_config(Some(5.0)),
            crate::peer::test_peer_handle(),
            peer_rx,
            chunks_tx.subscribe(),
            gate_rx,
            shutdown_rx,
        );

        for name in ["ok_nabu", "hey_jarvis", "ok_nabu"] {
            peer_tx
                .send(PeerNotice::Message(Message::Detection {
                    name: Some(name.to_string()),
                }))
                .await
                .unwrap();
        }
        drop(peer_tx);

        let mut names = Vec::new();
        while let Some(WakeNotice::Detection { name, .. }) = notices.recv().await {
            names.push(name.unwrap());
        }
        assert_eq!(names, vec!["ok_nabu", "hey_jarvis"]);
    }

    #[tokio::test]
    async fn arms_model_set_on_connect() {
        let (peer_tx, peer_rx) = mpsc::channel(16);
        let (chunks_tx, _) = broadcast::channel::<AudioChunk>(8);
        let (_gate_tx, gate_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = crate::peer::test_peer_handle();

        let _notices = spawn_wake(
            wake_config(Some(5.0)),
            peer.clone(),
            peer_rx,
            chunks_tx.subscribe(),
            gate_rx,
            shutdown_rx,
        );

        // Two connects (initial + reconnect) re-arm both times
        peer_tx.send(PeerNotice::Connected).await.unwrap();
        peer_tx.send(PeerNotice::Disconnected).await.unwrap();
        peer_tx.send(PeerNotice::Connected).await.unwrap();

        for _ in 0..2 {
            let event = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                peer.next_outbound(),
            )
            .await
            .unwrap();
            assert_eq!(event.event_type, "detect");
            assert_eq!(event.data.unwrap()["names"][0], "ok_nabu");
        }
    }

    #[tokio::test]
    async fn gate_controls_audio_forwarding() {
        let (_peer_tx, peer_rx) = mpsc::channel(16);
        let (chunks_tx, _) = broadcast::channel::<AudioChunk>(8);
        let (gate_tx, gate_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = crate::peer::test_peer_handle();

        let _notices = spawn_wake(
            wake_config(Some(5.0)),
            peer.clone(),
            peer_rx,
            chunks_tx.subscribe(),
            gate_rx,
            shutdown_rx,
        );

        let chunk = AudioChunk {
            format: crate::audio::AudioFormat::SPEECH,
            samples: vec![1, 2],
            timestamp_ms: 0,
        };

        // Gate closed: chunk is not forwarded
        chunks_tx.send(chunk.clone()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(peer.try_next_outbound().is_none());

        // Gate open: chunk flows to the wake peer
        gate_tx.send(true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        chunks_tx.send(chunk).unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), peer.next_outbound())
            .await
            .unwrap();
        assert_eq!(event.event_type, "audio-chunk");
    }
}
