//! Typed view over the wire event set
//!
//! The Wyoming event space is large and sparse; this module maps the
//! closed set of types the satellite understands onto a tagged enum with
//! an `Unknown` catch-all that callers count and skip.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::event::Event;
use crate::audio::{AudioChunk, AudioFormat};

/// Server-side pipeline stage names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Remote wake word detection
    Wake,
    /// Speech to text
    Asr,
    /// Intent handling only (no audio response)
    Handle,
    /// Text to speech
    Tts,
}

/// Request to run a server pipeline, bracketing one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPipeline {
    pub start_stage: PipelineStage,
    pub end_stage: PipelineStage,

    /// Named server pipeline to run, if mapped from a wake word
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Wake word that triggered this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_word_name: Option<String>,

    /// True if the server should restart the pipeline when it ends
    #[serde(default)]
    pub restart_on_end: bool,

    /// Output format the satellite expects for TTS audio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snd_format: Option<AudioFormat>,
}

/// Timer state announced by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub total_seconds: u64,

    /// Seconds left; defaults to `total_seconds` when the server omits it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub is_paused: bool,
}

const fn default_true() -> bool {
    true
}

impl TimerInfo {
    /// Seconds left, falling back to the total
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining_seconds.unwrap_or(self.total_seconds)
    }
}

/// Every wire message the satellite understands
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Describe,
    Info(Value),
    Ping { text: Option<String> },
    Pong { text: Option<String> },

    AudioStart { format: AudioFormat, timestamp_ms: u64 },
    AudioChunk(AudioChunk),
    AudioStop { timestamp_ms: u64 },

    Detect { names: Vec<String> },
    Detection { name: Option<String> },

    RunPipeline(RunPipeline),
    RunSatellite,
    PauseSatellite,
    ResumeSatellite,
    StreamingStarted,
    StreamingStopped,

    Transcript { text: String },
    Synthesize { text: String },
    VoiceStarted,
    VoiceStopped,
    Played,

    TimerStarted(TimerInfo),
    TimerUpdated(TimerInfo),
    TimerCancelled { id: String },
    TimerFinished { id: String },

    Error { text: String },

    /// Recognized by framing but not by the satellite; counted and skipped
    Unknown(Event),
}

impl Message {
    /// Decode a wire event into a typed message.
    ///
    /// Events with a known type but a malformed data section decode to
    /// `Unknown` so the caller can log and skip them.
    #[must_use]
    pub fn from_event(event: Event) -> Self {
        let data = event.data.clone().unwrap_or(Value::Null);

        match event.event_type.as_str() {
            "describe" => Self::Describe,
            "info" => Self::Info(data),
            "ping" => Self::Ping {
                text: text_field(&data, "text"),
            },
            "pong" => Self::Pong {
                text: text_field(&data, "text"),
            },
            "audio-start" => match serde_json::from_value::<AudioFormat>(data.clone()) {
                Ok(format) => Self::AudioStart {
                    format,
                    timestamp_ms: u64_field(&data, "timestamp"),
                },
                Err(_) => Self::Unknown(event),
            },
            "audio-chunk" => match serde_json::from_value::<AudioFormat>(data.clone()) {
                Ok(format) => Self::AudioChunk(AudioChunk {
                    format,
                    samples: event.payload.unwrap_or_default(),
                    timestamp_ms: u64_field(&data, "timestamp"),
                }),
                Err(_) => Self::Unknown(event),
            },
            "audio-stop" => Self::AudioStop {
                timestamp_ms: u64_field(&data, "timestamp"),
            },
            "detect" => Self::Detect {
                names: data
                    .get("names")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "detection" => Self::Detection {
                name: text_field(&data, "name"),
            },
            "run-pipeline" => match serde_json::from_value(data) {
                Ok(run) => Self::RunPipeline(run),
                Err(_) => Self::Unknown(event),
            },
            "run-satellite" => Self::RunSatellite,
            "pause-satellite" => Self::PauseSatellite,
            "resume-satellite" => Self::ResumeSatellite,
            "streaming-started" => Self::StreamingStarted,
            "streaming-stopped" => Self::StreamingStopped,
            "transcript" => Self::Transcript {
                text: text_field(&data, "text").unwrap_or_default(),
            },
            "synthesize" => Self::Synthesize {
                text: text_field(&data, "text").unwrap_or_default(),
            },
            "voice-started" => Self::VoiceStarted,
            "voice-stopped" => Self::VoiceStopped,
            "played" => Self::Played,
            "timer-started" => match serde_json::from_value(data) {
                Ok(timer) => Self::TimerStarted(timer),
                Err(_) => Self::Unknown(event),
            },
            "timer-updated" => match serde_json::from_value(data) {
                Ok(timer) => Self::TimerUpdated(timer),
                Err(_) => Self::Unknown(event),
            },
            "timer-cancelled" => match text_field(&data, "id") {
                Some(id) => Self::TimerCancelled { id },
                None => Self::Unknown(event),
            },
            "timer-finished" => match text_field(&data, "id") {
                Some(id) => Self::TimerFinished { id },
                None => Self::Unknown(event),
            },
            "error" => Self::Error {
                text: text_field(&data, "text").unwrap_or_default(),
            },
            _ => Self::Unknown(event),
        }
    }

    /// Encode this message as a wire event
    #[must_use]
    pub fn to_event(&self) -> Event {
        match self {
            Self::Describe => Event::new("describe"),
            Self::Info(data) => Event::with_data("info", data.clone()),
            Self::Ping { text } => optional_text_event("ping", "text", text),
            Self::Pong { text } => optional_text_event("pong", "text", text),
            Self::AudioStart {
                format,
                timestamp_ms,
            } => Event::with_data("audio-start", format_data(*format, *timestamp_ms)),
            Self::AudioChunk(chunk) => Event {
                event_type: "audio-chunk".to_string(),
                data: Some(format_data(chunk.format, chunk.timestamp_ms)),
                payload: Some(chunk.samples.clone()),
            },
            Self::AudioStop { timestamp_ms } => {
                Event::with_data("audio-stop", json!({ "timestamp": timestamp_ms }))
            }
            Self::Detect { names } => Event::with_data("detect", json!({ "names": names })),
            Self::Detection { name } => optional_text_event("detection", "name", name),
            Self::RunPipeline(run) => {
                Event::with_data("run-pipeline", serde_json::to_value(run).unwrap_or_default())
            }
            Self::RunSatellite => Event::new("run-satellite"),
            Self::PauseSatellite => Event::new("pause-satellite"),
            Self::ResumeSatellite => Event::new("resume-satellite"),
            Self::StreamingStarted => Event::new("streaming-started"),
            Self::StreamingStopped => Event::new("streaming-stopped"),
            Self::Transcript { text } => Event::with_data("transcript", json!({ "text": text })),
            Self::Synthesize { text } => Event::with_data("synthesize", json!({ "text": text })),
            Self::VoiceStarted => Event::new("voice-started"),
            Self::VoiceStopped => Event::new("voice-stopped"),
            Self::Played => Event::new("played"),
            Self::TimerStarted(timer) => {
                Event::with_data("timer-started", serde_json::to_value(timer).unwrap_or_default())
            }
            Self::TimerUpdated(timer) => {
                Event::with_data("timer-updated", serde_json::to_value(timer).unwrap_or_default())
            }
            Self::TimerCancelled { id } => {
                Event::with_data("timer-cancelled", json!({ "id": id }))
            }
            Self::TimerFinished { id } => Event::with_data("timer-finished", json!({ "id": id })),
            Self::Error { text } => Event::with_data("error", json!({ "text": text })),
            Self::Unknown(event) => event.clone(),
        }
    }

    /// True for `audio-chunk`, the only message safe to shed under load
    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self, Self::AudioChunk(_))
    }
}

fn text_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(ToString::to_string)
}

fn u64_field(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or_default()
}

fn optional_text_event(event_type: &str, key: &str, value: &Option<String>) -> Event {
    match value {
        Some(value) => Event::with_data(event_type, json!({ key: value })),
        None => Event::new(event_type),
    }
}

fn format_data(format: AudioFormat, timestamp_ms: u64) -> Value {
    json!({
        "rate": format.rate,
        "width": format.width,
        "channels": format.channels,
        "timestamp": timestamp_ms,
    })
}

/// Build the satellite's outbound `info` event
#[must_use]
pub fn satellite_info(
    name: &str,
    area: Option<&str>,
    snd_format: Option<AudioFormat>,
    active_wake_words: &[String],
) -> Event {
    let mut satellite = json!({
        "name": name,
        "description": name,
        "attribution": { "name": "", "url": "" },
        "installed": true,
        "version": env!("CARGO_PKG_VERSION"),
        "supports_trigger": true,
        "active_wake_words": active_wake_words,
    });
    if let Some(area) = area {
        satellite["area"] = json!(area);
    }
    if let Some(format) = snd_format {
        satellite["snd_format"] = json!({
            "rate": format.rate,
            "width": format.width,
            "channels": format.channels,
        });
    }

    Event::with_data(
        "info",
        json!({
            "satellite": satellite,
            "software": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_chunk_roundtrip() {
        let message = Message::AudioChunk(AudioChunk {
            format: AudioFormat::SPEECH,
            samples: vec![1, 2, 3, 4],
            timestamp_ms: 125,
        });

        let event = message.to_event();
        assert_eq!(event.event_type, "audio-chunk");
        assert_eq!(event.payload.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(Message::from_event(event), message);
    }

    #[test]
    fn run_pipeline_roundtrip() {
        let message = Message::RunPipeline(RunPipeline {
            start_stage: PipelineStage::Asr,
            end_stage: PipelineStage::Tts,
            name: Some("kitchen".to_string()),
            wake_word_name: Some("ok_nabu".to_string()),
            restart_on_end: false,
            snd_format: Some(AudioFormat {
                rate: 22_050,
                width: 2,
                channels: 1,
            }),
        });

        let event = message.to_event();
        assert_eq!(event.event_type, "run-pipeline");
        assert_eq!(event.data.as_ref().unwrap()["start_stage"], "asr");
        assert_eq!(Message::from_event(event), message);
    }

    #[test]
    fn timer_started_defaults_remaining_to_total() {
        let event = Event::with_data(
            "timer-started",
            json!({ "id": "t1", "total_seconds": 90 }),
        );
        let Message::TimerStarted(timer) = Message::from_event(event) else {
            panic!("expected timer-started");
        };
        assert_eq!(timer.remaining(), 90);
        assert!(timer.is_active);
        assert!(!timer.is_paused);
    }

    #[test]
    fn unknown_type_is_preserved() {
        let event = Event::with_data("handled", json!({ "text": "done" }));
        let message = Message::from_event(event.clone());
        assert_eq!(message, Message::Unknown(event.clone()));
        assert_eq!(message.to_event(), event);
    }

    #[test]
    fn malformed_known_type_becomes_unknown() {
        let event = Event::with_data("timer-cancelled", json!({ "wrong": true }));
        assert!(matches!(Message::from_event(event), Message::Unknown(_)));
    }

    #[test]
    fn detection_without_name() {
        let message = Message::from_event(Event::new("detection"));
        assert_eq!(message, Message::Detection { name: None });
    }

    #[test]
    fn only_audio_chunks_are_sheddable() {
        let chunk = Message::AudioChunk(AudioChunk {
            format: AudioFormat::SPEECH,
            samples: vec![0; 4],
            timestamp_ms: 0,
        });
        assert!(chunk.is_audio());
        assert!(!Message::RunSatellite.is_audio());
        assert!(!Message::Transcript { text: String::new() }.is_audio());
    }

    #[test]
    fn info_advertises_identity() {
        let event = satellite_info(
            "Kitchen Satellite",
            Some("Kitchen"),
            Some(AudioFormat {
                rate: 22_050,
                width: 2,
                channels: 1,
            }),
            &["ok_nabu".to_string()],
        );

        let data = event.data.unwrap();
        assert_eq!(data["satellite"]["name"], "Kitchen Satellite");
        assert_eq!(data["satellite"]["area"], "Kitchen");
        assert_eq!(data["satellite"]["supports_trigger"], true);
        assert_eq!(data["satellite"]["active_wake_words"][0], "ok_nabu");
        assert_eq!(data["satellite"]["snd_format"]["rate"], 22_050);
        assert_eq!(data["software"]["name"], env!("CARGO_PKG_NAME"));
    }
}
