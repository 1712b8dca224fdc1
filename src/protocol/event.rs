//! Wyoming wire framing
//!
//! A frame is a newline-terminated UTF-8 JSON header, optionally followed
//! by a JSON data section and a raw binary payload. The header carries
//! `type` plus `data_length` and `payload_length` giving the exact byte
//! counts of the trailing sections.
//!
//! Any framing failure is fatal for the containing connection; the owning
//! peer tears the socket down and reconnects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on a sized section, to keep a corrupt length prefix from
/// allocating unbounded memory
const MAX_SECTION_LEN: usize = 16 * 1024 * 1024;

/// A single wire event: type, optional JSON data, optional binary payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    /// Canonical event type (e.g. `audio-chunk`, `transcript`)
    pub event_type: String,

    /// Structured data section
    pub data: Option<Value>,

    /// Raw binary payload (audio samples)
    pub payload: Option<Vec<u8>>,
}

impl Event {
    /// Create an event with no data or payload
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: None,
            payload: None,
        }
    }

    /// Create an event with a data section
    #[must_use]
    pub fn with_data(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data: Some(data),
            payload: None,
        }
    }

    /// True if this is an `audio-chunk` event
    #[must_use]
    pub fn is_audio_chunk(&self) -> bool {
        self.event_type == "audio-chunk"
    }
}

/// Header line of a frame
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    event_type: String,

    /// Legacy inline data, merged with the sized data section when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,
}

/// Read one event from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
///
/// # Errors
///
/// Returns [`Error::Framing`] on a truncated header line, malformed JSON,
/// or a short read inside a sized section.
pub async fn read_event<R>(reader: &mut R) -> Result<Option<Event>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Framing(format!("header read: {e}")))?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(Error::Framing("truncated header line".to_string()));
    }

    let header: Header = serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Framing(format!("malformed header: {e}")))?;

    let mut data = header.data;
    if let Some(data_length) = header.data_length {
        check_section_len("data", data_length)?;
        let section = read_exact_section(reader, data_length, "data").await?;
        let section: Value = serde_json::from_slice(&section)
            .map_err(|e| Error::Framing(format!("malformed data section: {e}")))?;
        data = Some(match data {
            // Sized section wins key-by-key over inline data
            Some(Value::Object(mut base)) => {
                if let Value::Object(over) = section {
                    base.extend(over);
                    Value::Object(base)
                } else {
                    section
                }
            }
            _ => section,
        });
    }

    let mut payload = None;
    if let Some(payload_length) = header.payload_length {
        check_section_len("payload", payload_length)?;
        if payload_length > 0 {
            payload = Some(read_exact_section(reader, payload_length, "payload").await?);
        }
    }

    Ok(Some(Event {
        event_type: header.event_type,
        data,
        payload,
    }))
}

/// Write one event to the stream and flush it.
///
/// The header's `data_length` and `payload_length` are set to the actual
/// serialized sizes; absent sections are omitted.
///
/// # Errors
///
/// Returns [`Error::Transport`] on a write failure.
pub async fn write_event<W>(writer: &mut W, event: &Event) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data_bytes = match &event.data {
        Some(data) => Some(serde_json::to_vec(data)?),
        None => None,
    };

    let header = Header {
        event_type: event.event_type.clone(),
        data: None,
        data_length: data_bytes.as_ref().map(Vec::len),
        payload_length: event.payload.as_ref().map(Vec::len),
    };

    let mut frame = serde_json::to_vec(&header)?;
    frame.push(b'\n');
    if let Some(data_bytes) = &data_bytes {
        frame.extend_from_slice(data_bytes);
    }
    if let Some(payload) = &event.payload {
        frame.extend_from_slice(payload);
    }

    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Transport(format!("event write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("event flush: {e}")))?;

    Ok(())
}

fn check_section_len(section: &str, len: usize) -> Result<()> {
    if len > MAX_SECTION_LEN {
        return Err(Error::Framing(format!(
            "{section} section of {len} bytes exceeds limit"
        )));
    }
    Ok(())
}

async fn read_exact_section<R>(reader: &mut R, len: usize, section: &str) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Framing(format!("short read in {section} section: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;
    use tokio::io::BufReader;

    use super::*;

    async fn roundtrip(event: &Event) -> Event {
        let mut encoded = Vec::new();
        write_event(&mut encoded, event).await.unwrap();
        let mut reader = BufReader::new(Cursor::new(encoded));
        read_event(&mut reader).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn roundtrip_header_only() {
        let event = Event::new("describe");
        assert_eq!(roundtrip(&event).await, event);
    }

    #[tokio::test]
    async fn roundtrip_with_data() {
        let event = Event::with_data("transcript", json!({"text": "hello world"}));
        assert_eq!(roundtrip(&event).await, event);
    }

    #[tokio::test]
    async fn roundtrip_with_data_and_payload() {
        let event = Event {
            event_type: "audio-chunk".to_string(),
            data: Some(json!({"rate": 16000, "width": 2, "channels": 1})),
            payload: Some(vec![0x01, 0x02, 0x03, 0xff]),
        };
        assert_eq!(roundtrip(&event).await, event);
    }

    #[tokio::test]
    async fn encode_decode_encode_is_stable() {
        let event = Event {
            event_type: "audio-chunk".to_string(),
            data: Some(json!({"rate": 16000})),
            payload: Some(vec![7u8; 64]),
        };

        let mut first = Vec::new();
        write_event(&mut first, &event).await.unwrap();

        let mut reader = BufReader::new(Cursor::new(first.clone()));
        let decoded = read_event(&mut reader).await.unwrap().unwrap();

        let mut second = Vec::new();
        write_event(&mut second, &decoded).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_event(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_framing_error() {
        let mut reader = BufReader::new(Cursor::new(b"{\"type\": \"ping\"".to_vec()));
        let err = read_event(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_json_is_framing_error() {
        let mut reader = BufReader::new(Cursor::new(b"not json\n".to_vec()));
        let err = read_event(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)), "{err}");
    }

    #[tokio::test]
    async fn short_payload_is_framing_error() {
        let mut encoded = Vec::new();
        let event = Event {
            event_type: "audio-chunk".to_string(),
            data: None,
            payload: Some(vec![1, 2, 3, 4]),
        };
        write_event(&mut encoded, &event).await.unwrap();
        encoded.truncate(encoded.len() - 2);

        let mut reader = BufReader::new(Cursor::new(encoded));
        let err = read_event(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)), "{err}");
    }

    #[tokio::test]
    async fn oversized_section_is_rejected() {
        let header = format!(
            "{{\"type\": \"audio-chunk\", \"payload_length\": {}}}\n",
            MAX_SECTION_LEN + 1
        );
        let mut reader = BufReader::new(Cursor::new(header.into_bytes()));
        let err = read_event(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)), "{err}");
    }

    #[tokio::test]
    async fn inline_data_is_merged_under_sized_section() {
        let header = json!({
            "type": "transcript",
            "data": {"text": "old", "language": "en"},
            "data_length": 14,
        });
        let mut encoded = serde_json::to_vec(&header).unwrap();
        encoded.push(b'\n');
        encoded.extend_from_slice(br#"{"text":"new"}"#);

        let mut reader = BufReader::new(Cursor::new(encoded));
        let event = read_event(&mut reader).await.unwrap().unwrap();
        let data = event.data.unwrap();
        assert_eq!(data["text"], "new");
        assert_eq!(data["language"], "en");
    }

    #[tokio::test]
    async fn consecutive_events_preserve_boundaries() {
        let first = Event::with_data("ping", json!({"text": "a"}));
        let second = Event {
            event_type: "audio-chunk".to_string(),
            data: Some(json!({"rate": 22050})),
            payload: Some(vec![9u8; 10]),
        };

        let mut encoded = Vec::new();
        write_event(&mut encoded, &first).await.unwrap();
        write_event(&mut encoded, &second).await.unwrap();

        let mut reader = BufReader::new(Cursor::new(encoded));
        assert_eq!(read_event(&mut reader).await.unwrap().unwrap(), first);
        assert_eq!(read_event(&mut reader).await.unwrap().unwrap(), second);
        assert!(read_event(&mut reader).await.unwrap().is_none());
    }
}
