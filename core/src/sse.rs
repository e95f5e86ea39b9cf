//! Incremental decoder for the line-oriented push-stream format.
//!
//! Frames are built from `id:`, `event:` and one or more `data:` lines and
//! dispatched on a blank line. Chunks may split lines (and UTF-8 sequences)
//! anywhere; the decoder buffers raw bytes until a full line is available.

use crate::envelope::{EventType, StreamEnvelope};

/// One dispatched frame, before its data is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drop any partially received frame, e.g. before reconnecting.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.id = None;
        self.event = None;
        self.data.clear();
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // `retry:` and unknown fields are ignored.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.id = None;
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseFrame {
            id: self.id.take(),
            event: self.event.take(),
            data,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamParseError {
    #[error("frame {id:?} carried invalid envelope JSON: {source}")]
    InvalidJson {
        id: Option<String>,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame declared event `{declared}` but envelope is `{actual}`")]
    EventMismatch { declared: String, actual: EventType },
}

/// Interpret a frame's data as a [`StreamEnvelope`].
pub fn parse_envelope(frame: &SseFrame) -> Result<StreamEnvelope, StreamParseError> {
    let envelope: StreamEnvelope =
        serde_json::from_str(&frame.data).map_err(|source| StreamParseError::InvalidJson {
            id: frame.id.clone(),
            source,
        })?;
    if let Some(declared) = frame.event.as_deref() {
        if declared != "message" && declared != envelope.event_type.as_str() {
            return Err(StreamParseError::EventMismatch {
                declared: declared.to_string(),
                actual: envelope.event_type,
            });
        }
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopePayload;
    use crate::model::AgentStatus;
    use crate::model::fixtures::session;

    #[test]
    fn decodes_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"id: 4\nev").is_empty());
        assert!(decoder.push(b"ent: heartbeat\r\ndata: {\"a\"").is_empty());
        let frames = decoder.push(b":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                id: Some("4".to_string()),
                event: Some("heartbeat".to_string()),
                data: "{\"a\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn joins_repeated_data_lines_with_newline() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: first\ndata:second\ndata\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "first\nsecond\n");
        assert_eq!(frames[0].id, None);
    }

    #[test]
    fn ignores_comments_retry_and_empty_dispatch() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\nretry: 3000\n\nevent: snapshot\n\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        // The `event:` before an empty dispatch does not leak into the next frame.
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn multibyte_characters_survive_chunk_split() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;
        assert!(decoder.push(&bytes[..split]).is_empty());
        let frames = decoder.push(&bytes[split..]);
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[test]
    fn parse_envelope_reports_bad_json_without_poisoning_decoder() {
        let mut decoder = SseDecoder::new();
        let envelope = StreamEnvelope::new(
            3,
            "test",
            &EnvelopePayload::Session(session("s1", AgentStatus::Busy, 0)),
        )
        .expect("envelope builds");
        let good = serde_json::to_string(&envelope).expect("serializes");
        let stream = format!(
            "id: 2\nevent: agents.session.upserted\ndata: {{not json\n\nid: 3\nevent: agents.session.upserted\ndata: {good}\n\n"
        );
        let frames = decoder.push(stream.as_bytes());
        assert_eq!(frames.len(), 2);

        let err = parse_envelope(&frames[0]).expect_err("malformed data is an error");
        assert!(matches!(err, StreamParseError::InvalidJson { id: Some(ref id), .. } if id == "2"));
        let parsed = parse_envelope(&frames[1]).expect("valid frame parses");
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn parse_envelope_rejects_event_name_mismatch() {
        let envelope = StreamEnvelope::new(
            1,
            "test",
            &EnvelopePayload::Session(session("s1", AgentStatus::Busy, 0)),
        )
        .expect("envelope builds");
        let frame = SseFrame {
            id: None,
            event: Some("qa.handoff.upserted".to_string()),
            data: serde_json::to_string(&envelope).expect("serializes"),
        };
        assert!(matches!(
            parse_envelope(&frame),
            Err(StreamParseError::EventMismatch { .. })
        ));
    }
}
