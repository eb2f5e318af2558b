//! Server-Sent-Events framing.
//!
//! The decoder is restartable across arbitrary chunk boundaries: a partial
//! event stays in the internal buffer until the `\n\n` separator arrives, and
//! `flush` surfaces whatever is left so non-terminated upstreams do not lose
//! their tail. Non-`data:` lines ride through untouched so heartbeats and
//! `event:` lines survive a decode/encode round trip.

use bytes::Bytes;
use serde_json::Value;

/// Bytes buffered before committing a stream to the client, used to spot
/// inline error events that arrive with a 200 status.
pub const STREAM_ERROR_CHECK_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
	pub data: Option<String>,
	pub other_lines: Vec<String>,
}

impl SseEvent {
	pub fn from_data(data: impl Into<String>) -> Self {
		SseEvent {
			data: Some(data.into()),
			other_lines: Vec::new(),
		}
	}

	pub fn encode(&self) -> Bytes {
		let mut lines: Vec<String> = self.other_lines.clone();
		if let Some(data) = &self.data {
			for item in data.split('\n') {
				if item.is_empty() {
					lines.push("data:".to_string());
				} else {
					lines.push(format!("data: {item}"));
				}
			}
		}
		let mut text = lines.join("\n");
		text.push_str("\n\n");
		Bytes::from(text)
	}
}

#[derive(Debug, Default)]
pub struct SseDecoder {
	buffer: String,
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
		if chunk.is_empty() {
			return Vec::new();
		}
		let text = String::from_utf8_lossy(chunk)
			.replace("\r\n", "\n")
			.replace('\r', "\n");
		self.buffer.push_str(&text);

		let mut events = Vec::new();
		while let Some(sep) = self.buffer.find("\n\n") {
			let raw = self.buffer[..sep].to_string();
			self.buffer.drain(..sep + 2);
			if raw.trim().is_empty() {
				continue;
			}
			events.push(Self::parse_event(&raw));
		}
		events
	}

	/// Remaining bytes that never saw an event separator.
	pub fn flush(&mut self) -> Option<Bytes> {
		if self.buffer.is_empty() {
			return None;
		}
		Some(Bytes::from(std::mem::take(&mut self.buffer)))
	}

	fn parse_event(raw: &str) -> SseEvent {
		let mut data_lines: Vec<&str> = Vec::new();
		let mut other_lines: Vec<String> = Vec::new();
		for line in raw.split('\n') {
			if let Some(rest) = line.strip_prefix("data:") {
				data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
			} else {
				other_lines.push(line.to_string());
			}
		}
		let data = if data_lines.is_empty() {
			None
		} else {
			Some(data_lines.join("\n"))
		};
		SseEvent { data, other_lines }
	}
}

/// Scan a buffered stream prefix for an inline SSE error event.
///
/// Providers occasionally report failure as the first event of a 200 stream,
/// either as `{"type":"error","error":{...}}` or as a bare `{"error":{...}}`
/// payload. Returns a human-readable message when one is found.
pub fn detect_sse_stream_error(data: &[u8]) -> Option<String> {
	let text = String::from_utf8_lossy(data);
	for line in text.split('\n') {
		let line = line.trim();
		let Some(json_part) = line.strip_prefix("data:") else {
			continue;
		};
		let json_part = json_part.trim();
		if json_part.is_empty() || json_part == "[DONE]" {
			continue;
		}
		let Ok(parsed) = serde_json::from_str::<Value>(json_part) else {
			continue;
		};
		let Some(obj) = parsed.as_object() else {
			continue;
		};

		if obj.get("type").and_then(Value::as_str) == Some("error") {
			let error_obj = obj.get("error").and_then(Value::as_object);
			let message = error_obj
				.and_then(|e| e.get("message").and_then(Value::as_str))
				.map(str::to_string)
				.or_else(|| error_obj.map(|e| Value::Object(e.clone()).to_string()))
				.unwrap_or_else(|| "unknown error".to_string());
			let http_code = error_obj
				.and_then(|e| e.get("http_code"))
				.map(Value::to_string)
				.unwrap_or_else(|| "unknown".to_string());
			return Some(format!("SSE stream error: {message} (http_code={http_code})"));
		}

		if let Some(error_obj) = obj.get("error").and_then(Value::as_object) {
			let message = error_obj
				.get("message")
				.and_then(Value::as_str)
				.map(str::to_string)
				.unwrap_or_else(|| Value::Object(error_obj.clone()).to_string());
			let error_type = error_obj
				.get("type")
				.and_then(Value::as_str)
				.unwrap_or("unknown");
			return Some(format!("SSE stream error: {message} (type={error_type})"));
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_single_event() {
		let mut decoder = SseDecoder::new();
		let events = decoder.feed(b"data: {\"x\":1}\n\n");
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].data.as_deref(), Some("{\"x\":1}"));
		assert!(events[0].other_lines.is_empty());
	}

	#[test]
	fn decode_across_chunk_boundary() {
		let mut decoder = SseDecoder::new();
		assert!(decoder.feed(b"data: hel").is_empty());
		let events = decoder.feed(b"lo\n\ndata: world\n\n");
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].data.as_deref(), Some("hello"));
		assert_eq!(events[1].data.as_deref(), Some("world"));
	}

	#[test]
	fn decode_normalizes_crlf() {
		let mut decoder = SseDecoder::new();
		let events = decoder.feed(b"data: a\r\n\r\ndata: b\r\r");
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].data.as_deref(), Some("a"));
		assert_eq!(events[1].data.as_deref(), Some("b"));
	}

	#[test]
	fn other_lines_preserved() {
		let mut decoder = SseDecoder::new();
		let events = decoder.feed(b"event: message\n:heartbeat\ndata: hi\n\n");
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].data.as_deref(), Some("hi"));
		assert_eq!(events[0].other_lines, vec!["event: message", ":heartbeat"]);
	}

	#[test]
	fn event_without_data_has_none() {
		let mut decoder = SseDecoder::new();
		let events = decoder.feed(b":ping\n\n");
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].data, None);
		assert_eq!(events[0].other_lines, vec![":ping"]);
	}

	#[test]
	fn multi_data_lines_joined() {
		let mut decoder = SseDecoder::new();
		let events = decoder.feed(b"data: line1\ndata: line2\n\n");
		assert_eq!(events[0].data.as_deref(), Some("line1\nline2"));
	}

	#[test]
	fn flush_returns_remainder() {
		let mut decoder = SseDecoder::new();
		assert!(decoder.feed(b"data: partial").is_empty());
		assert_eq!(decoder.flush(), Some(Bytes::from("data: partial")));
		assert_eq!(decoder.flush(), None);
	}

	#[test]
	fn encode_decode_round_trip() {
		let event = SseEvent {
			data: Some("first\nsecond".to_string()),
			other_lines: vec!["event: delta".to_string()],
		};
		let encoded = event.encode();
		let mut decoder = SseDecoder::new();
		let events = decoder.feed(&encoded);
		assert_eq!(events, vec![event]);
	}

	#[test]
	fn detects_typed_error_event() {
		let data = b"data: {\"type\":\"error\",\"error\":{\"message\":\"upstream busy\",\"http_code\":503}}\n\n";
		let msg = detect_sse_stream_error(data).unwrap();
		assert!(msg.contains("upstream busy"));
		assert!(msg.contains("http_code=503"));
	}

	#[test]
	fn detects_generic_error_object() {
		let data = b"data: {\"error\":{\"message\":\"rate limited\",\"type\":\"rate_limit\"}}\n\n";
		let msg = detect_sse_stream_error(data).unwrap();
		assert!(msg.contains("rate limited"));
		assert!(msg.contains("type=rate_limit"));
	}

	#[test]
	fn ignores_done_and_normal_events() {
		let data = b"data: [DONE]\n\ndata: {\"choices\":[]}\n\n";
		assert_eq!(detect_sse_stream_error(data), None);
	}

	#[test]
	fn ignores_unparseable_partial_json() {
		let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"er";
		assert_eq!(detect_sse_stream_error(data), None);
	}
}
