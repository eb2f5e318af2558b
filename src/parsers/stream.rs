//! Per-request stream evaluation of a parser pipeline.
//!
//! Wraps the raw upstream byte stream with the SSE codec, runs each data
//! event through every parser (each with its own per-choice state), and
//! re-encodes. `[DONE]` flushes finalisation events from each parser before
//! being forwarded; synthesised tail events inherit the most recent envelope
//! so clients see a consistent id/model/created.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};

use super::{ParserContext, ResponseParserPipeline, StreamState};
use crate::sse::{SseDecoder, SseEvent};

pub struct ResponseStreamParser {
	pipeline: Arc<ResponseParserPipeline>,
	decoder: SseDecoder,
	states: Vec<StreamState>,
	last_envelope: Option<Map<String, Value>>,
	saw_done: bool,
	// Context is carried for request-scoped tracing, not dispatch.
	#[allow(dead_code)]
	ctx: ParserContext,
}

impl ResponseStreamParser {
	pub fn new(pipeline: Arc<ResponseParserPipeline>, ctx: ParserContext) -> Self {
		let states = pipeline
			.parsers
			.iter()
			.map(|p| p.create_stream_state())
			.collect();
		ResponseStreamParser {
			pipeline,
			decoder: SseDecoder::new(),
			states,
			last_envelope: None,
			saw_done: false,
			ctx,
		}
	}

	pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<Bytes> {
		let mut output = Vec::new();
		for event in self.decoder.feed(chunk) {
			output.extend(self.process_event(event));
		}
		output
	}

	/// Emit finalisation events (when the upstream never sent `[DONE]`) and
	/// any non-terminated decoder residue.
	pub fn finish(&mut self) -> Vec<Bytes> {
		let mut output = Vec::new();
		if !self.saw_done {
			for event in self.finalize_events() {
				output.push(encode_json_event(&event));
			}
		}
		if let Some(leftover) = self.decoder.flush() {
			output.push(leftover);
		}
		output
	}

	fn process_event(&mut self, mut event: SseEvent) -> Vec<Bytes> {
		let Some(data) = event.data.clone() else {
			return vec![event.encode()];
		};
		if data.trim() == "[DONE]" {
			self.saw_done = true;
			let mut output: Vec<Bytes> = self
				.finalize_events()
				.iter()
				.map(encode_json_event)
				.collect();
			output.push(event.encode());
			return output;
		}

		let Ok(mut payload) = serde_json::from_str::<Value>(&data) else {
			return vec![event.encode()];
		};
		if !payload.is_object() {
			return vec![event.encode()];
		}

		for (parser, state) in self.pipeline.parsers.iter().zip(self.states.iter_mut()) {
			parser.apply_stream_event(&mut payload, state);
		}

		if let Some(obj) = payload.as_object() {
			let mut envelope = obj.clone();
			envelope.remove("choices");
			self.last_envelope = Some(envelope);
		}
		event.data = Some(payload.to_string());
		vec![event.encode()]
	}

	fn finalize_events(&mut self) -> Vec<Value> {
		let mut extras = Vec::new();
		for idx in 0..self.pipeline.parsers.len() {
			let emitted = self.pipeline.parsers[idx].finalize_stream(&mut self.states[idx]);
			for mut event in emitted {
				// Later parsers still get to see events synthesised by
				// earlier ones.
				for later in idx + 1..self.pipeline.parsers.len() {
					self.pipeline.parsers[later].apply_stream_event(&mut event, &mut self.states[later]);
				}
				extras.push(event);
			}
		}
		extras
			.into_iter()
			.map(|event| self.merge_envelope(event))
			.collect()
	}

	fn merge_envelope(&self, event: Value) -> Value {
		let Some(envelope) = &self.last_envelope else {
			return event;
		};
		let Value::Object(event_obj) = event else {
			return event;
		};
		let mut merged = envelope.clone();
		merged.extend(event_obj);
		Value::Object(merged)
	}
}

fn encode_json_event(event: &Value) -> Bytes {
	SseEvent::from_data(event.to_string()).encode()
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::parsers::build_pipeline;

	fn parse_tags_pipeline() -> Arc<ResponseParserPipeline> {
		Arc::new(build_pipeline(
			Some(&json!({"enabled": true, "response": ["parse_tags"]})),
			false,
			&["/chat/completions"],
		))
	}

	fn ctx(is_stream: bool) -> ParserContext {
		ParserContext {
			path: "/v1/chat/completions".to_string(),
			model: "alpha".to_string(),
			backend: "alpha".to_string(),
			is_stream,
		}
	}

	fn sse_chunk(payload: Value) -> Vec<u8> {
		format!("data: {payload}\n\n").into_bytes()
	}

	fn collect_data_events(chunks: &[Bytes]) -> Vec<Value> {
		let mut decoder = SseDecoder::new();
		let mut events = Vec::new();
		for chunk in chunks {
			for event in decoder.feed(chunk) {
				if let Some(data) = event.data {
					if data.trim() == "[DONE]" {
						continue;
					}
					events.push(serde_json::from_str(&data).unwrap());
				}
			}
		}
		events
	}

	#[test]
	fn stream_parity_with_buffered_extraction() {
		let pipeline = parse_tags_pipeline();
		let full = "<think>Reasoning.</think>Answer.";

		// Streamed through every possible chunking of three events.
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		let mut out = Vec::new();
		for piece in ["<think>Reas", "oning.</think>", "Answer."] {
			let event = json!({"id": "c1", "model": "m", "choices": [{"index": 0, "delta": {"content": piece}}]});
			out.extend(parser.feed_bytes(&sse_chunk(event)));
		}
		out.extend(parser.feed_bytes(b"data: [DONE]\n\n"));
		out.extend(parser.finish());

		let events = collect_data_events(&out);
		let mut reasoning = String::new();
		let mut content = String::new();
		for event in &events {
			let delta = &event["choices"][0]["delta"];
			if let Some(r) = delta.get("reasoning_content").and_then(Value::as_str) {
				reasoning.push_str(r);
			}
			if let Some(c) = delta.get("content").and_then(Value::as_str) {
				content.push_str(c);
			}
		}
		assert_eq!(reasoning, "Reasoning.");
		assert_eq!(content, "Answer.");

		// Buffered path over the same raw content agrees.
		let body = json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": full}}]});
		let transformed = pipeline
			.transform_response_body(
				&serde_json::to_vec(&body).unwrap(),
				Some("application/json"),
				&ctx(false),
			)
			.unwrap();
		let parsed: Value = serde_json::from_slice(&transformed).unwrap();
		assert_eq!(parsed["choices"][0]["message"]["reasoning_content"], "Reasoning.");
		assert_eq!(parsed["choices"][0]["message"]["content"], "Answer.");
	}

	#[test]
	fn done_before_any_data_forwarded_unchanged() {
		let pipeline = parse_tags_pipeline();
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		let out = parser.feed_bytes(b"data: [DONE]\n\n");
		assert_eq!(out.len(), 1);
		assert_eq!(&out[0][..], b"data: [DONE]\n\n");
		assert!(parser.finish().is_empty());
	}

	#[test]
	fn non_json_data_forwarded_unchanged() {
		let pipeline = parse_tags_pipeline();
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		let out = parser.feed_bytes(b"data: not json\n\n");
		assert_eq!(&out[0][..], b"data: not json\n\n");
	}

	#[test]
	fn zero_byte_chunks_are_noops() {
		let pipeline = parse_tags_pipeline();
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		assert!(parser.feed_bytes(b"").is_empty());
	}

	#[test]
	fn finalize_event_inherits_envelope() {
		let pipeline = parse_tags_pipeline();
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		let event = json!({
			"id": "chatcmpl-9",
			"model": "alpha-8b",
			"created": 1700000000,
			"choices": [{"index": 0, "delta": {"content": "tail<thin"}}],
		});
		let _ = parser.feed_bytes(&sse_chunk(event));
		let out = parser.finish();
		let events = collect_data_events(&out);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0]["id"], "chatcmpl-9");
		assert_eq!(events[0]["model"], "alpha-8b");
		assert_eq!(events[0]["created"], 1700000000);
		assert_eq!(events[0]["choices"][0]["delta"]["content"], "<thin");
	}

	#[test]
	fn heartbeat_lines_preserved() {
		let pipeline = parse_tags_pipeline();
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		let out = parser.feed_bytes(b":heartbeat\n\n");
		assert_eq!(&out[0][..], b":heartbeat\n\n");
	}

	#[test]
	fn decoder_residue_surfaced_on_finish() {
		let pipeline = parse_tags_pipeline();
		let mut parser = pipeline.create_stream_parser(&ctx(true)).unwrap();
		let _ = parser.feed_bytes(b"data: {\"choices\":[]}\n\n");
		let _ = parser.feed_bytes(b"data: trailing-with-no-separator");
		let out = parser.finish();
		assert!(
			out.iter()
				.any(|b| b.as_ref() == b"data: trailing-with-no-separator")
		);
	}
}
