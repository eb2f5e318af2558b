//! Response parser pipeline.
//!
//! An ordered chain of transforms applied to backend responses, either once
//! over a buffered JSON body or per-event over a live SSE stream. Pipelines
//! are stateless and shared; per-request stream state lives in
//! [`stream::ResponseStreamParser`], owned by the transport for the lifetime
//! of one upstream relay.

mod parse_tags;
mod reasoning;
pub mod stream;
pub mod tags;

use std::collections::HashMap;
use std::sync::Arc;

pub use parse_tags::{ParseTagsParser, ParseTagsStreamState};
pub use reasoning::{ReasoningSwapParser, ReasoningSwapStreamState};
use serde_json::Value;
pub use stream::ResponseStreamParser;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct ParserContext {
	pub path: String,
	pub model: String,
	pub backend: String,
	pub is_stream: bool,
}

/// Per-choice stream state, allocated by the matching parser.
#[derive(Debug)]
pub enum StreamState {
	ParseTags(ParseTagsStreamState),
	ReasoningSwap(ReasoningSwapStreamState),
}

#[derive(Debug)]
pub enum ResponseParser {
	ParseTags(ParseTagsParser),
	ReasoningSwap(ReasoningSwapParser),
}

impl ResponseParser {
	pub fn name(&self) -> &'static str {
		match self {
			ResponseParser::ParseTags(_) => "parse_tags",
			ResponseParser::ReasoningSwap(_) => "swap_reasoning_content",
		}
	}

	pub fn apply_response(&self, payload: &mut Value) {
		match self {
			ResponseParser::ParseTags(p) => p.apply_response(payload),
			ResponseParser::ReasoningSwap(p) => p.apply_response(payload),
		}
	}

	pub fn create_stream_state(&self) -> StreamState {
		match self {
			ResponseParser::ParseTags(_) => StreamState::ParseTags(ParseTagsStreamState::default()),
			ResponseParser::ReasoningSwap(_) => {
				StreamState::ReasoningSwap(ReasoningSwapStreamState::default())
			},
		}
	}

	pub fn apply_stream_event(&self, event: &mut Value, state: &mut StreamState) {
		match (self, state) {
			(ResponseParser::ParseTags(p), StreamState::ParseTags(s)) => p.apply_stream_event(event, s),
			(ResponseParser::ReasoningSwap(p), StreamState::ReasoningSwap(s)) => {
				p.apply_stream_event(event, s)
			},
			_ => unreachable!("stream state allocated by a different parser"),
		}
	}

	pub fn finalize_stream(&self, state: &mut StreamState) -> Vec<Value> {
		match (self, state) {
			(ResponseParser::ParseTags(p), StreamState::ParseTags(s)) => p.finalize_stream(s),
			(ResponseParser::ReasoningSwap(p), StreamState::ReasoningSwap(s)) => p.finalize_stream(s),
			_ => unreachable!("stream state allocated by a different parser"),
		}
	}
}

#[derive(Debug, Default)]
pub struct ResponseParserPipeline {
	pub parsers: Vec<ResponseParser>,
	pub paths: Vec<String>,
}

impl ResponseParserPipeline {
	pub fn applies(&self, ctx: &ParserContext) -> bool {
		if self.parsers.is_empty() {
			return false;
		}
		if self.paths.is_empty() {
			return true;
		}
		self.paths.iter().any(|p| ctx.path.contains(p))
	}

	/// Run the buffered chain. Returns `None` when the pipeline does not
	/// apply or the body is not a JSON object, in which case the caller
	/// forwards the original bytes.
	pub fn transform_response_body(
		&self,
		body: &[u8],
		content_type: Option<&str>,
		ctx: &ParserContext,
	) -> Option<Vec<u8>> {
		if !self.applies(ctx) {
			return None;
		}
		let content_type = content_type?;
		if !content_type.to_ascii_lowercase().contains("application/json") {
			return None;
		}
		let mut payload: Value = serde_json::from_slice(body).ok()?;
		if !payload.is_object() {
			return None;
		}
		for parser in &self.parsers {
			parser.apply_response(&mut payload);
		}
		serde_json::to_vec(&payload).ok()
	}

	pub fn create_stream_parser(
		self: &Arc<Self>,
		ctx: &ParserContext,
	) -> Option<ResponseStreamParser> {
		if !self.applies(ctx) {
			return None;
		}
		Some(ResponseStreamParser::new(self.clone(), ctx.clone()))
	}
}

/// Truthiness rules for loosely-typed config values ("1", "true", "yes", "on").
pub(crate) fn config_bool(value: Option<&Value>, default: bool) -> bool {
	match value {
		None | Some(Value::Null) => default,
		Some(Value::Bool(b)) => *b,
		Some(Value::String(s)) => {
			matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
		},
		Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
		Some(_) => default,
	}
}

pub(crate) fn config_str<'a>(value: Option<&'a Value>, default: &'a str) -> &'a str {
	match value.and_then(Value::as_str) {
		Some(s) if !s.is_empty() => s,
		_ => default,
	}
}

fn string_list(value: Option<&Value>) -> Vec<String> {
	match value {
		None | Some(Value::Null) => Vec::new(),
		Some(Value::Array(items)) => items
			.iter()
			.filter_map(|v| v.as_str().map(str::to_string))
			.collect(),
		Some(Value::String(s)) => vec![s.clone()],
		Some(other) => vec![other.to_string()],
	}
}

const DEFAULT_PARSER_PATH: &str = "/chat/completions";

/// Build a pipeline from a `parsers` config block.
pub fn build_pipeline(
	cfg: Option<&Value>,
	enabled_default: bool,
	default_paths: &[&str],
) -> ResponseParserPipeline {
	let Some(cfg) = cfg.and_then(Value::as_object) else {
		return ResponseParserPipeline::default();
	};
	let enabled = config_bool(cfg.get("enabled"), enabled_default);
	if !enabled {
		return ResponseParserPipeline::default();
	}
	let names = string_list(cfg.get("response"));
	if names.is_empty() {
		return ResponseParserPipeline::default();
	}

	let mut parsers: Vec<ResponseParser> = Vec::new();
	for name in &names {
		let parser_cfg = cfg.get(name.as_str());
		let parser = match name.as_str() {
			"parse_tags" | "parse_unparsed" | "parse_unparsed_tags" => {
				ResponseParser::ParseTags(ParseTagsParser::new(parser_cfg))
			},
			"swap_reasoning_content" | "swap_reasoning" => {
				ResponseParser::ReasoningSwap(ReasoningSwapParser::new(parser_cfg))
			},
			other => {
				warn!(parser = other, "unknown response parser configured; skipping");
				continue;
			},
		};
		parsers.push(parser);
	}

	// parse_tags must see raw content before the swap rewrites it.
	let parse_idx = parsers.iter().position(|p| p.name() == "parse_tags");
	let swap_idx = parsers
		.iter()
		.position(|p| p.name() == "swap_reasoning_content");
	if let (Some(parse_idx), Some(swap_idx)) = (parse_idx, swap_idx)
		&& swap_idx < parse_idx
	{
		let swap = parsers.remove(swap_idx);
		parsers.insert(parse_idx, swap);
		info!("reordered response parsers to run parse_tags before swap_reasoning_content");
	}

	let mut paths = string_list(cfg.get("paths"));
	if paths.is_empty() {
		paths = default_paths.iter().map(|s| s.to_string()).collect();
	}
	ResponseParserPipeline { parsers, paths }
}

/// The global pipeline from `proxy_settings.parsers` (off unless enabled).
pub fn global_pipeline(config: &Config) -> ResponseParserPipeline {
	build_pipeline(
		config.proxy_settings.parsers.as_ref(),
		false,
		&[DEFAULT_PARSER_PATH],
	)
}

/// Per-backend pipelines from each model entry's `parsers` block; these
/// replace the global pipeline for that backend's traffic.
pub fn backend_overrides(config: &Config) -> HashMap<String, Arc<ResponseParserPipeline>> {
	let mut overrides = HashMap::new();
	for entry in &config.model_list {
		let Some(cfg) = entry.parsers.as_ref() else {
			continue;
		};
		let pipeline = build_pipeline(Some(cfg), true, &[DEFAULT_PARSER_PATH]);
		overrides.insert(entry.model_name.clone(), Arc::new(pipeline));
	}
	overrides
}
