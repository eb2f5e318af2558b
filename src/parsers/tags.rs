//! Incremental extraction of `<think>` and `<tool_call>` blocks from
//! assistant content.
//!
//! The scanner is a single-pass state machine that must be restartable across
//! arbitrary chunk boundaries: anything that could still legally become a tag
//! is held in the carry buffer and not emitted downstream until it is
//! disambiguated.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

static ARG_PAIR_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?s)<arg_key>(.*?)</arg_key>\s*<arg_value>(.*?)</arg_value>").expect("valid regex")
});

pub const K2_SECTION_OPEN: &str = "<|tool_calls_section_begin|>";
pub const K2_SECTION_CLOSE: &str = "<|tool_calls_section_end|>";
pub const K2_CALL_OPEN: &str = "<|tool_call_begin|>";
pub const K2_CALL_CLOSE: &str = "<|tool_call_end|>";
pub const K2_ARG_OPEN: &str = "<|tool_call_argument_begin|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolFormat {
	#[default]
	Xml,
	K2,
}

impl ToolFormat {
	pub fn parse(raw: Option<&str>) -> ToolFormat {
		match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
			Some("k2") => ToolFormat::K2,
			_ => ToolFormat::Xml,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
	pub name: String,
	pub arguments: Value,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagScanResult {
	pub content: String,
	pub reasoning: String,
	pub tool_calls: Vec<ParsedToolCall>,
}

impl TagScanResult {
	pub fn is_empty(&self) -> bool {
		self.content.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
	Text,
	Think,
	Tool,
}

#[derive(Debug)]
pub struct TagScanner {
	parse_thinking: bool,
	parse_tool_calls: bool,
	format: ToolFormat,
	think_open: String,
	think_close: String,
	tool_open: String,
	tool_close: String,
	open_tags: Vec<String>,
	mode: Mode,
	buffer: String,
	tool_buffer: String,
}

impl TagScanner {
	pub fn new(
		think_tag: &str,
		tool_tag: &str,
		parse_thinking: bool,
		parse_tool_calls: bool,
		format: ToolFormat,
	) -> Self {
		let think_open = format!("<{think_tag}>");
		let think_close = format!("</{think_tag}>");
		let (tool_open, tool_close) = match format {
			ToolFormat::Xml => (format!("<{tool_tag}>"), format!("</{tool_tag}>")),
			ToolFormat::K2 => (K2_SECTION_OPEN.to_string(), K2_SECTION_CLOSE.to_string()),
		};
		let mut open_tags = Vec::new();
		if parse_thinking {
			open_tags.push(think_open.clone());
		}
		if parse_tool_calls {
			open_tags.push(tool_open.clone());
		}
		TagScanner {
			parse_thinking,
			parse_tool_calls,
			format,
			think_open,
			think_close,
			tool_open,
			tool_close,
			open_tags,
			mode: Mode::Text,
			buffer: String::new(),
			tool_buffer: String::new(),
		}
	}

	pub fn feed(&mut self, text: &str) -> TagScanResult {
		if text.is_empty() {
			return TagScanResult::default();
		}
		self.buffer.push_str(text);
		let mut out = TagScanResult::default();

		while !self.buffer.is_empty() {
			match self.mode {
				Mode::Text => {
					let Some(idx) = self.buffer.find('<') else {
						out.content.push_str(&self.buffer);
						self.buffer.clear();
						break;
					};
					if idx > 0 {
						out.content.push_str(&self.buffer[..idx]);
						self.buffer.drain(..idx);
					}
					if self.parse_thinking && self.buffer.starts_with(&self.think_open) {
						self.buffer.drain(..self.think_open.len());
						self.mode = Mode::Think;
						continue;
					}
					if self.parse_tool_calls && self.buffer.starts_with(&self.tool_open) {
						self.buffer.drain(..self.tool_open.len());
						self.tool_buffer.clear();
						self.mode = Mode::Tool;
						continue;
					}
					// A prefix of an open tag may still complete on the next feed.
					if self.open_tags.iter().any(|tag| tag.starts_with(self.buffer.as_str())) {
						break;
					}
					out.content.push('<');
					self.buffer.drain(..1);
				},
				Mode::Think => {
					let Some(idx) = self.buffer.find(&self.think_close) else {
						let tail = split_tail_for_prefix(&mut self.buffer, &self.think_close);
						out.reasoning.push_str(&self.buffer);
						self.buffer = tail;
						break;
					};
					out.reasoning.push_str(&self.buffer[..idx]);
					self.buffer.drain(..idx + self.think_close.len());
					self.mode = Mode::Text;
				},
				Mode::Tool => {
					let Some(idx) = self.buffer.find(&self.tool_close) else {
						let tail = split_tail_for_prefix(&mut self.buffer, &self.tool_close);
						self.tool_buffer.push_str(&self.buffer);
						self.buffer = tail;
						break;
					};
					self.tool_buffer.push_str(&self.buffer[..idx]);
					self.buffer.drain(..idx + self.tool_close.len());
					let parsed = match self.format {
						ToolFormat::Xml => parse_tool_call_block(&self.tool_buffer)
							.map(|c| vec![c])
							.unwrap_or_default(),
						ToolFormat::K2 => parse_k2_section(&self.tool_buffer),
					};
					if parsed.is_empty() {
						// Not a tool call after all; re-emit the raw block.
						out.content.push_str(&self.tool_open);
						out.content.push_str(&self.tool_buffer);
						out.content.push_str(&self.tool_close);
					} else {
						out.tool_calls.extend(parsed);
					}
					self.tool_buffer.clear();
					self.mode = Mode::Text;
				},
			}
		}
		out
	}

	/// Emit any buffered leftovers, assuming an unterminated tag was not a tag.
	pub fn flush(&mut self) -> TagScanResult {
		let mut out = TagScanResult::default();
		match self.mode {
			Mode::Text => out.content = std::mem::take(&mut self.buffer),
			Mode::Think => out.reasoning = std::mem::take(&mut self.buffer),
			Mode::Tool => {
				out.content =
					format!("{}{}{}", self.tool_open, self.tool_buffer, self.buffer);
			},
		}
		self.buffer.clear();
		self.tool_buffer.clear();
		self.mode = Mode::Text;
		out
	}
}

/// Split off the longest trailing proper prefix of `tag` from `text`,
/// returning the tail. Tags are ASCII so byte-truncation is safe.
fn split_tail_for_prefix(text: &mut String, tag: &str) -> String {
	let max_len = (tag.len() - 1).min(text.len());
	let mut keep = 0;
	for i in 1..=max_len {
		if !text.is_char_boundary(text.len() - i) {
			continue;
		}
		if text.ends_with(&tag[..i]) {
			keep = i;
		}
	}
	if keep == 0 {
		return String::new();
	}
	text.split_off(text.len() - keep)
}

/// Parse the body of an XML tool block: the first token is the tool name, the
/// remainder carries `<arg_key>..</arg_key><arg_value>..</arg_value>` pairs.
pub fn parse_tool_call_block(text: &str) -> Option<ParsedToolCall> {
	let stripped = text.trim();
	if stripped.is_empty() {
		return None;
	}
	let (name, args) = match stripped.find("<arg_key>") {
		None => {
			let name = stripped.split_whitespace().next().unwrap_or("");
			(name.to_string(), Map::new())
		},
		Some(arg_start) => {
			let name = stripped[..arg_start].trim().to_string();
			let mut args = Map::new();
			for capture in ARG_PAIR_RE.captures_iter(&stripped[arg_start..]) {
				let key = capture[1].trim();
				if key.is_empty() {
					continue;
				}
				args.insert(key.to_string(), maybe_json(capture[2].trim()));
			}
			(name, args)
		},
	};
	if name.is_empty() {
		return None;
	}
	Some(ParsedToolCall {
		name,
		arguments: Value::Object(args),
	})
}

/// Parse a K2 tool-call section. Each call is
/// `<|tool_call_begin|>name<|tool_call_argument_begin|>json<|tool_call_end|>`
/// and names of the form `functions.lookup:0` keep only the function part.
pub(crate) fn parse_k2_section(section: &str) -> Vec<ParsedToolCall> {
	let mut calls = Vec::new();
	let mut rest = section;
	while let Some(start) = rest.find(K2_CALL_OPEN) {
		rest = &rest[start + K2_CALL_OPEN.len()..];
		let Some(end) = rest.find(K2_CALL_CLOSE) else {
			break;
		};
		let body = &rest[..end];
		rest = &rest[end + K2_CALL_CLOSE.len()..];

		let (raw_name, raw_args) = match body.find(K2_ARG_OPEN) {
			Some(idx) => (&body[..idx], &body[idx + K2_ARG_OPEN.len()..]),
			None => (body, ""),
		};
		let name = k2_function_name(raw_name.trim());
		if name.is_empty() {
			continue;
		}
		let arguments = if raw_args.trim().is_empty() {
			json!({})
		} else {
			maybe_json(raw_args.trim())
		};
		calls.push(ParsedToolCall { name, arguments });
	}
	calls
}

fn k2_function_name(raw: &str) -> String {
	let without_index = raw.rsplit_once(':').map_or(raw, |(head, tail)| {
		if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
			head
		} else {
			raw
		}
	});
	without_index
		.strip_prefix("functions.")
		.unwrap_or(without_index)
		.to_string()
}

fn maybe_json(value: &str) -> Value {
	serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}
