//! Extraction of reasoning and tool calls embedded in raw assistant content.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use super::tags::{ParsedToolCall, TagScanner, ToolFormat};
use super::{config_bool, config_str};

#[derive(Debug)]
pub struct ParseTagsParser {
	parse_thinking: bool,
	parse_tool_calls: bool,
	think_tag: String,
	tool_tag: String,
	tool_format: ToolFormat,
}

#[derive(Debug)]
pub struct ChoiceTagState {
	scanner: TagScanner,
	next_tool_index: usize,
	saw_tool_calls: bool,
}

#[derive(Debug, Default)]
pub struct ParseTagsStreamState {
	choices: BTreeMap<i64, ChoiceTagState>,
}

impl ParseTagsParser {
	pub fn new(config: Option<&Value>) -> Self {
		let cfg = config.and_then(Value::as_object);
		let get = |key: &str| cfg.and_then(|c| c.get(key));
		ParseTagsParser {
			parse_thinking: config_bool(get("parse_thinking"), true),
			parse_tool_calls: config_bool(get("parse_tool_calls"), true),
			think_tag: config_str(get("think_tag"), "think").to_string(),
			tool_tag: config_str(get("tool_tag"), "tool_call").to_string(),
			tool_format: ToolFormat::parse(get("tool_format").and_then(Value::as_str)),
		}
	}

	fn new_scanner(&self) -> TagScanner {
		TagScanner::new(
			&self.think_tag,
			&self.tool_tag,
			self.parse_thinking,
			self.parse_tool_calls,
			self.tool_format,
		)
	}

	pub fn apply_response(&self, payload: &mut Value) {
		let Some(choices) = payload.get_mut("choices").and_then(Value::as_array_mut) else {
			return;
		};
		for choice in choices {
			let choice_index = choice.get("index").and_then(Value::as_i64).unwrap_or(0);
			let (mut content, has_reasoning, has_tools) = {
				let Some(message) = choice.get("message").and_then(Value::as_object) else {
					continue;
				};
				if !is_assistant(message) {
					continue;
				}
				let Some(content) = message.get("content").and_then(Value::as_str) else {
					continue;
				};
				if content.is_empty() {
					continue;
				}
				(
					content.to_string(),
					has_text(message.get("reasoning_content")),
					has_items(message.get("tool_calls")),
				)
			};

			let mut reasoning: Option<String> = None;
			if self.parse_thinking && !has_reasoning {
				if let Some((extracted, remaining)) = extract_think_block(&content, &self.think_tag) {
					reasoning = Some(extracted);
					content = remaining;
				}
			}

			let mut tool_calls: Vec<ParsedToolCall> = Vec::new();
			if self.parse_tool_calls && !has_tools {
				let (extracted, remaining) =
					extract_tool_calls(&content, &self.tool_tag, self.tool_format);
				tool_calls = extracted;
				content = remaining;
			}

			{
				let message = choice
					.get_mut("message")
					.and_then(Value::as_object_mut)
					.expect("message checked above");
				if let Some(reasoning) = reasoning {
					message.insert("reasoning_content".to_string(), Value::String(reasoning));
				}
				if !tool_calls.is_empty() {
					let payload: Vec<Value> = tool_calls
						.iter()
						.enumerate()
						.map(|(i, parsed)| build_tool_call(parsed, i, choice_index))
						.collect();
					message.insert("tool_calls".to_string(), Value::Array(payload));
				}
				if content.trim().is_empty() {
					message.insert("content".to_string(), Value::Null);
				} else {
					message.insert("content".to_string(), Value::String(content));
				}
			}

			if !tool_calls.is_empty() {
				let finish = choice.get("finish_reason");
				let unset = finish.map(Value::is_null).unwrap_or(true);
				if unset || finish.and_then(Value::as_str) == Some("stop") {
					if let Some(obj) = choice.as_object_mut() {
						obj.insert("finish_reason".to_string(), json!("tool_calls"));
					}
				}
			}
		}
	}

	fn choice_state<'a>(
		&self,
		state: &'a mut ParseTagsStreamState,
		choice_index: i64,
	) -> &'a mut ChoiceTagState {
		state.choices.entry(choice_index).or_insert_with(|| ChoiceTagState {
			scanner: self.new_scanner(),
			next_tool_index: 0,
			saw_tool_calls: false,
		})
	}

	pub fn apply_stream_event(&self, event: &mut Value, state: &mut ParseTagsStreamState) {
		let Some(choices) = event.get_mut("choices").and_then(Value::as_array_mut) else {
			return;
		};
		for choice in choices {
			let choice_index = choice.get("index").and_then(Value::as_i64).unwrap_or(0);

			let content = choice
				.get("delta")
				.and_then(Value::as_object)
				.and_then(|d| d.get("content"))
				.and_then(Value::as_str)
				.filter(|c| !c.is_empty())
				.map(str::to_string);

			if let Some(content) = content {
				let choice_state = self.choice_state(state, choice_index);
				let result = choice_state.scanner.feed(&content);

				let mut tool_payload: Vec<Value> = Vec::new();
				for parsed in &result.tool_calls {
					tool_payload.push(build_tool_call(parsed, choice_state.next_tool_index, choice_index));
					choice_state.next_tool_index += 1;
				}
				if !tool_payload.is_empty() {
					choice_state.saw_tool_calls = true;
				}

				let delta = choice
					.get_mut("delta")
					.and_then(Value::as_object_mut)
					.expect("delta checked above");
				if result.content.is_empty() {
					delta.remove("content");
				} else {
					delta.insert("content".to_string(), Value::String(result.content));
				}
				if !result.reasoning.is_empty() {
					append_string(delta, "reasoning_content", &result.reasoning);
				}
				if !tool_payload.is_empty() {
					delta.insert("tool_calls".to_string(), Value::Array(tool_payload));
				}
			}

			// Promotion applies to any event of a choice that produced tool
			// calls, including a bare finish event with an empty delta.
			let saw_tool_calls = state
				.choices
				.get(&choice_index)
				.map(|s| s.saw_tool_calls)
				.unwrap_or(false);
			if saw_tool_calls {
				let finish = choice.get("finish_reason").and_then(Value::as_str);
				let unset = choice
					.get("finish_reason")
					.map(Value::is_null)
					.unwrap_or(true);
				if unset || finish == Some("stop") {
					if let Some(obj) = choice.as_object_mut() {
						obj.insert("finish_reason".to_string(), json!("tool_calls"));
					}
				}
			}
		}
	}

	pub fn finalize_stream(&self, state: &mut ParseTagsStreamState) -> Vec<Value> {
		let mut events = Vec::new();
		for (choice_index, choice_state) in state.choices.iter_mut() {
			let flushed = choice_state.scanner.flush();
			if flushed.is_empty() {
				continue;
			}
			let mut delta = Map::new();
			if !flushed.content.is_empty() {
				delta.insert("content".to_string(), Value::String(flushed.content));
			}
			if !flushed.reasoning.is_empty() {
				delta.insert(
					"reasoning_content".to_string(),
					Value::String(flushed.reasoning),
				);
			}
			if !flushed.tool_calls.is_empty() {
				let payload: Vec<Value> = flushed
					.tool_calls
					.iter()
					.enumerate()
					.map(|(i, parsed)| {
						build_tool_call(parsed, choice_state.next_tool_index + i, *choice_index)
					})
					.collect();
				delta.insert("tool_calls".to_string(), Value::Array(payload));
			}
			events.push(json!({"choices": [{"index": choice_index, "delta": delta}]}));
		}
		events
	}
}

fn is_assistant(message: &Map<String, Value>) -> bool {
	match message.get("role") {
		None | Some(Value::Null) => true,
		Some(Value::String(role)) => role == "assistant",
		Some(_) => false,
	}
}

fn has_text(value: Option<&Value>) -> bool {
	value.and_then(Value::as_str).is_some_and(|s| !s.is_empty())
}

fn has_items(value: Option<&Value>) -> bool {
	value.and_then(Value::as_array).is_some_and(|a| !a.is_empty())
}

fn append_string(obj: &mut Map<String, Value>, key: &str, extra: &str) {
	match obj.get_mut(key) {
		Some(Value::String(existing)) => existing.push_str(extra),
		_ => {
			obj.insert(key.to_string(), Value::String(extra.to_string()));
		},
	}
}

pub(super) fn build_tool_call(parsed: &ParsedToolCall, index: usize, choice_index: i64) -> Value {
	let args_json =
		serde_json::to_string(&parsed.arguments).unwrap_or_else(|_| "{}".to_string());
	json!({
		"id": format!("call_{choice_index}_{index}"),
		"type": "function",
		"function": {
			"name": parsed.name,
			"arguments": args_json,
		},
		"index": index,
	})
}

/// One-shot extraction of a single complete `<think>` block. Unterminated
/// blocks are left in place.
pub(super) fn extract_think_block(text: &str, think_tag: &str) -> Option<(String, String)> {
	let open_tag = format!("<{think_tag}>");
	let close_tag = format!("</{think_tag}>");
	let start = text.find(&open_tag)?;
	let body_start = start + open_tag.len();
	let end = text[body_start..].find(&close_tag)? + body_start;
	let reasoning = text[body_start..end].to_string();
	let content = format!("{}{}", &text[..start], &text[end + close_tag.len()..]);
	Some((reasoning, content))
}

fn extract_tool_calls(
	text: &str,
	tool_tag: &str,
	format: ToolFormat,
) -> (Vec<ParsedToolCall>, String) {
	let (open_tag, close_tag) = match format {
		ToolFormat::Xml => (format!("<{tool_tag}>"), format!("</{tool_tag}>")),
		ToolFormat::K2 => (
			super::tags::K2_SECTION_OPEN.to_string(),
			super::tags::K2_SECTION_CLOSE.to_string(),
		),
	};
	let mut calls = Vec::new();
	let mut content = String::new();
	let mut rest = text;
	loop {
		let Some(start) = rest.find(&open_tag) else {
			content.push_str(rest);
			break;
		};
		let body_start = start + open_tag.len();
		let Some(end_rel) = rest[body_start..].find(&close_tag) else {
			content.push_str(rest);
			break;
		};
		let end = body_start + end_rel;
		content.push_str(&rest[..start]);
		let body = &rest[body_start..end];
		match format {
			ToolFormat::Xml => calls.extend(super::tags::parse_tool_call_block(body)),
			ToolFormat::K2 => calls.extend(super::tags::parse_k2_section(body)),
		}
		rest = &rest[end + close_tag.len()..];
	}
	(calls, content)
}
