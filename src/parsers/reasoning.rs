//! Moving reasoning between the `reasoning_content` field and inline
//! `<think>` markers in content, in either direction.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use super::parse_tags::extract_think_block;
use super::tags::{TagScanner, ToolFormat};
use super::{config_bool, config_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapMode {
	ReasoningToContent,
	ContentToReasoning,
	Auto,
}

impl SwapMode {
	fn parse(raw: &str) -> SwapMode {
		match raw.trim().to_ascii_lowercase().as_str() {
			"to_reasoning" | "content_to_reasoning" | "content-to-reasoning" => {
				SwapMode::ContentToReasoning
			},
			"auto" => SwapMode::Auto,
			_ => SwapMode::ReasoningToContent,
		}
	}
}

#[derive(Debug)]
pub struct ReasoningSwapParser {
	mode: SwapMode,
	think_tag: String,
	include_newline: bool,
}

#[derive(Debug, Default)]
pub struct ReasoningChoiceState {
	inside_reasoning: bool,
	scanner: Option<TagScanner>,
	resolved_mode: Option<SwapMode>,
}

#[derive(Debug, Default)]
pub struct ReasoningSwapStreamState {
	choices: BTreeMap<i64, ReasoningChoiceState>,
}

impl ReasoningSwapParser {
	pub fn new(config: Option<&Value>) -> Self {
		let cfg = config.and_then(Value::as_object);
		let get = |key: &str| cfg.and_then(|c| c.get(key));
		ReasoningSwapParser {
			mode: SwapMode::parse(config_str(get("mode"), "reasoning_to_content")),
			think_tag: config_str(get("think_tag"), "think").to_string(),
			include_newline: config_bool(get("include_newline"), true),
		}
	}

	fn open_tag(&self) -> String {
		format!("<{}>", self.think_tag)
	}

	fn close_tag(&self) -> String {
		format!("</{}>", self.think_tag)
	}

	fn wrap_reasoning(&self, reasoning: &str, content: Option<&str>) -> String {
		let prefix = format!("{}{}{}", self.open_tag(), reasoning, self.close_tag());
		match content {
			Some(content) if !content.is_empty() => {
				let sep = if self.include_newline { "\n" } else { "" };
				format!("{prefix}{sep}{content}")
			},
			_ => prefix,
		}
	}

	pub fn apply_response(&self, payload: &mut Value) {
		let Some(choices) = payload.get_mut("choices").and_then(Value::as_array_mut) else {
			return;
		};
		for choice in choices {
			let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) else {
				continue;
			};
			match message.get("role") {
				None | Some(Value::Null) => {},
				Some(Value::String(role)) if role == "assistant" => {},
				Some(_) => continue,
			}

			let reasoning = message
				.get("reasoning_content")
				.and_then(Value::as_str)
				.filter(|r| !r.is_empty())
				.map(str::to_string);
			let content = message
				.get("content")
				.and_then(Value::as_str)
				.map(str::to_string);
			let content_is_null_or_str = matches!(
				message.get("content"),
				None | Some(Value::Null) | Some(Value::String(_))
			);

			let to_content = |message: &mut Map<String, Value>, reasoning: &str| {
				let wrapped = self.wrap_reasoning(reasoning, content.as_deref());
				message.insert("content".to_string(), Value::String(wrapped));
				message.remove("reasoning_content");
			};
			let to_reasoning = |message: &mut Map<String, Value>, content: &str| {
				if let Some((extracted, remaining)) = extract_think_block(content, &self.think_tag) {
					message.insert("reasoning_content".to_string(), Value::String(extracted));
					if remaining.trim().is_empty() {
						message.insert("content".to_string(), Value::Null);
					} else {
						message.insert("content".to_string(), Value::String(remaining));
					}
				}
			};

			match self.mode {
				SwapMode::ReasoningToContent => {
					if let Some(reasoning) = &reasoning
						&& content_is_null_or_str
					{
						to_content(message, reasoning);
					}
				},
				SwapMode::ContentToReasoning => {
					if let Some(content) = &content
						&& !content.is_empty()
					{
						to_reasoning(message, content);
					}
				},
				SwapMode::Auto => {
					if let Some(reasoning) = &reasoning {
						if content_is_null_or_str {
							to_content(message, reasoning);
						}
					} else if let Some(content) = &content
						&& !content.is_empty()
					{
						to_reasoning(message, content);
					}
				},
			}
		}
	}

	fn choice_state<'a>(
		state: &'a mut ReasoningSwapStreamState,
		choice_index: i64,
	) -> &'a mut ReasoningChoiceState {
		state.choices.entry(choice_index).or_default()
	}

	pub fn apply_stream_event(&self, event: &mut Value, state: &mut ReasoningSwapStreamState) {
		let Some(choices) = event.get_mut("choices").and_then(Value::as_array_mut) else {
			return;
		};
		for choice in choices {
			if choice.get("delta").and_then(Value::as_object).is_none() {
				continue;
			}
			let choice_index = choice.get("index").and_then(Value::as_i64).unwrap_or(0);
			let finish_set = choice
				.get("finish_reason")
				.is_some_and(|f| !f.is_null());

			let choice_state = Self::choice_state(state, choice_index);
			let mode = match self.mode {
				SwapMode::Auto => {
					let resolved = *choice_state.resolved_mode.get_or_insert_with(|| {
						let has_reasoning = choice
							.get("delta")
							.and_then(Value::as_object)
							.and_then(|d| d.get("reasoning_content"))
							.and_then(Value::as_str)
							.is_some();
						if has_reasoning {
							SwapMode::ReasoningToContent
						} else {
							SwapMode::ContentToReasoning
						}
					});
					resolved
				},
				other => other,
			};

			match mode {
				SwapMode::ReasoningToContent => {
					self.stream_to_content(choice, choice_state, finish_set);
				},
				SwapMode::ContentToReasoning => {
					self.stream_to_reasoning(choice, choice_state);
				},
				SwapMode::Auto => unreachable!("auto resolves per choice"),
			}
		}
	}

	fn stream_to_content(
		&self,
		choice: &mut Value,
		choice_state: &mut ReasoningChoiceState,
		finish_set: bool,
	) {
		let delta = choice
			.get_mut("delta")
			.and_then(Value::as_object_mut)
			.expect("delta checked by caller");
		let reasoning = delta
			.get("reasoning_content")
			.and_then(Value::as_str)
			.filter(|r| !r.is_empty())
			.map(str::to_string);
		let content = delta
			.get("content")
			.and_then(Value::as_str)
			.filter(|c| !c.is_empty())
			.map(str::to_string);
		let mut new_content: Option<String> = None;

		if let Some(reasoning) = reasoning {
			let prefix = if choice_state.inside_reasoning {
				String::new()
			} else {
				self.open_tag()
			};
			if let Some(content) = &content {
				new_content = Some(format!("{prefix}{reasoning}{}{content}", self.close_tag()));
				choice_state.inside_reasoning = false;
			} else {
				new_content = Some(format!("{prefix}{reasoning}"));
				choice_state.inside_reasoning = true;
			}
			delta.remove("reasoning_content");
		} else if let Some(content) = &content
			&& choice_state.inside_reasoning
		{
			new_content = Some(format!("{}{content}", self.close_tag()));
			choice_state.inside_reasoning = false;
		}

		if let Some(new_content) = new_content {
			delta.insert("content".to_string(), Value::String(new_content));
		}

		// The closing tag must land before the stream's final event.
		if choice_state.inside_reasoning && finish_set {
			let existing = delta
				.get("content")
				.and_then(Value::as_str)
				.unwrap_or_default();
			let combined = format!("{existing}{}", self.close_tag());
			delta.insert("content".to_string(), Value::String(combined));
			choice_state.inside_reasoning = false;
		}
	}

	fn stream_to_reasoning(&self, choice: &mut Value, choice_state: &mut ReasoningChoiceState) {
		let delta = choice
			.get_mut("delta")
			.and_then(Value::as_object_mut)
			.expect("delta checked by caller");
		let Some(content) = delta
			.get("content")
			.and_then(Value::as_str)
			.filter(|c| !c.is_empty())
			.map(str::to_string)
		else {
			return;
		};
		let scanner = choice_state.scanner.get_or_insert_with(|| {
			TagScanner::new(&self.think_tag, "tool_call", true, false, ToolFormat::Xml)
		});
		let result = scanner.feed(&content);
		if result.content.is_empty() {
			delta.remove("content");
		} else {
			delta.insert("content".to_string(), Value::String(result.content));
		}
		if !result.reasoning.is_empty() {
			match delta.get_mut("reasoning_content") {
				Some(Value::String(existing)) => existing.push_str(&result.reasoning),
				_ => {
					delta.insert(
						"reasoning_content".to_string(),
						Value::String(result.reasoning),
					);
				},
			}
		}
	}

	pub fn finalize_stream(&self, state: &mut ReasoningSwapStreamState) -> Vec<Value> {
		let mut events = Vec::new();
		for (choice_index, choice_state) in state.choices.iter_mut() {
			if choice_state.inside_reasoning {
				choice_state.inside_reasoning = false;
				events.push(json!({
					"choices": [{"index": choice_index, "delta": {"content": self.close_tag()}}],
				}));
				continue;
			}
			if let Some(scanner) = choice_state.scanner.as_mut() {
				let flushed = scanner.flush();
				if flushed.content.is_empty() && flushed.reasoning.is_empty() {
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
				events.push(json!({"choices": [{"index": choice_index, "delta": delta}]}));
			}
		}
		events
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parser(mode: &str) -> ReasoningSwapParser {
		ReasoningSwapParser::new(Some(&json!({"mode": mode})))
	}

	#[test]
	fn buffered_reasoning_to_content() {
		let mut payload = json!({
			"choices": [{
				"index": 0,
				"message": {"role": "assistant", "content": "Answer.", "reasoning_content": "Reasoning."},
			}],
		});
		parser("reasoning_to_content").apply_response(&mut payload);
		let message = &payload["choices"][0]["message"];
		assert_eq!(message["content"], "<think>Reasoning.</think>\nAnswer.");
		assert!(message.get("reasoning_content").is_none());
	}

	#[test]
	fn buffered_reasoning_to_content_without_newline() {
		let parser =
			ReasoningSwapParser::new(Some(&json!({"mode": "to_content", "include_newline": false})));
		let mut payload = json!({
			"choices": [{
				"index": 0,
				"message": {"role": "assistant", "content": "A", "reasoning_content": "R"},
			}],
		});
		parser.apply_response(&mut payload);
		assert_eq!(
			payload["choices"][0]["message"]["content"],
			"<think>R</think>A"
		);
	}

	#[test]
	fn buffered_content_to_reasoning() {
		let mut payload = json!({
			"choices": [{
				"index": 0,
				"message": {"role": "assistant", "content": "<think>Reasoning.</think>Answer."},
			}],
		});
		parser("content_to_reasoning").apply_response(&mut payload);
		let message = &payload["choices"][0]["message"];
		assert_eq!(message["reasoning_content"], "Reasoning.");
		assert_eq!(message["content"], "Answer.");
	}

	#[test]
	fn buffered_auto_prefers_reasoning_field() {
		let mut payload = json!({
			"choices": [{
				"index": 0,
				"message": {"role": "assistant", "content": "body", "reasoning_content": "r"},
			}],
		});
		parser("auto").apply_response(&mut payload);
		assert_eq!(
			payload["choices"][0]["message"]["content"],
			"<think>r</think>\nbody"
		);
	}

	fn delta_event(reasoning: Option<&str>, content: Option<&str>, finish: Option<&str>) -> Value {
		let mut delta = Map::new();
		if let Some(r) = reasoning {
			delta.insert("reasoning_content".to_string(), json!(r));
		}
		if let Some(c) = content {
			delta.insert("content".to_string(), json!(c));
		}
		json!({"choices": [{"index": 0, "delta": delta, "finish_reason": finish}]})
	}

	#[test]
	fn stream_reasoning_to_content_brackets_once() {
		let parser = parser("reasoning_to_content");
		let mut state = ReasoningSwapStreamState::default();

		let mut ev1 = delta_event(Some("first "), None, None);
		parser.apply_stream_event(&mut ev1, &mut state);
		assert_eq!(ev1["choices"][0]["delta"]["content"], "<think>first ");

		let mut ev2 = delta_event(Some("second"), None, None);
		parser.apply_stream_event(&mut ev2, &mut state);
		assert_eq!(ev2["choices"][0]["delta"]["content"], "second");

		let mut ev3 = delta_event(None, Some("answer"), None);
		parser.apply_stream_event(&mut ev3, &mut state);
		assert_eq!(ev3["choices"][0]["delta"]["content"], "</think>answer");

		assert!(parser.finalize_stream(&mut state).is_empty());
	}

	#[test]
	fn stream_reasoning_closed_on_finish_event() {
		let parser = parser("reasoning_to_content");
		let mut state = ReasoningSwapStreamState::default();

		let mut ev1 = delta_event(Some("thinking"), None, None);
		parser.apply_stream_event(&mut ev1, &mut state);

		let mut finish = delta_event(None, None, Some("stop"));
		parser.apply_stream_event(&mut finish, &mut state);
		assert_eq!(finish["choices"][0]["delta"]["content"], "</think>");
	}

	#[test]
	fn stream_reasoning_closed_at_stream_end() {
		let parser = parser("reasoning_to_content");
		let mut state = ReasoningSwapStreamState::default();

		let mut ev1 = delta_event(Some("thinking"), None, None);
		parser.apply_stream_event(&mut ev1, &mut state);

		let events = parser.finalize_stream(&mut state);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0]["choices"][0]["delta"]["content"], "</think>");
	}

	#[test]
	fn stream_content_to_reasoning() {
		let parser = parser("content_to_reasoning");
		let mut state = ReasoningSwapStreamState::default();

		let mut ev1 = delta_event(None, Some("<think>Reas"), None);
		parser.apply_stream_event(&mut ev1, &mut state);
		assert!(ev1["choices"][0]["delta"].get("content").is_none());
		assert_eq!(ev1["choices"][0]["delta"]["reasoning_content"], "Reas");

		let mut ev2 = delta_event(None, Some("oning.</think>Answer."), None);
		parser.apply_stream_event(&mut ev2, &mut state);
		assert_eq!(ev2["choices"][0]["delta"]["content"], "Answer.");
	}

	#[test]
	fn stream_auto_resolves_per_choice_from_first_delta() {
		let parser = parser("auto");
		let mut state = ReasoningSwapStreamState::default();

		let mut ev1 = delta_event(Some("r"), None, None);
		parser.apply_stream_event(&mut ev1, &mut state);
		assert_eq!(ev1["choices"][0]["delta"]["content"], "<think>r");

		// Same mode sticks for the rest of the stream.
		let mut ev2 = delta_event(None, Some("done"), None);
		parser.apply_stream_event(&mut ev2, &mut state);
		assert_eq!(ev2["choices"][0]["delta"]["content"], "</think>done");
	}
}
