//! Backend records and outbound request shaping.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::{AllowedKeys, ModelEntry, ParameterEntry};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 409, 429, 500, 502, 503, 504];
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

pub fn is_retryable_status(status: http::StatusCode) -> bool {
	RETRYABLE_STATUSES.contains(&status.as_u16())
}

static HOP_BY_HOP_HEADERS: Lazy<Vec<HeaderName>> = Lazy::new(|| {
	[
		"connection",
		"keep-alive",
		"proxy-authenticate",
		"proxy-authorization",
		"te",
		"trailers",
		"transfer-encoding",
		"upgrade",
	]
	.into_iter()
	.map(HeaderName::from_static)
	.collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiType {
	#[default]
	OpenAi,
	Anthropic,
}

impl ApiType {
	pub fn parse(raw: Option<&str>) -> ApiType {
		match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
			Some("anthropic") => ApiType::Anthropic,
			_ => ApiType::OpenAi,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ApiType::OpenAi => "openai",
			ApiType::Anthropic => "anthropic",
		}
	}
}

/// Per-parameter override rule. With `allow_override` the request value wins
/// and `default` fills gaps; without it the configured value always wins.
#[derive(Debug, Clone)]
pub struct ParameterConfig {
	pub default: Value,
	pub allow_override: bool,
}

impl From<&ParameterEntry> for ParameterConfig {
	fn from(entry: &ParameterEntry) -> Self {
		ParameterConfig {
			default: entry.default.clone(),
			allow_override: entry.allow_override,
		}
	}
}

/// A configured upstream endpoint, addressable by its proxy-local name.
/// Borrowed immutably by in-flight requests; the registry swaps whole
/// records on re-registration.
#[derive(Debug, Clone, Default)]
pub struct Backend {
	pub name: String,
	pub base_url: String,
	pub api_key: String,
	pub timeout: Option<Duration>,
	/// Model name written into the outbound body, when it differs from the
	/// proxy-facing name.
	pub target_model: Option<String>,
	pub api_type: ApiType,
	pub anthropic_version: Option<String>,
	pub supports_reasoning: bool,
	pub http2: bool,
	pub parameters: HashMap<String, ParameterConfig>,
	pub allowed_keys: Option<AllowedKeys>,
}

impl Backend {
	/// Build a backend from a config entry; entries without a usable
	/// `api_base` are skipped by the caller.
	pub fn from_entry(entry: &ModelEntry) -> Option<Backend> {
		let params = &entry.model_params;
		let base = params.api_base.as_deref().unwrap_or("").trim();
		if entry.model_name.is_empty() || base.is_empty() {
			return None;
		}
		let api_type = ApiType::parse(params.api_type.as_deref());
		let timeout = params
			.request_timeout
			.filter(|t| *t > 0.0)
			.map(Duration::from_secs_f64);
		let parameters = entry
			.parameters
			.iter()
			.map(|(name, cfg)| (name.clone(), ParameterConfig::from(cfg)))
			.collect();
		Some(Backend {
			name: entry.model_name.clone(),
			base_url: base.to_string(),
			api_key: params.api_key.clone().unwrap_or_default(),
			timeout,
			target_model: extract_target_model(params, api_type),
			api_type,
			anthropic_version: params.anthropic_version.clone(),
			supports_reasoning: params.supports_reasoning.unwrap_or(false),
			http2: params.http2.unwrap_or(false),
			parameters,
			allowed_keys: entry.access_control.as_ref().map(|ac| ac.allowed_keys.clone()),
		})
	}

	/// The `/v1` prefix is a proxy-facing convention; upstream bases carry
	/// their own version segment.
	pub fn build_url(&self, path: &str, query: &str) -> String {
		let base = self.base_url.trim_end_matches('/');
		let mut normalized = if path.starts_with('/') {
			path.to_string()
		} else {
			format!("/{path}")
		};
		if let Some(rest) = normalized.strip_prefix("/v1") {
			normalized = if rest.is_empty() {
				"/".to_string()
			} else {
				rest.to_string()
			};
		}
		let mut url = format!("{base}{normalized}");
		if !query.is_empty() {
			let separator = if url.contains('?') { '&' } else { '?' };
			url.push(separator);
			url.push_str(query);
		}
		url
	}

	pub fn timeout(&self) -> Duration {
		self.timeout.unwrap_or(DEFAULT_TIMEOUT)
	}
}

/// Derive the upstream model name: the explicit aliases win, otherwise the
/// `model` value with its dialect prefix stripped.
fn extract_target_model(
	params: &crate::config::ModelParams,
	api_type: ApiType,
) -> Option<String> {
	for alias in [&params.target_model, &params.forward_model] {
		if let Some(value) = alias {
			let trimmed = value.trim();
			if !trimmed.is_empty() {
				return Some(trimmed.to_string());
			}
		}
	}
	let raw = params.model.as_deref().unwrap_or("").trim();
	if raw.is_empty() {
		return None;
	}
	let lower = raw.to_ascii_lowercase();
	let expected_prefix = format!("{}/", api_type.as_str());
	if lower.starts_with(&expected_prefix) && raw.len() > expected_prefix.len() {
		return Some(raw[expected_prefix.len()..].to_string());
	}
	if let Some(remainder) = lower.strip_prefix("openai/")
		&& !remainder.is_empty()
	{
		return Some(raw["openai/".len()..].to_string());
	}
	Some(raw.to_string())
}

/// Copy client headers for the upstream call, stripping hop-by-hop and
/// credential headers and injecting the backend's own.
pub fn build_outbound_headers(
	incoming: &HeaderMap,
	backend: &Backend,
	is_stream: bool,
) -> HeaderMap {
	let mut headers = HeaderMap::new();
	for (name, value) in incoming {
		if HOP_BY_HOP_HEADERS.contains(name) {
			continue;
		}
		match name.as_str() {
			"authorization" | "host" | "content-length" => continue,
			"x-api-key" if backend.api_type == ApiType::Anthropic => continue,
			_ => {},
		}
		if headers.contains_key(name) {
			continue;
		}
		headers.insert(name.clone(), value.clone());
	}

	if !headers.contains_key(http::header::CONTENT_TYPE) {
		headers.insert(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
	}
	if is_stream {
		headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/event-stream"));
		// SSE must be byte-transparent; compressed chunks would defeat the
		// inline-error peek and the parser pipeline.
		headers.insert(
			http::header::ACCEPT_ENCODING,
			HeaderValue::from_static("identity"),
		);
	}
	if !backend.api_key.is_empty() {
		match backend.api_type {
			ApiType::Anthropic => {
				if let Ok(mut value) = HeaderValue::from_str(&backend.api_key) {
					value.set_sensitive(true);
					headers.insert("x-api-key", value);
				}
			},
			ApiType::OpenAi => {
				if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {}", backend.api_key)) {
					value.set_sensitive(true);
					headers.insert(http::header::AUTHORIZATION, value);
				}
			},
		}
	}
	if backend.api_type == ApiType::Anthropic && !headers.contains_key("anthropic-version") {
		let version = backend
			.anthropic_version
			.as_deref()
			.unwrap_or(DEFAULT_ANTHROPIC_VERSION);
		if let Ok(value) = HeaderValue::from_str(version) {
			headers.insert("anthropic-version", value);
		}
	}
	headers
}

/// Rewrite the outbound body where the backend requires it; untouched
/// requests forward the original bytes.
pub fn build_backend_body(
	payload: &Map<String, Value>,
	backend: &Backend,
	original_body: &Bytes,
	is_stream: bool,
) -> Bytes {
	let mut thinking_to_set: Option<&'static str> = None;
	if backend.supports_reasoning {
		match payload.get("thinking").and_then(Value::as_object) {
			// An explicit opt-out is respected; anything else enables.
			Some(thinking) => {
				if thinking.get("type").and_then(Value::as_str) != Some("disabled") {
					thinking_to_set = Some("enabled");
				}
			},
			None => thinking_to_set = Some("enabled"),
		}
	}

	let needs_stream_flag = is_stream && payload.get("stream") != Some(&Value::Bool(true));
	if backend.target_model.is_none()
		&& thinking_to_set.is_none()
		&& !needs_stream_flag
		&& backend.parameters.is_empty()
	{
		return original_body.clone();
	}

	let mut updated = payload.clone();
	if needs_stream_flag {
		updated.insert("stream".to_string(), Value::Bool(true));
	}
	if let Some(target_model) = &backend.target_model {
		updated.insert("model".to_string(), Value::String(target_model.clone()));
		debug!(backend = %backend.name, model = %target_model, "rewrote outbound model");
	}
	if let Some(thinking_type) = thinking_to_set {
		updated.insert("thinking".to_string(), json!({"type": thinking_type}));
	}
	for (name, config) in &backend.parameters {
		if config.allow_override {
			if !updated.contains_key(name) {
				updated.insert(name.clone(), config.default.clone());
			}
		} else {
			updated.insert(name.clone(), config.default.clone());
		}
	}

	match serde_json::to_vec(&updated) {
		Ok(rewritten) => Bytes::from(rewritten),
		Err(err) => {
			warn!(backend = %backend.name, "failed to rewrite payload: {err}");
			original_body.clone()
		},
	}
}

/// Drop headers the server framework will recompute or that no longer match
/// the relayed payload.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
	let mut filtered = HeaderMap::new();
	for (name, value) in headers {
		if HOP_BY_HOP_HEADERS.contains(name) {
			continue;
		}
		if matches!(
			name.as_str(),
			"content-length" | "transfer-encoding" | "content-encoding"
		) {
			continue;
		}
		filtered.append(name.clone(), value.clone());
	}
	filtered
}
