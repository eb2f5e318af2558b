//! Config snapshot consumed by the proxy.
//!
//! The YAML shape mirrors the familiar `model_list` / `router_settings` /
//! `proxy_settings` / `app_keys` layout. Loading produces an immutable
//! snapshot; runtime changes to backends go through the registry instead.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub model_list: Vec<ModelEntry>,
	#[serde(default)]
	pub router_settings: RouterSettings,
	#[serde(default)]
	pub proxy_settings: ProxySettings,
	#[serde(default)]
	pub app_keys: AppKeys,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelEntry {
	pub model_name: String,
	#[serde(default)]
	pub model_params: ModelParams,
	#[serde(default)]
	pub parameters: HashMap<String, ParameterEntry>,
	/// Backend-local parser pipeline config, replacing the global one.
	#[serde(default)]
	pub parsers: Option<Value>,
	#[serde(default)]
	pub access_control: Option<AccessControl>,
	/// Inherit model_params/parameters from another entry.
	#[serde(default)]
	pub extends: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelParams {
	#[serde(default)]
	pub api_base: Option<String>,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default)]
	pub request_timeout: Option<f64>,
	/// Upstream model name; the `target_model`/`forward_model` aliases win
	/// over the prefix-stripped `model` form.
	#[serde(default)]
	pub model: Option<String>,
	#[serde(default)]
	pub target_model: Option<String>,
	#[serde(default)]
	pub forward_model: Option<String>,
	#[serde(default)]
	pub api_type: Option<String>,
	#[serde(default)]
	pub anthropic_version: Option<String>,
	#[serde(default)]
	pub supports_reasoning: Option<bool>,
	#[serde(default)]
	pub http2: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterEntry {
	#[serde(default)]
	pub default: Value,
	#[serde(default = "default_true")]
	pub allow_override: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessControl {
	pub allowed_keys: AllowedKeys,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AllowedKeys {
	Keyword(String),
	List(Vec<String>),
}

impl AllowedKeys {
	/// `"all"` admits everyone, `"none"` nobody; a list admits only the
	/// named key ids (and therefore never unauthenticated callers).
	pub fn allows(&self, key_id: Option<&str>) -> bool {
		match self {
			AllowedKeys::Keyword(word) => match word.to_ascii_lowercase().as_str() {
				"all" => true,
				"none" => false,
				_ => false,
			},
			AllowedKeys::List(keys) => match key_id {
				Some(id) => keys.iter().any(|k| k == id),
				None => false,
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterSettings {
	#[serde(default)]
	pub num_retries: Option<u32>,
	#[serde(default)]
	pub fallbacks: Vec<HashMap<String, FallbackTargets>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FallbackTargets {
	One(String),
	Many(Vec<String>),
}

impl RouterSettings {
	pub fn num_retries(&self) -> u32 {
		self.num_retries.unwrap_or(1).max(1)
	}

	pub fn fallback_map(&self) -> HashMap<String, Vec<String>> {
		let mut map = HashMap::new();
		for entry in &self.fallbacks {
			for (primary, targets) in entry {
				let names = match targets {
					FallbackTargets::One(name) => vec![name.clone()],
					FallbackTargets::Many(names) => {
						names.iter().filter(|n| !n.is_empty()).cloned().collect()
					},
				};
				map.insert(primary.clone(), names);
			}
		}
		map
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxySettings {
	#[serde(default)]
	pub server: ServerSettings,
	#[serde(default)]
	pub enable_responses_endpoint: bool,
	#[serde(default)]
	pub logging: LoggingSettings,
	/// Global response parser pipeline config.
	#[serde(default)]
	pub parsers: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
}

impl Default for ServerSettings {
	fn default() -> Self {
		ServerSettings {
			host: default_host(),
			port: default_port(),
		}
	}
}

fn default_host() -> String {
	"127.0.0.1".to_string()
}

fn default_port() -> u16 {
	8000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSettings {
	#[serde(default)]
	pub log_parsed_response: bool,
	/// Defaults to `log_parsed_response` when unset.
	#[serde(default)]
	pub log_parsed_stream: Option<bool>,
	#[serde(default)]
	pub log_dir: Option<String>,
}

impl LoggingSettings {
	pub fn log_parsed_stream(&self) -> bool {
		self.log_parsed_stream.unwrap_or(self.log_parsed_response)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppKeys {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_header_name")]
	pub header_name: String,
	#[serde(default)]
	pub allow_unauthenticated: bool,
	#[serde(default)]
	pub keys: Vec<AppKeyEntry>,
	#[serde(default)]
	pub defaults: Option<KeyLimits>,
	#[serde(default)]
	pub unauthenticated: Option<KeyLimits>,
}

fn default_header_name() -> String {
	"x-api-key".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppKeyEntry {
	pub key_id: String,
	#[serde(default)]
	pub name: Option<String>,
	pub secret: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(flatten)]
	pub limits: KeyLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyLimits {
	#[serde(default)]
	pub concurrency_limit: Option<i64>,
	#[serde(default)]
	pub priority: Option<i32>,
	/// Seconds a request may wait in the queue; unset means wait forever.
	#[serde(default)]
	pub queue_timeout: Option<f64>,
}

impl Config {
	pub fn load(path: &Path) -> anyhow::Result<Config> {
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read config {}", path.display()))?;
		Config::parse(&contents)
	}

	pub fn parse(contents: &str) -> anyhow::Result<Config> {
		let mut config: Config = serde_yaml::from_str(contents).context("invalid config")?;
		resolve_inheritance(&mut config.model_list)?;
		Ok(config)
	}
}

/// Resolve `extends` chains: a child inherits the whole parent entry —
/// `model_params` fields, `parameters` entries, and the `parsers` and
/// `access_control` blocks — wherever it does not set a value itself.
/// Chains resolve transitively; cycles are a configuration error.
fn resolve_inheritance(entries: &mut Vec<ModelEntry>) -> anyhow::Result<()> {
	let originals: HashMap<String, ModelEntry> = entries
		.iter()
		.map(|e| (e.model_name.clone(), e.clone()))
		.collect();

	for entry in entries.iter_mut() {
		let mut seen = vec![entry.model_name.clone()];
		let mut parent_name = entry.extends.clone();
		while let Some(name) = parent_name {
			if seen.contains(&name) {
				bail!("model '{}' has a cyclic extends chain", entry.model_name);
			}
			let Some(parent) = originals.get(&name) else {
				bail!(
					"model '{}' extends unknown model '{}'",
					entry.model_name,
					name
				);
			};
			merge_params(&mut entry.model_params, &parent.model_params);
			for (key, value) in &parent.parameters {
				entry
					.parameters
					.entry(key.clone())
					.or_insert_with(|| value.clone());
			}
			if entry.parsers.is_none() {
				entry.parsers = parent.parsers.clone();
			}
			if entry.access_control.is_none() {
				entry.access_control = parent.access_control.clone();
			}
			seen.push(name);
			parent_name = parent.extends.clone();
		}
	}
	Ok(())
}

fn merge_params(child: &mut ModelParams, parent: &ModelParams) {
	macro_rules! inherit {
		($field:ident) => {
			if child.$field.is_none() {
				child.$field = parent.$field.clone();
			}
		};
	}
	inherit!(api_base);
	inherit!(api_key);
	inherit!(request_timeout);
	inherit!(model);
	inherit!(target_model);
	inherit!(forward_model);
	inherit!(api_type);
	inherit!(anthropic_version);
	inherit!(supports_reasoning);
	inherit!(http2);
}

/// Normalize a client-supplied model name for routing: a recognised
/// `openai/` prefix is stripped, anything else is preserved.
pub fn normalize_request_model(model_name: &str) -> String {
	let stripped = model_name.trim();
	if let Some((prefix, remainder)) = stripped.split_once('/')
		&& !remainder.is_empty()
		&& prefix.eq_ignore_ascii_case("openai")
	{
		return remainder.to_string();
	}
	stripped.to_string()
}
