//! Per-key concurrency limiting with a global priority queue.

mod manager;
mod slot;

pub use manager::{ConcurrencyManager, ConcurrencyMetrics};
pub use slot::ConcurrencySlot;
use thiserror::Error;

use crate::config::Config;

pub const DEFAULT_CONCURRENCY_LIMIT: i64 = 0; // 0 means no limit
pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_UNAUTHENTICATED_LIMIT: i64 = 5;
pub const DEFAULT_UNAUTHENTICATED_PRIORITY: i32 = 1000;

#[derive(Debug, Error)]
pub enum ConcurrencyError {
	#[error("timeout waiting for concurrency slot: key={0}")]
	QueueTimeout(String),
	#[error("client disconnected while waiting: key={0}")]
	ClientDisconnected(String),
}

/// Resolved concurrency settings for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyConcurrencyConfig {
	pub concurrency_limit: i64,
	pub priority: i32,
	/// Seconds; `None` waits forever.
	pub queue_timeout: Option<f64>,
}

/// Resolution order: key-specific settings, then `app_keys.defaults`, then
/// built-ins. Unauthenticated requests use the `unauthenticated` block.
pub fn resolve_key_config(config: &Config, key_id: Option<&str>) -> KeyConcurrencyConfig {
	let app_keys = &config.app_keys;
	let defaults = app_keys.defaults.as_ref();

	let Some(key_id) = key_id else {
		let unauth = app_keys.unauthenticated.as_ref();
		return KeyConcurrencyConfig {
			concurrency_limit: unauth
				.and_then(|u| u.concurrency_limit)
				.unwrap_or(DEFAULT_UNAUTHENTICATED_LIMIT),
			priority: unauth
				.and_then(|u| u.priority)
				.unwrap_or(DEFAULT_UNAUTHENTICATED_PRIORITY),
			queue_timeout: unauth.and_then(|u| u.queue_timeout),
		};
	};

	let key_entry = app_keys.keys.iter().find(|k| k.key_id == key_id);
	let default_limit = defaults
		.and_then(|d| d.concurrency_limit)
		.unwrap_or(DEFAULT_CONCURRENCY_LIMIT);
	let default_priority = defaults.and_then(|d| d.priority).unwrap_or(DEFAULT_PRIORITY);
	let default_timeout = defaults.and_then(|d| d.queue_timeout);

	match key_entry {
		Some(entry) => KeyConcurrencyConfig {
			concurrency_limit: entry.limits.concurrency_limit.unwrap_or(default_limit),
			priority: entry.limits.priority.unwrap_or(default_priority),
			queue_timeout: entry.limits.queue_timeout.or(default_timeout),
		},
		None => KeyConcurrencyConfig {
			concurrency_limit: default_limit,
			priority: default_priority,
			queue_timeout: default_timeout,
		},
	}
}

#[cfg(test)]
mod config_tests {
	use super::*;

	const YAML: &str = r#"
app_keys:
  enabled: true
  keys:
    - key_id: fast
      secret: s1
      concurrency_limit: 4
      priority: 10
    - key_id: plain
      secret: s2
  defaults:
    concurrency_limit: 2
    priority: 50
    queue_timeout: 30
  unauthenticated:
    concurrency_limit: 1
"#;

	#[test]
	fn key_specific_settings_win() {
		let config = Config::parse(YAML).unwrap();
		let resolved = resolve_key_config(&config, Some("fast"));
		assert_eq!(resolved.concurrency_limit, 4);
		assert_eq!(resolved.priority, 10);
		assert_eq!(resolved.queue_timeout, Some(30.0));
	}

	#[test]
	fn defaults_fill_gaps() {
		let config = Config::parse(YAML).unwrap();
		let resolved = resolve_key_config(&config, Some("plain"));
		assert_eq!(resolved.concurrency_limit, 2);
		assert_eq!(resolved.priority, 50);
	}

	#[test]
	fn unknown_key_uses_defaults() {
		let config = Config::parse(YAML).unwrap();
		let resolved = resolve_key_config(&config, Some("missing"));
		assert_eq!(resolved.concurrency_limit, 2);
	}

	#[test]
	fn unauthenticated_block_and_builtins() {
		let config = Config::parse(YAML).unwrap();
		let resolved = resolve_key_config(&config, None);
		assert_eq!(resolved.concurrency_limit, 1);
		assert_eq!(resolved.priority, DEFAULT_UNAUTHENTICATED_PRIORITY);

		let empty = Config::default();
		let resolved = resolve_key_config(&empty, None);
		assert_eq!(resolved.concurrency_limit, DEFAULT_UNAUTHENTICATED_LIMIT);
		assert_eq!(resolved.priority, DEFAULT_UNAUTHENTICATED_PRIORITY);
	}
}
