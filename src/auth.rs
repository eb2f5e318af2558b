//! App-key validation and model access control.

use std::sync::Arc;

use http::HeaderMap;
use tracing::warn;

use crate::config::{AllowedKeys, AppKeyEntry, Config};
use crate::proxy::ProxyError;

/// Identity attached to a validated request.
#[derive(Debug, Clone, Default)]
pub struct AppKeyContext {
	pub key_id: Option<String>,
	pub key_name: Option<String>,
	pub authenticated: bool,
}

pub struct AppKeyValidator {
	config: Arc<Config>,
}

impl AppKeyValidator {
	pub fn new(config: Arc<Config>) -> Self {
		AppKeyValidator { config }
	}

	/// Resolve the caller's identity from headers. 401 on a missing key
	/// (unless unauthenticated access is allowed) or an unknown/disabled one.
	pub fn validate(&self, headers: &HeaderMap) -> Result<AppKeyContext, ProxyError> {
		let app_keys = &self.config.app_keys;
		if !app_keys.enabled {
			return Ok(AppKeyContext::default());
		}

		let provided = headers
			.get(app_keys.header_name.as_str())
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
			.or_else(|| {
				headers
					.get(http::header::AUTHORIZATION)
					.and_then(|v| v.to_str().ok())
					.and_then(|v| {
						let (scheme, token) = v.split_once(' ')?;
						scheme
							.eq_ignore_ascii_case("bearer")
							.then(|| token.trim().to_string())
					})
			});

		let Some(provided) = provided.filter(|p| !p.is_empty()) else {
			if app_keys.allow_unauthenticated {
				return Ok(AppKeyContext::default());
			}
			warn!("request rejected: missing API key");
			return Err(ProxyError::Unauthorized {
				message: "API key required".to_string(),
				code: "missing_api_key",
			});
		};

		let Some(entry) = self.find_key(&provided) else {
			warn!("request rejected: invalid API key");
			return Err(ProxyError::Unauthorized {
				message: "Invalid API key".to_string(),
				code: "invalid_api_key",
			});
		};
		if !entry.enabled {
			warn!(key_id = %entry.key_id, "request rejected: disabled API key");
			return Err(ProxyError::Unauthorized {
				message: "API key is disabled".to_string(),
				code: "disabled_api_key",
			});
		}
		Ok(AppKeyContext {
			key_id: Some(entry.key_id.clone()),
			key_name: entry.name.clone(),
			authenticated: true,
		})
	}

	/// 403 when the model's access control excludes this identity.
	pub fn check_model_access(
		&self,
		ctx: &AppKeyContext,
		model_name: &str,
		allowed: Option<&AllowedKeys>,
	) -> Result<(), ProxyError> {
		let Some(allowed) = allowed else {
			return Ok(());
		};
		if allowed.allows(ctx.key_id.as_deref()) {
			return Ok(());
		}
		warn!(model = %model_name, key_id = ?ctx.key_id, "model access denied");
		Err(ProxyError::Forbidden(model_name.to_string()))
	}

	fn find_key(&self, secret: &str) -> Option<&AppKeyEntry> {
		self
			.config
			.app_keys
			.keys
			.iter()
			.find(|k| constant_time_eq(k.secret.as_bytes(), secret.as_bytes()))
	}
}

/// Length-leaking but content-constant comparison; key count is small.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
