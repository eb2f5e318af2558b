//! HTTP surface: error envelopes, endpoint handlers and app wiring.

pub mod app;
pub mod routes;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

/// Which error-envelope shape a handler speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
	#[default]
	OpenAi,
	Anthropic,
}

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("invalid JSON payload")]
	InvalidJson,
	#[error("request body must be a JSON object")]
	InvalidShape,
	#[error("you must provide a model parameter")]
	MissingModel,
	#[error("you must provide a messages array")]
	MissingMessages,
	#[error("model '{0}' is not defined in config")]
	ModelNotFound(String),
	#[error("{message}")]
	Unauthorized { message: String, code: &'static str },
	#[error("API key is not allowed to access model '{0}'")]
	Forbidden(String),
	#[error("request timed out waiting for a concurrency slot")]
	QueueTimeout,
	#[error("client disconnected")]
	ClientDisconnected,
	#[error("backend '{0}' does not speak the messages dialect")]
	UnsupportedBackend(String),
	#[error("{0}")]
	AllBackendsFailed(String),
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::InvalidJson
			| ProxyError::InvalidShape
			| ProxyError::MissingModel
			| ProxyError::MissingMessages
			| ProxyError::UnsupportedBackend(_) => StatusCode::BAD_REQUEST,
			// The OpenAI dialect wraps unknown models as a 400.
			ProxyError::ModelNotFound(_) => StatusCode::BAD_REQUEST,
			ProxyError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
			ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
			ProxyError::QueueTimeout => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::ClientDisconnected => {
				StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
			},
			ProxyError::AllBackendsFailed(_) | ProxyError::Internal(_) => StatusCode::BAD_GATEWAY,
		}
	}

	fn error_type(&self) -> &'static str {
		match self {
			ProxyError::InvalidJson
			| ProxyError::InvalidShape
			| ProxyError::MissingModel
			| ProxyError::MissingMessages
			| ProxyError::ModelNotFound(_)
			| ProxyError::UnsupportedBackend(_) => "invalid_request_error",
			ProxyError::Unauthorized { .. } => "authentication_error",
			ProxyError::Forbidden(_) => "permission_error",
			ProxyError::QueueTimeout => "rate_limit_error",
			ProxyError::ClientDisconnected => "client_disconnected",
			ProxyError::AllBackendsFailed(_) | ProxyError::Internal(_) => "api_error",
		}
	}

	fn code(&self) -> Option<&'static str> {
		match self {
			ProxyError::InvalidJson => Some("invalid_json"),
			ProxyError::InvalidShape => Some("invalid_json_shape"),
			ProxyError::MissingModel | ProxyError::MissingMessages => Some("missing_parameter"),
			ProxyError::ModelNotFound(_) => Some("model_not_found"),
			ProxyError::Unauthorized { code, .. } => Some(*code),
			ProxyError::Forbidden(_) => Some("model_access_denied"),
			ProxyError::UnsupportedBackend(_) => Some("unsupported_backend"),
			_ => None,
		}
	}

	pub fn respond(&self, dialect: Dialect) -> Response {
		let status = match (dialect, self) {
			// Anthropic clients get a straight 404 for unknown models.
			(Dialect::Anthropic, ProxyError::ModelNotFound(_)) => StatusCode::NOT_FOUND,
			_ => self.status(),
		};
		let message = self.to_string();
		let body = match dialect {
			Dialect::OpenAi => json!({
				"error": {
					"message": message,
					"type": self.error_type(),
					"code": self.code(),
				}
			}),
			Dialect::Anthropic => json!({
				"type": "error",
				"error": {
					"type": self.error_type(),
					"message": message,
				}
			}),
		};
		(status, Json(body)).into_response()
	}
}
