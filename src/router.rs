//! Model routing with retries and fallback.
//!
//! The router builds a backend chain from the registry, drives each backend
//! through its retry budget with exponential backoff, and peels off fallback
//! backends when a chain entry is exhausted. Only retryable errors
//! participate in this loop; everything else propagates immediately.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use itertools::Itertools;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Backend, DEFAULT_RETRY_DELAY, MAX_RETRY_DELAY};
use crate::config::Config;
use crate::parsers::{self, ParserContext, ResponseParserPipeline};
use crate::proxy::ProxyError;
use crate::store::Registry;
use crate::telemetry::{Outcome, RecordedErrorType, RequestLogRecorder};
use crate::upstream::UpstreamTransport;

/// A normalised inbound request, ready to be shaped per backend.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
	pub model: String,
	pub path: String,
	pub query: String,
	pub body: Bytes,
	pub payload: Map<String, Value>,
	pub is_stream: bool,
	pub headers: HeaderMap,
}

/// An upstream response materialised during a failed attempt, kept for
/// last-chance delivery when the whole chain is exhausted.
#[derive(Debug)]
pub struct CapturedResponse {
	pub status: StatusCode,
	/// Already filtered of hop-by-hop headers.
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl CapturedResponse {
	pub fn into_response(self) -> Response {
		let mut response = Response::new(Body::from(self.body));
		*response.status_mut() = self.status;
		*response.headers_mut() = self.headers;
		response
	}
}

/// Signals the router to try another attempt or another backend.
#[derive(Debug)]
pub struct RetryableError {
	pub message: String,
	pub response: Option<CapturedResponse>,
}

impl RetryableError {
	pub fn new(message: impl Into<String>) -> Self {
		RetryableError {
			message: message.into(),
			response: None,
		}
	}

	pub fn with_response(message: impl Into<String>, response: CapturedResponse) -> Self {
		RetryableError {
			message: message.into(),
			response: Some(response),
		}
	}
}

#[derive(Debug)]
pub enum CallError {
	Retryable(RetryableError),
	Fatal(ProxyError),
}

impl From<RetryableError> for CallError {
	fn from(err: RetryableError) -> Self {
		CallError::Retryable(err)
	}
}

pub struct ProxyRouter {
	registry: Arc<Registry>,
	transport: UpstreamTransport,
	num_retries: u32,
	pipeline: Arc<ResponseParserPipeline>,
	overrides: HashMap<String, Arc<ResponseParserPipeline>>,
	log_parsed_response: bool,
	log_parsed_stream: bool,
}

impl ProxyRouter {
	pub fn new(registry: Arc<Registry>, config: &Config) -> anyhow::Result<ProxyRouter> {
		let logging = &config.proxy_settings.logging;
		Ok(ProxyRouter {
			registry,
			transport: UpstreamTransport::new()?,
			num_retries: config.router_settings.num_retries(),
			pipeline: Arc::new(parsers::global_pipeline(config)),
			overrides: parsers::backend_overrides(config),
			log_parsed_response: logging.log_parsed_response,
			log_parsed_stream: logging.log_parsed_stream(),
		})
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	fn pipeline_for(&self, backend_name: &str) -> Arc<ResponseParserPipeline> {
		self
			.overrides
			.get(backend_name)
			.cloned()
			.unwrap_or_else(|| self.pipeline.clone())
	}

	pub async fn forward_request(
		&self,
		request: ForwardRequest,
		log: &Arc<RequestLogRecorder>,
		cancel: &CancellationToken,
	) -> Result<Response, ProxyError> {
		info!(
			model = %request.model,
			path = %request.path,
			stream = request.is_stream,
			"received request"
		);
		log.configure_parsed_logging(self.log_parsed_response, self.log_parsed_stream);

		let route = self.registry.route(&request.model);
		if route.is_empty() {
			return Err(ProxyError::ModelNotFound(request.model.clone()));
		}
		info!(
			model = %request.model,
			chain = %route.iter().map(|b| b.name.as_str()).join(", "),
			"built route"
		);
		log.record_route(route.iter().map(|b| b.name.clone()).collect());

		let mut last_error_response: Option<CapturedResponse> = None;
		let mut last_error_message: Option<String> = None;

		for (i, backend) in route.iter().enumerate() {
			info!(
				backend = %backend.name,
				position = i + 1,
				chain_len = route.len(),
				"attempting backend"
			);
			match self
				.call_backend_with_retries(backend, &request, log, cancel)
				.await
			{
				Ok(response) => {
					info!(model = %request.model, backend = %backend.name, "request served");
					return Ok(response);
				},
				Err(CallError::Fatal(err)) => return Err(err),
				Err(CallError::Retryable(err)) => {
					warn!(backend = %backend.name, "backend failed: {}", err.message);
					last_error_message = Some(err.message);
					if let Some(response) = err.response {
						last_error_response = Some(response);
					}
				},
			}
		}

		// On full exhaustion an upstream body trumps a synthesised error:
		// the client gets whatever the last backend actually said.
		if let Some(response) = last_error_response {
			warn!(model = %request.model, "all backends failed, returning last error response");
			return Ok(response.into_response());
		}

		let detail = last_error_message
			.unwrap_or_else(|| format!("All backends failed for model '{}'", request.model));
		log.record_error(&detail, RecordedErrorType::Other);
		log.finalize(Outcome::Error);
		Err(ProxyError::AllBackendsFailed(detail))
	}

	async fn call_backend_with_retries(
		&self,
		backend: &Arc<Backend>,
		request: &ForwardRequest,
		log: &Arc<RequestLogRecorder>,
		cancel: &CancellationToken,
	) -> Result<Response, CallError> {
		let attempts = self.num_retries.max(1);
		let mut delay = DEFAULT_RETRY_DELAY;
		let mut last_error: Option<RetryableError> = None;

		let pipeline = self.pipeline_for(&backend.name);
		let ctx = ParserContext {
			path: request.path.clone(),
			model: request.model.clone(),
			backend: backend.name.clone(),
			is_stream: request.is_stream,
		};

		for attempt in 1..=attempts {
			match self
				.transport
				.execute(backend, request, attempt, &pipeline, &ctx, log, cancel)
				.await
			{
				Ok(response) => {
					info!(backend = %backend.name, attempt, "backend succeeded");
					return Ok(response);
				},
				Err(CallError::Fatal(err)) => return Err(CallError::Fatal(err)),
				Err(CallError::Retryable(err)) => {
					warn!(backend = %backend.name, attempt, "attempt failed: {}", err.message);
					last_error = Some(err);
				},
			}

			if attempt < attempts {
				info!(backend = %backend.name, delay_ms = delay.as_millis() as u64, "retrying");
				tokio::time::sleep(delay).await;
				delay = (delay * 2).min(MAX_RETRY_DELAY);
			}
		}

		Err(CallError::Retryable(last_error.unwrap_or_else(|| {
			RetryableError::new(format!("{} exhausted without success", backend.name))
		})))
	}
}
