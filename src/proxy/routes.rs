//! Endpoint handlers.
//!
//! Every proxied endpoint funnels through [`handle_proxy_request`]: read and
//! validate the body, resolve the caller's key, take a concurrency slot,
//! forward through the router, and tie the slot's lifetime to the response
//! body so streamed responses hold it until the last byte.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::app::AppState;
use super::{Dialect, ProxyError};
use crate::backend::{ApiType, Backend};
use crate::concurrency::{ConcurrencyError, ConcurrencySlot, resolve_key_config};
use crate::config::{ModelEntry, normalize_request_model};
use crate::router::ForwardRequest;
use crate::telemetry::{Outcome, RecordedErrorType, RequestLogRecorder};

const BODY_LIMIT: usize = 32 * 1024 * 1024;

pub async fn chat_completions(State(state): State<AppState>, request: Request) -> Response {
	handle_proxy_request(state, request, Dialect::OpenAi).await
}

pub async fn responses(State(state): State<AppState>, request: Request) -> Response {
	handle_proxy_request(state, request, Dialect::OpenAi).await
}

pub async fn embeddings(State(state): State<AppState>, request: Request) -> Response {
	handle_proxy_request(state, request, Dialect::OpenAi).await
}

pub async fn rerank(State(state): State<AppState>, request: Request) -> Response {
	handle_proxy_request(state, request, Dialect::OpenAi).await
}

pub async fn messages(State(state): State<AppState>, request: Request) -> Response {
	handle_proxy_request(state, request, Dialect::Anthropic).await
}

async fn handle_proxy_request(state: AppState, request: Request, dialect: Dialect) -> Response {
	let path = request.uri().path().to_string();
	let query = request.uri().query().unwrap_or_default().to_string();
	let method = request.method().to_string();
	let (parts, body) = request.into_parts();

	let log_for_error = |model: &str, is_stream: bool, body: &[u8]| {
		let log = RequestLogRecorder::new(model, is_stream, &path, state.log_sink.clone());
		log.record_request(&method, &query, &parts.headers, body);
		log
	};

	let body = match axum::body::to_bytes(body, BODY_LIMIT).await {
		Ok(body) => body,
		Err(_) => {
			// The usual cause is the client going away mid-read.
			let log = log_for_error("unknown", false, b"");
			log.record_error("failed to read request body", RecordedErrorType::ClientDisconnect);
			log.finalize(Outcome::Cancelled);
			return ProxyError::ClientDisconnected.respond(dialect);
		},
	};

	let payload: Map<String, Value> = match serde_json::from_slice::<Value>(&body) {
		Ok(Value::Object(payload)) => payload,
		Ok(_) => {
			let log = log_for_error("unknown", false, &body);
			log.record_error("payload must be a JSON object", RecordedErrorType::Other);
			log.finalize(Outcome::Error);
			return ProxyError::InvalidShape.respond(dialect);
		},
		Err(err) => {
			let log = log_for_error("unknown", false, &body);
			log.record_error(&format!("invalid json: {err}"), RecordedErrorType::Other);
			log.finalize(Outcome::Error);
			return ProxyError::InvalidJson.respond(dialect);
		},
	};

	let Some(raw_model) = payload
		.get("model")
		.and_then(Value::as_str)
		.filter(|m| !m.is_empty())
	else {
		let log = log_for_error("unknown", false, &body);
		log.record_error("missing model parameter", RecordedErrorType::Other);
		log.finalize(Outcome::Error);
		return ProxyError::MissingModel.respond(dialect);
	};
	let model = normalize_request_model(raw_model);

	let requires_messages =
		path.contains("/chat/completions") || path.contains("/messages");
	if requires_messages {
		let valid = payload
			.get("messages")
			.and_then(Value::as_array)
			.is_some_and(|m| !m.is_empty());
		if !valid {
			let log = log_for_error(&model, false, &body);
			log.record_error("missing messages array", RecordedErrorType::Other);
			log.finalize(Outcome::Error);
			return ProxyError::MissingMessages.respond(dialect);
		}
	}

	let is_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
	let log = log_for_error(&model, is_stream, &body);
	info!(model = %model, stream = is_stream, path = %path, "processing request");

	match proxy_request(
		&state, &parts, dialect, &path, &query, body, payload, &model, is_stream, &log,
	)
	.await
	{
		Ok(response) => response,
		Err(err) => {
			if !log.is_finalized() {
				let (outcome, error_type) = match &err {
					ProxyError::ClientDisconnected => {
						(Outcome::Cancelled, RecordedErrorType::ClientDisconnect)
					},
					ProxyError::QueueTimeout => (Outcome::Error, RecordedErrorType::Timeout),
					_ => (Outcome::Error, RecordedErrorType::Other),
				};
				log.record_error(&err.to_string(), error_type);
				log.finalize(outcome);
			}
			err.respond(dialect)
		},
	}
}

#[allow(clippy::too_many_arguments)]
async fn proxy_request(
	state: &AppState,
	parts: &http::request::Parts,
	dialect: Dialect,
	path: &str,
	query: &str,
	body: Bytes,
	payload: Map<String, Value>,
	model: &str,
	is_stream: bool,
	log: &std::sync::Arc<RequestLogRecorder>,
) -> Result<Response, ProxyError> {
	let ctx = state.validator.validate(&parts.headers)?;
	let allowed = state.registry.allowed_keys_for(model);
	state
		.validator
		.check_model_access(&ctx, model, allowed.as_ref())?;

	// The messages dialect is pass-through only; translating for OpenAI
	// backends is a separate collaborator.
	if dialect == Dialect::Anthropic {
		let route = state.registry.route(model);
		if let Some(primary) = route.first()
			&& primary.api_type != ApiType::Anthropic
		{
			return Err(ProxyError::UnsupportedBackend(primary.name.clone()));
		}
	}

	let cancel = CancellationToken::new();
	let key_config = resolve_key_config(&state.config, ctx.key_id.as_deref());
	let slot = state
		.concurrency
		.acquire(ctx.key_id.as_deref(), key_config, &cancel)
		.await
		.map_err(|err| match err {
			ConcurrencyError::QueueTimeout(_) => ProxyError::QueueTimeout,
			ConcurrencyError::ClientDisconnected(_) => ProxyError::ClientDisconnected,
		})?;
	debug!(
		key = %slot.key,
		wait_ms = slot.wait_time.as_millis() as u64,
		"concurrency slot held"
	);

	let forward = ForwardRequest {
		model: model.to_string(),
		path: path.to_string(),
		query: query.to_string(),
		body,
		payload,
		is_stream,
		headers: parts.headers.clone(),
	};

	let result = state.router.forward_request(forward, log, &cancel).await;
	match result {
		Ok(response) => {
			if !is_stream && !log.is_finalized() {
				log.finalize(Outcome::Success);
			}
			Ok(attach_slot(response, slot))
		},
		// On error the slot drops with this frame, releasing the key's budget.
		Err(err) => Err(err),
	}
}

/// Tie the slot to the response body so it is released when the last byte is
/// written or the client goes away, never earlier.
fn attach_slot(response: Response, slot: ConcurrencySlot) -> Response {
	let (parts, body) = response.into_parts();
	let mut stream = body.into_data_stream();
	let guarded = async_stream::stream! {
		let _slot = slot;
		while let Some(item) = stream.next().await {
			yield item;
		}
	};
	Response::from_parts(parts, Body::from_stream(guarded))
}

static MODELS_CREATED_AT: Lazy<i64> = Lazy::new(|| chrono::Utc::now().timestamp());

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
	let data: Vec<Value> = state
		.registry
		.list()
		.into_iter()
		.map(|name| {
			json!({
				"id": name,
				"object": "model",
				"created": *MODELS_CREATED_AT,
				"owned_by": "modelgate",
			})
		})
		.collect();
	Json(json!({"object": "list", "data": data}))
}

#[derive(Debug, Deserialize)]
pub struct RegisterModelRequest {
	#[serde(flatten)]
	pub entry: ModelEntry,
	#[serde(default)]
	pub fallbacks: Option<Vec<String>>,
}

pub async fn register_model(
	State(state): State<AppState>,
	Json(request): Json<RegisterModelRequest>,
) -> Response {
	let name = request.entry.model_name.clone();
	let Some(backend) = Backend::from_entry(&request.entry) else {
		return ProxyError::InvalidShape.respond(Dialect::OpenAi);
	};
	let replaced = state.registry.register(backend, request.fallbacks);
	info!(model = %name, replaced, "registered backend");
	Json(json!({"registered": name, "replaced": replaced})).into_response()
}

pub async fn unregister_model(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Response {
	if state.registry.unregister(&name) {
		info!(model = %name, "unregistered backend");
		Json(json!({"unregistered": name})).into_response()
	} else {
		(
			StatusCode::NOT_FOUND,
			Json(json!({"error": {"message": format!("model '{name}' not found")}})),
		)
			.into_response()
	}
}

pub async fn concurrency_metrics(State(state): State<AppState>) -> Json<Value> {
	let metrics = state.concurrency.metrics();
	Json(serde_json::to_value(metrics).unwrap_or_else(|_| json!({})))
}
