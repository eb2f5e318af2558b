//! Backend execution: outbound shaping, the buffered call path, and the
//! streaming transport with its initial-buffer error peek.
//!
//! Providers occasionally embed an error event as the very first SSE event
//! of a 200 response. Committing those bytes to the client would preclude
//! falling back to another backend, so the transport reads up to a small
//! threshold into memory first, checks for inline errors, and only then
//! hands the stream to the client. In the common case streaming proceeds
//! normally with the peeked bytes re-emitted first.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{
	Backend, build_backend_body, build_outbound_headers, filter_response_headers,
	is_retryable_status,
};
use crate::parsers::{ParserContext, ResponseParserPipeline, ResponseStreamParser};
use crate::router::{CallError, CapturedResponse, ForwardRequest, RetryableError};
use crate::sse::{STREAM_ERROR_CHECK_BUFFER_SIZE, detect_sse_stream_error};
use crate::telemetry::{Outcome, RecordedErrorType, RequestLogRecorder};

pub struct UpstreamTransport {
	http1: reqwest::Client,
	/// Prior-knowledge HTTP/2; on protocol error the call falls back once
	/// to the HTTP/1.1 client.
	http2: reqwest::Client,
}

impl UpstreamTransport {
	pub fn new() -> anyhow::Result<UpstreamTransport> {
		let http1 = reqwest::Client::builder()
			.connect_timeout(crate::backend::DEFAULT_TIMEOUT)
			.build()?;
		let http2 = reqwest::Client::builder()
			.connect_timeout(crate::backend::DEFAULT_TIMEOUT)
			.http2_prior_knowledge()
			.build()?;
		Ok(UpstreamTransport { http1, http2 })
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn execute(
		&self,
		backend: &Arc<Backend>,
		request: &ForwardRequest,
		attempt: u32,
		pipeline: &Arc<ResponseParserPipeline>,
		ctx: &ParserContext,
		log: &Arc<RequestLogRecorder>,
		cancel: &CancellationToken,
	) -> Result<Response, CallError> {
		let url = backend.build_url(&request.path, &request.query);
		let headers = build_outbound_headers(&request.headers, backend, request.is_stream);
		let body = build_backend_body(&request.payload, backend, &request.body, request.is_stream);
		log.record_backend_attempt(&backend.name, attempt, &url);
		debug!(
			backend = %backend.name,
			url = %url,
			stream = request.is_stream,
			http2 = backend.http2,
			body_bytes = body.len(),
			"executing backend request"
		);

		if request.is_stream {
			self
				.execute_streaming(backend, url, headers, body, pipeline, ctx, log, cancel)
				.await
		} else {
			self
				.execute_buffered(backend, url, headers, body, pipeline, ctx, log)
				.await
		}
	}

	/// Send once, falling back from HTTP/2 to HTTP/1.1 on a protocol error
	/// before any response bytes exist.
	async fn send(
		&self,
		backend: &Backend,
		url: &str,
		headers: &http::HeaderMap,
		body: &Bytes,
		timeout: Option<std::time::Duration>,
	) -> Result<reqwest::Response, reqwest::Error> {
		let send_with = |client: &reqwest::Client| {
			let mut builder = client
				.post(url)
				.headers(headers.clone())
				.body(body.clone());
			if let Some(timeout) = timeout {
				builder = builder.timeout(timeout);
			}
			builder.send()
		};
		if backend.http2 {
			match send_with(&self.http2).await {
				Ok(response) => Ok(response),
				Err(err) => {
					warn!(
						backend = %backend.name,
						url = %url,
						"HTTP/2 request failed ({err}); retrying with HTTP/1.1"
					);
					send_with(&self.http1).await
				},
			}
		} else {
			send_with(&self.http1).await
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn execute_buffered(
		&self,
		backend: &Arc<Backend>,
		url: String,
		headers: http::HeaderMap,
		body: Bytes,
		pipeline: &Arc<ResponseParserPipeline>,
		ctx: &ParserContext,
		log: &Arc<RequestLogRecorder>,
	) -> Result<Response, CallError> {
		let response = self
			.send(backend, &url, &headers, &body, Some(backend.timeout()))
			.await
			.map_err(|err| retryable_from_reqwest(err, backend, &url, log))?;

		let status = response.status();
		let response_headers = response.headers().clone();
		let response_body = response
			.bytes()
			.await
			.map_err(|err| retryable_from_reqwest(err, backend, &url, log))?;
		debug!(backend = %backend.name, status = status.as_u16(), "received response");
		log.record_backend_response(status.as_u16(), &response_headers, &response_body);

		if is_retryable_status(status) {
			let message = format!("{} returned status {}", backend.name, status.as_u16());
			log.record_error(&message, RecordedErrorType::HttpRetryable);
			return Err(
				RetryableError::with_response(
					message,
					CapturedResponse {
						status,
						headers: filter_response_headers(&response_headers),
						body: response_body,
					},
				)
				.into(),
			);
		}

		let content_type = response_headers
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok());
		let final_body = match pipeline.transform_response_body(&response_body, content_type, ctx) {
			Some(parsed) => {
				log.record_parsed_response(status.as_u16(), &parsed);
				if let Ok(Value::Object(payload)) = serde_json::from_slice::<Value>(&parsed)
					&& let Some(usage) = payload.get("usage")
				{
					log.record_usage_stats(usage.clone());
				}
				Bytes::from(parsed)
			},
			None => response_body,
		};

		Ok(build_response(
			status,
			filter_response_headers(&response_headers),
			Body::from(final_body),
		))
	}

	#[allow(clippy::too_many_arguments)]
	async fn execute_streaming(
		&self,
		backend: &Arc<Backend>,
		url: String,
		headers: http::HeaderMap,
		body: Bytes,
		pipeline: &Arc<ResponseParserPipeline>,
		ctx: &ParserContext,
		log: &Arc<RequestLogRecorder>,
		cancel: &CancellationToken,
	) -> Result<Response, CallError> {
		// No total timeout on a stream; the connect timeout still applies.
		let response = self
			.send(backend, &url, &headers, &body, None)
			.await
			.map_err(|err| retryable_from_reqwest(err, backend, &url, log))?;

		let status = response.status();
		let response_headers = response.headers().clone();
		log.record_stream_headers(status.as_u16(), &response_headers);

		if is_retryable_status(status) {
			let data = drain_response(response).await;
			log.record_backend_response(status.as_u16(), &response_headers, &data);
			let message = format!("stream request returned status {}", status.as_u16());
			log.record_error(&message, RecordedErrorType::HttpRetryable);
			return Err(
				RetryableError::with_response(
					message,
					CapturedResponse {
						status,
						headers: filter_response_headers(&response_headers),
						body: data,
					},
				)
				.into(),
			);
		}

		if status.as_u16() >= 400 {
			// Terminal upstream error: hand the body through as-is.
			let data = drain_response(response).await;
			log.record_backend_response(status.as_u16(), &response_headers, &data);
			if !log.is_finalized() {
				log.record_error(
					&format!("stream response status {}", status.as_u16()),
					RecordedErrorType::Other,
				);
				log.finalize(Outcome::Error);
			}
			return Ok(build_response(
				status,
				filter_response_headers(&response_headers),
				Body::from(data),
			));
		}

		// Initial-buffer phase: accumulate until the peek threshold or EOF,
		// with zero bytes committed to the client.
		let mut upstream = Box::pin(response.bytes_stream());
		let mut initial = BytesMut::new();
		let mut buffered_chunks: Vec<Bytes> = Vec::new();
		let mut exhausted = false;
		while initial.len() < STREAM_ERROR_CHECK_BUFFER_SIZE {
			match upstream.next().await {
				Some(Ok(chunk)) => {
					if chunk.is_empty() {
						continue;
					}
					log.record_stream_chunk(&chunk);
					initial.extend_from_slice(&chunk);
					buffered_chunks.push(chunk);
				},
				Some(Err(err)) => {
					// Nothing has reached the client yet, so this is fully
					// recoverable.
					return Err(retryable_from_reqwest(err, backend, &url, log));
				},
				None => {
					exhausted = true;
					break;
				},
			}
		}

		if let Some(error_message) = detect_sse_stream_error(&initial) {
			warn!(backend = %backend.name, url = %url, "detected inline SSE error: {error_message}");
			log.record_error(&error_message, RecordedErrorType::SseStreamError);
			// Read the tail opportunistically so the log and the last-chance
			// response carry the whole upstream body.
			let mut remaining = initial;
			if !exhausted {
				while let Some(next) = upstream.next().await {
					match next {
						Ok(chunk) => {
							log.record_stream_chunk(&chunk);
							remaining.extend_from_slice(&chunk);
						},
						Err(_) => break,
					}
				}
			}
			let mut captured_headers = filter_response_headers(&response_headers);
			if !captured_headers.contains_key(http::header::CONTENT_TYPE) {
				captured_headers.insert(
					http::header::CONTENT_TYPE,
					http::HeaderValue::from_static("text/event-stream"),
				);
			}
			return Err(
				RetryableError::with_response(
					error_message,
					CapturedResponse {
						status,
						headers: captured_headers,
						body: remaining.freeze(),
					},
				)
				.into(),
			);
		}

		debug!(backend = %backend.name, url = %url, "stream committed to client");
		let headers_to_client = filter_response_headers(&response_headers);
		let stream_parser = pipeline.create_stream_parser(ctx);
		let relay = relay_stream(
			upstream,
			buffered_chunks,
			exhausted,
			stream_parser,
			log.clone(),
			cancel.clone(),
		);
		Ok(build_response(status, headers_to_client, Body::from_stream(relay)))
	}
}

/// Finalises the request log as cancelled if the relay is dropped before it
/// completes, which is how a client disconnect surfaces.
struct RelayGuard {
	log: Arc<RequestLogRecorder>,
	done: bool,
}

impl Drop for RelayGuard {
	fn drop(&mut self) {
		if !self.done && !self.log.is_finalized() {
			self.log
				.record_error("stream cancelled by client", RecordedErrorType::ClientDisconnect);
			self.log.finalize(Outcome::Cancelled);
		}
	}
}

fn relay_stream(
	mut upstream: impl futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
	buffered_chunks: Vec<Bytes>,
	exhausted: bool,
	mut parser: Option<ResponseStreamParser>,
	log: Arc<RequestLogRecorder>,
	cancel: CancellationToken,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
	async_stream::stream! {
		let mut guard = RelayGuard { log: log.clone(), done: false };

		for chunk in buffered_chunks {
			for out in process_chunk(&mut parser, &log, &chunk) {
				yield Ok(out);
			}
		}

		if !exhausted {
			loop {
				// A disconnected client is observed before each upstream read.
				if cancel.is_cancelled() {
					log.record_error("stream cancelled by client", RecordedErrorType::ClientDisconnect);
					log.finalize(Outcome::Cancelled);
					guard.done = true;
					return;
				}
				match upstream.next().await {
					Some(Ok(chunk)) => {
						if chunk.is_empty() {
							continue;
						}
						log.record_stream_chunk(&chunk);
						for out in process_chunk(&mut parser, &log, &chunk) {
							yield Ok(out);
						}
					},
					Some(Err(err)) => {
						// Bytes already reached the client; no recovery is
						// possible beyond aborting the stream.
						log.record_error(&format!("streaming error: {err}"), RecordedErrorType::ConnectionError);
						log.finalize(Outcome::Error);
						guard.done = true;
						yield Err(std::io::Error::other(err));
						return;
					},
					None => break,
				}
			}
		}

		if let Some(parser) = parser.as_mut() {
			for out in parser.finish() {
				log.record_parsed_stream_chunk(&out);
				yield Ok(out);
			}
		}
		guard.done = true;
		log.finalize(Outcome::Success);
	}
}

fn process_chunk(
	parser: &mut Option<ResponseStreamParser>,
	log: &Arc<RequestLogRecorder>,
	chunk: &Bytes,
) -> Vec<Bytes> {
	let Some(parser) = parser.as_mut() else {
		return vec![chunk.clone()];
	};
	let parsed = parser.feed_bytes(chunk);
	if parsed.is_empty() {
		return Vec::new();
	}
	let mut combined = BytesMut::new();
	for piece in parsed {
		combined.extend_from_slice(&piece);
	}
	let combined = combined.freeze();
	log.record_parsed_stream_chunk(&combined);
	vec![combined]
}

async fn drain_response(response: reqwest::Response) -> Bytes {
	response.bytes().await.unwrap_or_default()
}

fn build_response(status: StatusCode, headers: http::HeaderMap, body: Body) -> Response {
	let mut response = Response::new(body);
	*response.status_mut() = status;
	*response.headers_mut() = headers;
	response
}

fn retryable_from_reqwest(
	err: reqwest::Error,
	backend: &Backend,
	url: &str,
	log: &Arc<RequestLogRecorder>,
) -> CallError {
	let error_type = if err.is_timeout() {
		RecordedErrorType::Timeout
	} else {
		RecordedErrorType::ConnectionError
	};
	let mut detail = format!("{} request error: {err}; url={url}", backend.name);
	if err.is_timeout() {
		detail.push_str(&format!("; timeout={}s", backend.timeout().as_secs_f64()));
	}
	warn!(backend = %backend.name, "{detail}");
	log.record_error(&detail, error_type);
	RetryableError::new(detail).into()
}
