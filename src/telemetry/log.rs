//! Per-request logging.
//!
//! Every request gets a recorder that accumulates the request line, route,
//! per-attempt details, response data, typed error events and usage stats.
//! `finalize` fires exactly once; the assembled record then goes to the
//! configured sink, which persists it off the request path. A process-wide
//! pending counter lets shutdown wait for in-flight writes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error};

const BODY_CAPTURE_LIMIT: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
	Success,
	Error,
	Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordedErrorType {
	SseStreamError,
	HttpRetryable,
	Timeout,
	ConnectionError,
	ClientDisconnect,
	Other,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
	Request {
		method: String,
		query: String,
		headers: Vec<(String, String)>,
		body: String,
	},
	Route {
		backends: Vec<String>,
	},
	BackendAttempt {
		backend: String,
		attempt: u32,
		url: String,
	},
	BackendResponse {
		status: u16,
		headers: Vec<(String, String)>,
		body: String,
	},
	StreamHeaders {
		status: u16,
		headers: Vec<(String, String)>,
	},
	StreamChunk {
		bytes: usize,
	},
	ParsedResponse {
		status: u16,
		body: String,
	},
	ParsedStreamChunk {
		body: String,
	},
	Error {
		error_type: RecordedErrorType,
		message: String,
	},
	Usage {
		usage: Value,
	},
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
	pub timestamp: DateTime<Utc>,
	pub model: String,
	pub path: String,
	pub is_stream: bool,
	pub outcome: Outcome,
	pub duration_ms: u64,
	pub events: Vec<LogEvent>,
}

pub trait LogSink: Send + Sync {
	fn write(&self, record: LogRecord);
}

/// Sink for tests and for running without request logging.
#[derive(Debug, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
	fn write(&self, _record: LogRecord) {}
}

/// Writes one JSON line per request under the log directory, off the
/// request path. `wait_idle` is awaited at shutdown.
pub struct FileLogSink {
	dir: PathBuf,
	pending: Arc<PendingWrites>,
}

#[derive(Debug, Default)]
struct PendingWrites {
	count: AtomicUsize,
	notify: Notify,
}

impl FileLogSink {
	pub fn new(dir: PathBuf) -> Self {
		FileLogSink {
			dir,
			pending: Arc::new(PendingWrites::default()),
		}
	}

	pub async fn wait_idle(&self) {
		while self.pending.count.load(Ordering::SeqCst) > 0 {
			self.pending.notify.notified().await;
		}
	}
}

impl LogSink for FileLogSink {
	fn write(&self, record: LogRecord) {
		let dir = self.dir.clone();
		let pending = self.pending.clone();
		pending.count.fetch_add(1, Ordering::SeqCst);
		tokio::spawn(async move {
			let result = write_record(&dir, &record).await;
			if let Err(err) = result {
				error!(model = %record.model, "failed to write request log: {err}");
			}
			if pending.count.fetch_sub(1, Ordering::SeqCst) == 1 {
				pending.notify.notify_waiters();
			}
		});
	}
}

async fn write_record(dir: &PathBuf, record: &LogRecord) -> std::io::Result<()> {
	tokio::fs::create_dir_all(dir).await?;
	let safe_model: String = record
		.model
		.chars()
		.map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
		.take(48)
		.collect();
	let filename = format!(
		"{}_{}.json",
		record.timestamp.format("%Y%m%d_%H%M%S%.3f"),
		safe_model
	);
	let line = serde_json::to_vec(record).unwrap_or_default();
	tokio::fs::write(dir.join(filename), line).await
}

#[derive(Debug)]
struct LogState {
	model: String,
	path: String,
	is_stream: bool,
	events: Vec<LogEvent>,
	finalized: Option<Outcome>,
	log_parsed_response: bool,
	log_parsed_stream: bool,
}

pub struct RequestLogRecorder {
	state: Mutex<LogState>,
	started: Instant,
	sink: Arc<dyn LogSink>,
}

impl RequestLogRecorder {
	pub fn new(model: &str, is_stream: bool, path: &str, sink: Arc<dyn LogSink>) -> Arc<Self> {
		Arc::new(RequestLogRecorder {
			state: Mutex::new(LogState {
				model: model.to_string(),
				path: path.to_string(),
				is_stream,
				events: Vec::new(),
				finalized: None,
				log_parsed_response: false,
				log_parsed_stream: false,
			}),
			started: Instant::now(),
			sink,
		})
	}

	pub fn configure_parsed_logging(&self, response: bool, stream: bool) {
		let mut state = self.state.lock().expect("log lock poisoned");
		state.log_parsed_response = response;
		state.log_parsed_stream = stream;
	}

	fn push(&self, event: LogEvent) {
		let mut state = self.state.lock().expect("log lock poisoned");
		if state.finalized.is_some() {
			return;
		}
		state.events.push(event);
	}

	pub fn record_request(&self, method: &str, query: &str, headers: &HeaderMap, body: &[u8]) {
		self.push(LogEvent::Request {
			method: method.to_string(),
			query: query.to_string(),
			headers: sanitize_headers(headers),
			body: capture_body(body),
		});
	}

	pub fn record_route(&self, backends: Vec<String>) {
		self.push(LogEvent::Route { backends });
	}

	pub fn record_backend_attempt(&self, backend: &str, attempt: u32, url: &str) {
		debug!(backend = %backend, attempt, url = %url, "backend attempt");
		self.push(LogEvent::BackendAttempt {
			backend: backend.to_string(),
			attempt,
			url: url.to_string(),
		});
	}

	pub fn record_backend_response(&self, status: u16, headers: &HeaderMap, body: &[u8]) {
		self.push(LogEvent::BackendResponse {
			status,
			headers: sanitize_headers(headers),
			body: capture_body(body),
		});
	}

	pub fn record_stream_headers(&self, status: u16, headers: &HeaderMap) {
		self.push(LogEvent::StreamHeaders {
			status,
			headers: sanitize_headers(headers),
		});
	}

	pub fn record_stream_chunk(&self, chunk: &[u8]) {
		self.push(LogEvent::StreamChunk { bytes: chunk.len() });
	}

	pub fn record_parsed_response(&self, status: u16, body: &[u8]) {
		if !self.state.lock().expect("log lock poisoned").log_parsed_response {
			return;
		}
		self.push(LogEvent::ParsedResponse {
			status,
			body: capture_body(body),
		});
	}

	pub fn record_parsed_stream_chunk(&self, chunk: &[u8]) {
		if !self.state.lock().expect("log lock poisoned").log_parsed_stream {
			return;
		}
		self.push(LogEvent::ParsedStreamChunk {
			body: capture_body(chunk),
		});
	}

	pub fn record_error(&self, message: &str, error_type: RecordedErrorType) {
		debug!(?error_type, "request error: {message}");
		self.push(LogEvent::Error {
			error_type,
			message: message.to_string(),
		});
	}

	pub fn record_usage_stats(&self, usage: Value) {
		self.push(LogEvent::Usage { usage });
	}

	pub fn is_finalized(&self) -> bool {
		self.state.lock().expect("log lock poisoned").finalized.is_some()
	}

	/// Idempotent; the first outcome wins and flushes the record.
	pub fn finalize(&self, outcome: Outcome) {
		let record = {
			let mut state = self.state.lock().expect("log lock poisoned");
			if state.finalized.is_some() {
				return;
			}
			state.finalized = Some(outcome);
			LogRecord {
				timestamp: Utc::now(),
				model: state.model.clone(),
				path: state.path.clone(),
				is_stream: state.is_stream,
				outcome,
				duration_ms: self.started.elapsed().as_millis() as u64,
				events: std::mem::take(&mut state.events),
			}
		};
		debug!(model = %record.model, outcome = ?outcome, "request finalized");
		self.sink.write(record);
	}
}

fn sanitize_headers(headers: &HeaderMap) -> Vec<(String, String)> {
	headers
		.iter()
		.map(|(name, value)| {
			let name_str = name.as_str().to_string();
			let value_str = match name.as_str() {
				"authorization" | "x-api-key" | "proxy-authorization" => "****".to_string(),
				_ => String::from_utf8_lossy(value.as_bytes()).to_string(),
			};
			(name_str, value_str)
		})
		.collect()
}

fn capture_body(body: &[u8]) -> String {
	let end = body.len().min(BODY_CAPTURE_LIMIT);
	String::from_utf8_lossy(&body[..end]).to_string()
}
