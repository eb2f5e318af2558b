//! The concurrency manager: per-key active counters plus one global wait
//! queue ordered by `(priority, enqueue order)`.
//!
//! All state mutations happen under one mutex, held only for short sections
//! that never span an await; waiting happens outside it with bounded sleeps
//! so cancellation and deadlines are observed within 500 ms. A waiter that
//! gives up — by error or by its future being dropped, which is how a
//! client disconnect surfaces in the server wiring — is abandoned under the
//! same lock: its entry becomes a tombstone, or, if the slot was granted in
//! the race window, the slot is given straight back. Tombstones are purged
//! lazily once the queue grows past a threshold.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::slot::ConcurrencySlot;
use super::{ConcurrencyError, KeyConcurrencyConfig};

pub const UNAUTHENTICATED_KEY: &str = "__unauthenticated__";

const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CLEANUP_THRESHOLD: usize = 100;

#[derive(Debug)]
struct ReadyEvent {
	set: AtomicBool,
	notify: Notify,
}

impl ReadyEvent {
	fn new() -> Self {
		ReadyEvent {
			set: AtomicBool::new(false),
			notify: Notify::new(),
		}
	}

	fn set(&self) {
		self.set.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	fn is_set(&self) -> bool {
		self.set.load(Ordering::SeqCst)
	}
}

#[derive(Debug)]
struct QueuedRequest {
	priority: i32,
	/// Monotonic enqueue order; doubles as the FIFO timestamp and the
	/// unique tie-breaker.
	seq: u64,
	request_id: String,
	key: String,
	ready: ReadyEvent,
	cancelled: AtomicBool,
}

impl QueuedRequest {
	fn order_key(&self) -> (i32, u64) {
		(self.priority, self.seq)
	}

	fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}
}

/// Abandons the queued entry if the acquire future never completes.
struct QueueAbandonGuard {
	manager: Arc<ConcurrencyManager>,
	queued: Arc<QueuedRequest>,
	armed: bool,
}

impl Drop for QueueAbandonGuard {
	fn drop(&mut self) {
		if self.armed {
			self.manager.abandon_queued(&self.queued);
		}
	}
}

#[derive(Debug, Default)]
struct KeyState {
	concurrency_limit: i64,
	priority: i32,
	active_ids: HashSet<String>,
	total_requests: u64,
	total_queued: u64,
	total_wait_ms: f64,
	max_queue_depth: usize,
}

impl KeyState {
	fn active_count(&self) -> usize {
		self.active_ids.len()
	}

	fn has_available_slot(&self) -> bool {
		self.concurrency_limit <= 0 || (self.active_count() as i64) < self.concurrency_limit
	}
}

#[derive(Debug, Default)]
struct Inner {
	key_states: HashMap<String, KeyState>,
	wait_queue: Vec<Arc<QueuedRequest>>,
	pending: HashMap<String, Arc<QueuedRequest>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyMetrics {
	pub global_queue_depth: usize,
	pub active_requests_by_key: HashMap<String, usize>,
	pub queued_requests_by_key: HashMap<String, usize>,
	pub key_states: HashMap<String, KeyMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyMetrics {
	pub concurrency_limit: i64,
	pub priority: i32,
	pub active_count: usize,
	pub total_requests: u64,
	pub total_queued: u64,
	pub max_queue_depth: usize,
	pub avg_wait_time_ms: f64,
}

#[derive(Debug, Default)]
pub struct ConcurrencyManager {
	inner: Mutex<Inner>,
	seq: AtomicU64,
}

impl ConcurrencyManager {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		self.inner.lock().expect("concurrency lock poisoned")
	}

	/// Acquire a slot for `key_id`, queueing when the key is at its limit.
	///
	/// The returned slot must be released exactly once; it releases itself
	/// on drop as a backstop. Limits and priority are refreshed from the
	/// current values on every call so hot reloads take effect.
	pub async fn acquire(
		self: &Arc<Self>,
		key_id: Option<&str>,
		config: KeyConcurrencyConfig,
		cancel: &CancellationToken,
	) -> Result<ConcurrencySlot, ConcurrencyError> {
		let key = key_id.unwrap_or(UNAUTHENTICATED_KEY).to_string();
		let request_id = new_request_id();
		let enqueued_at = Instant::now();

		let queued = {
			let mut inner = self.lock();
			let state = inner.key_states.entry(key.clone()).or_default();
			state.concurrency_limit = config.concurrency_limit;
			state.priority = config.priority;
			state.total_requests += 1;

			if state.has_available_slot() {
				state.active_ids.insert(request_id.clone());
				debug!(
					key = %key,
					active = state.active_count(),
					limit = state.concurrency_limit,
					"concurrency slot acquired immediately"
				);
				return Ok(ConcurrencySlot::new(
					self.clone(),
					key,
					request_id,
					Duration::ZERO,
				));
			}

			let queued = Arc::new(QueuedRequest {
				priority: config.priority,
				seq: self.seq.fetch_add(1, Ordering::SeqCst),
				request_id: request_id.clone(),
				key: key.clone(),
				ready: ReadyEvent::new(),
				cancelled: AtomicBool::new(false),
			});
			state.total_queued += 1;
			inner.wait_queue.push(queued.clone());
			inner.pending.insert(request_id.clone(), queued.clone());

			let depth = inner
				.wait_queue
				.iter()
				.filter(|q| q.key == key && !q.is_cancelled())
				.count();
			let state = inner.key_states.get_mut(&key).expect("state created above");
			state.max_queue_depth = state.max_queue_depth.max(depth);
			info!(
				key = %key,
				priority = config.priority,
				queue_depth = depth,
				limit = config.concurrency_limit,
				"request queued"
			);
			queued
		};

		let mut guard = QueueAbandonGuard {
			manager: self.clone(),
			queued: queued.clone(),
			armed: true,
		};
		let deadline = config
			.queue_timeout
			.map(|t| enqueued_at + Duration::from_secs_f64(t));
		// On error the guard abandons the entry, handing a slot granted in
		// the race window straight back.
		self.wait_for_slot(&queued, deadline, cancel).await?;
		guard.armed = false;

		let wait_time = enqueued_at.elapsed();
		{
			let mut inner = self.lock();
			if let Some(state) = inner.key_states.get_mut(&key) {
				state.total_wait_ms += wait_time.as_secs_f64() * 1000.0;
			}
		}
		info!(
			key = %key,
			wait_ms = wait_time.as_millis() as u64,
			"request dequeued"
		);
		Ok(ConcurrencySlot::new(self.clone(), key, request_id, wait_time))
	}

	async fn wait_for_slot(
		&self,
		queued: &Arc<QueuedRequest>,
		deadline: Option<Instant>,
		cancel: &CancellationToken,
	) -> Result<(), ConcurrencyError> {
		loop {
			if queued.ready.is_set() {
				return Ok(());
			}
			let mut wait = DISCONNECT_POLL_INTERVAL;
			if let Some(deadline) = deadline {
				let remaining = deadline.saturating_duration_since(Instant::now());
				if remaining.is_zero() {
					return Err(ConcurrencyError::QueueTimeout(queued.key.clone()));
				}
				wait = wait.min(remaining);
			}
			if cancel.is_cancelled() {
				return Err(ConcurrencyError::ClientDisconnected(queued.key.clone()));
			}
			// A wake can slip between the is_set check and this sleep; the
			// bounded wait bounds the extra latency to one poll interval.
			let _ = tokio::time::timeout(wait, queued.ready.notify.notified()).await;
		}
	}

	/// Release a slot and wake the best queued request for the key.
	/// Idempotent: releasing an unknown or already-released id is a no-op.
	pub fn release(&self, key: &str, request_id: &str) {
		let mut inner = self.lock();
		let Some(state) = inner.key_states.get_mut(key) else {
			warn!(key = %key, "release called for unknown key");
			return;
		};
		if !state.active_ids.remove(request_id) {
			debug!(key = %key, request_id = %request_id, "release for already-released request");
			return;
		}
		debug!(
			key = %key,
			active = state.active_count(),
			limit = state.concurrency_limit,
			"concurrency slot released"
		);
		Self::signal_next_queued(&mut inner, key);
	}

	/// Wake the minimum `(priority, seq)` live waiter for `key`, charging
	/// the key before the event fires so no other request can steal the
	/// capacity in between.
	fn signal_next_queued(inner: &mut Inner, key: &str) {
		let Some(state) = inner.key_states.get(key) else {
			return;
		};
		if !state.has_available_slot() {
			return;
		}
		let next = inner
			.wait_queue
			.iter()
			.filter(|q| q.key == key && !q.is_cancelled() && !q.ready.is_set())
			.min_by_key(|q| q.order_key())
			.cloned();
		let Some(next) = next else {
			return;
		};
		let state = inner.key_states.get_mut(key).expect("checked above");
		state.active_ids.insert(next.request_id.clone());
		let active = state.active_count();
		next.ready.set();
		inner.pending.remove(&next.request_id);
		debug!(
			key = %key,
			request_id = %next.request_id,
			active,
			"signaled queued request"
		);
	}

	/// A waiter gave up. Under the lock, either tombstone the entry, or —
	/// when the slot was granted between the waiter's last poll and now —
	/// give the slot back so the key's capacity is not leaked.
	fn abandon_queued(&self, queued: &Arc<QueuedRequest>) {
		let granted = {
			let mut inner = self.lock();
			if queued.ready.is_set() {
				true
			} else {
				queued.cancelled.store(true, Ordering::SeqCst);
				inner.pending.remove(&queued.request_id);
				debug!(request_id = %queued.request_id, "abandoned queued request");
				false
			}
		};
		if granted {
			self.release(&queued.key, &queued.request_id);
		}
	}

	/// Rebuild the wait queue without tombstones.
	fn cleanup_cancelled(inner: &mut Inner) {
		inner.wait_queue.retain(|q| !q.is_cancelled());
	}

	pub fn metrics(&self) -> ConcurrencyMetrics {
		let mut inner = self.lock();
		if inner.wait_queue.len() > CLEANUP_THRESHOLD {
			Self::cleanup_cancelled(&mut inner);
		}

		let mut active_by_key = HashMap::new();
		let mut queued_by_key = HashMap::new();
		let mut key_states = HashMap::new();
		for (key, state) in &inner.key_states {
			let queued = inner
				.wait_queue
				.iter()
				.filter(|q| &q.key == key && !q.is_cancelled())
				.count();
			active_by_key.insert(key.clone(), state.active_count());
			queued_by_key.insert(key.clone(), queued);
			let avg_wait = if state.total_queued > 0 {
				state.total_wait_ms / state.total_queued as f64
			} else {
				0.0
			};
			key_states.insert(
				key.clone(),
				KeyMetrics {
					concurrency_limit: state.concurrency_limit,
					priority: state.priority,
					active_count: state.active_count(),
					total_requests: state.total_requests,
					total_queued: state.total_queued,
					max_queue_depth: state.max_queue_depth,
					avg_wait_time_ms: avg_wait,
				},
			);
		}
		let global_queue_depth = inner.wait_queue.iter().filter(|q| !q.is_cancelled()).count();
		ConcurrencyMetrics {
			global_queue_depth,
			active_requests_by_key: active_by_key,
			queued_requests_by_key: queued_by_key,
			key_states,
		}
	}

	#[cfg(test)]
	pub fn active_count(&self, key: &str) -> usize {
		let inner = self.lock();
		inner
			.key_states
			.get(key)
			.map(|s| s.active_count())
			.unwrap_or(0)
	}
}

fn new_request_id() -> String {
	use rand::Rng;
	let mut rng = rand::rng();
	(0..16)
		.map(|_| format!("{:x}", rng.random_range(0..16)))
		.collect()
}
