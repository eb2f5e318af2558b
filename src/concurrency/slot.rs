//! RAII slot handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::manager::ConcurrencyManager;

/// One unit of a key's concurrency budget. Released exactly once: explicit
/// `release` is preferred, drop is the backstop for unwind paths.
#[derive(Debug)]
pub struct ConcurrencySlot {
	manager: Arc<ConcurrencyManager>,
	pub key: String,
	pub request_id: String,
	pub wait_time: Duration,
	released: AtomicBool,
}

impl ConcurrencySlot {
	pub(super) fn new(
		manager: Arc<ConcurrencyManager>,
		key: String,
		request_id: String,
		wait_time: Duration,
	) -> Self {
		ConcurrencySlot {
			manager,
			key,
			request_id,
			wait_time,
			released: AtomicBool::new(false),
		}
	}

	pub fn release(&self) {
		if self.released.swap(true, Ordering::SeqCst) {
			return;
		}
		self.manager.release(&self.key, &self.request_id);
	}
}

impl Drop for ConcurrencySlot {
	fn drop(&mut self) {
		self.release();
	}
}
