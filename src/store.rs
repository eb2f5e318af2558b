//! Backend registry.
//!
//! One read/write lock guards the backend map and the fallback map. Readers
//! hold it only long enough to copy the `Arc<Backend>` records they will
//! use, so a reload never perturbs an in-flight request.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use tracing::warn;

use crate::backend::Backend;
use crate::config::Config;

#[derive(Debug, Default)]
struct RegistryState {
	backends: HashMap<String, Arc<Backend>>,
	fallbacks: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct Registry {
	state: RwLock<RegistryState>,
}

impl Registry {
	pub fn from_config(config: &Config) -> anyhow::Result<Registry> {
		let state = build_state(config);
		if state.backends.is_empty() {
			bail!("no backends found in config");
		}
		Ok(Registry {
			state: RwLock::new(state),
		})
	}

	/// The ordered chain for one request: primary then fallbacks, duplicates
	/// and unknown names dropped. Empty when the model is not defined.
	pub fn route(&self, model_name: &str) -> Vec<Arc<Backend>> {
		let state = self.state.read().expect("registry lock poisoned");
		let mut seen: HashSet<String> = HashSet::new();
		let mut order: Vec<Arc<Backend>> = Vec::new();

		let fallbacks = state.fallbacks.get(model_name).cloned().unwrap_or_default();
		for name in std::iter::once(model_name.to_string()).chain(fallbacks) {
			if name.is_empty() || !seen.insert(name.clone()) {
				continue;
			}
			match state.backends.get(&name) {
				Some(backend) => order.push(backend.clone()),
				None => warn!(model = %name, "model referenced but not defined"),
			}
		}
		order
	}

	/// Register or replace a backend at runtime. Returns whether an existing
	/// entry was replaced.
	pub fn register(&self, backend: Backend, fallbacks: Option<Vec<String>>) -> bool {
		let mut state = self.state.write().expect("registry lock poisoned");
		let name = backend.name.clone();
		let replaced = state.backends.insert(name.clone(), Arc::new(backend)).is_some();
		if let Some(fallbacks) = fallbacks {
			state.fallbacks.insert(name, fallbacks);
		}
		replaced
	}

	/// Returns whether the backend existed and was removed.
	pub fn unregister(&self, name: &str) -> bool {
		let mut state = self.state.write().expect("registry lock poisoned");
		let existed = state.backends.remove(name).is_some();
		if existed {
			state.fallbacks.remove(name);
		}
		existed
	}

	pub fn list(&self) -> Vec<String> {
		let state = self.state.read().expect("registry lock poisoned");
		let mut names: Vec<String> = state.backends.keys().cloned().collect();
		names.sort();
		names
	}

	pub fn allowed_keys_for(&self, model_name: &str) -> Option<crate::config::AllowedKeys> {
		let state = self.state.read().expect("registry lock poisoned");
		state
			.backends
			.get(model_name)
			.and_then(|b| b.allowed_keys.clone())
	}

	/// Atomic swap of both maps from a fresh snapshot.
	pub fn reload(&self, config: &Config) {
		let new_state = build_state(config);
		let mut state = self.state.write().expect("registry lock poisoned");
		*state = new_state;
	}
}

fn build_state(config: &Config) -> RegistryState {
	let mut backends = HashMap::new();
	for entry in &config.model_list {
		match Backend::from_entry(entry) {
			Some(backend) => {
				backends.insert(backend.name.clone(), Arc::new(backend));
			},
			None => {
				warn!(model = %entry.model_name, "skipping model entry without api_base");
			},
		}
	}
	RegistryState {
		backends,
		fallbacks: config.router_settings.fallback_map(),
	}
}
