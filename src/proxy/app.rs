//! Application wiring.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use super::routes;
use crate::auth::AppKeyValidator;
use crate::concurrency::ConcurrencyManager;
use crate::config::Config;
use crate::router::ProxyRouter;
use crate::store::Registry;
use crate::telemetry::LogSink;

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub registry: Arc<Registry>,
	pub router: Arc<ProxyRouter>,
	pub concurrency: Arc<ConcurrencyManager>,
	pub validator: Arc<AppKeyValidator>,
	pub log_sink: Arc<dyn LogSink>,
}

impl AppState {
	pub fn from_config(config: Arc<Config>, log_sink: Arc<dyn LogSink>) -> anyhow::Result<AppState> {
		let registry = Arc::new(Registry::from_config(&config)?);
		let router = Arc::new(ProxyRouter::new(registry.clone(), &config)?);
		Ok(AppState {
			validator: Arc::new(AppKeyValidator::new(config.clone())),
			concurrency: Arc::new(ConcurrencyManager::new()),
			config,
			registry,
			router,
			log_sink,
		})
	}
}

pub fn build_router(state: AppState) -> Router {
	let mut router = Router::new()
		.route("/v1/chat/completions", post(routes::chat_completions))
		.route("/v1/messages", post(routes::messages))
		.route("/v1/embeddings", post(routes::embeddings))
		.route("/v1/rerank", post(routes::rerank))
		.route("/v1/models", get(routes::list_models))
		.route("/admin/models", post(routes::register_model))
		.route("/admin/models/{name}", delete(routes::unregister_model))
		.route("/admin/concurrency", get(routes::concurrency_metrics));
	if state.config.proxy_settings.enable_responses_endpoint {
		router = router.route("/v1/responses", post(routes::responses));
	}
	router.with_state(state)
}
