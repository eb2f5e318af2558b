//! End-to-end tests: a running proxy in front of wiremock upstreams.

use std::sync::Arc;

use modelgate::config::Config;
use modelgate::proxy::app::{AppState, build_router};
use modelgate::telemetry::NullLogSink;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn spawn_proxy(config_yaml: &str) -> String {
	let config = Arc::new(Config::parse(config_yaml).expect("valid test config"));
	let state = AppState::from_config(config, Arc::new(NullLogSink)).expect("app state");
	let app = build_router(state);
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});
	format!("http://{addr}")
}

fn chat_body(model: &str, stream: bool) -> Value {
	json!({
		"model": model,
		"stream": stream,
		"messages": [{"role": "user", "content": "hi"}],
	})
}

/// Reassemble content/reasoning/finish from an SSE response body.
fn reassemble_stream(body: &str) -> (String, String, Option<String>) {
	let mut content = String::new();
	let mut reasoning = String::new();
	let mut finish = None;
	for event in body.split("\n\n") {
		for line in event.lines() {
			let Some(data) = line.strip_prefix("data: ") else {
				continue;
			};
			if data.trim() == "[DONE]" {
				continue;
			}
			let Ok(payload) = serde_json::from_str::<Value>(data) else {
				continue;
			};
			let delta = &payload["choices"][0]["delta"];
			if let Some(c) = delta.get("content").and_then(Value::as_str) {
				content.push_str(c);
			}
			if let Some(r) = delta.get("reasoning_content").and_then(Value::as_str) {
				reasoning.push_str(r);
			}
			if let Some(f) = payload["choices"][0].get("finish_reason").and_then(Value::as_str) {
				finish = Some(f.to_string());
			}
		}
	}
	(content, reasoning, finish)
}

#[tokio::test]
async fn buffered_chat_completion_passes_through() {
	let upstream = MockServer::start().await;
	let upstream_body = json!({
		"id": "chatcmpl-1",
		"choices": [{
			"index": 0,
			"message": {"role": "assistant", "content": "Hello."},
			"finish_reason": "stop",
		}],
	});
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(&upstream_body))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
"#,
		upstream.uri()
	))
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body, upstream_body);
}

#[tokio::test]
async fn inline_sse_error_triggers_fallback_with_zero_alpha_bytes() {
	let alpha = MockServer::start().await;
	let alpha_stream =
		"data: {\"type\":\"error\",\"error\":{\"message\":\"upstream busy\",\"http_code\":503}}\n\n";
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(alpha_stream, "text/event-stream"))
		.mount(&alpha)
		.await;

	let beta = MockServer::start().await;
	let beta_stream = concat!(
		"data: {\"id\":\"b1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
		"data: {\"id\":\"b1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
		"data: [DONE]\n\n",
	);
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(beta_stream, "text/event-stream"))
		.mount(&beta)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
  - model_name: beta
    model_params:
      api_base: {}/v1
router_settings:
  fallbacks:
    - alpha: [beta]
"#,
		alpha.uri(),
		beta.uri()
	))
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", true))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	let body = response.text().await.unwrap();
	// No byte of alpha's poisoned stream may reach the client.
	assert!(!body.contains("upstream busy"));
	assert_eq!(body, beta_stream);
	assert_eq!(alpha.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn streamed_think_tags_extracted_into_reasoning() {
	let upstream = MockServer::start().await;
	let pieces = ["<think>Reas", "oning.</think>", "Answer."];
	let mut stream = String::new();
	for piece in pieces {
		let event = json!({
			"id": "c1",
			"model": "alpha",
			"choices": [{"index": 0, "delta": {"content": piece}}],
		});
		stream.push_str(&format!("data: {event}\n\n"));
	}
	stream.push_str("data: {\"id\":\"c1\",\"model\":\"alpha\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
	stream.push_str("data: [DONE]\n\n");
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(stream, "text/event-stream"))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
proxy_settings:
  parsers:
    enabled: true
    response: [parse_tags]
"#,
		upstream.uri()
	))
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", true))
		.send()
		.await
		.unwrap();
	let body = response.text().await.unwrap();
	let (content, reasoning, finish) = reassemble_stream(&body);
	assert_eq!(reasoning, "Reasoning.");
	assert_eq!(content, "Answer.");
	assert_eq!(finish.as_deref(), Some("stop"));
}

#[tokio::test]
async fn buffered_tool_call_extraction_promotes_finish_reason() {
	let upstream = MockServer::start().await;
	let upstream_body = json!({
		"id": "chatcmpl-2",
		"choices": [{
			"index": 0,
			"message": {
				"role": "assistant",
				"content": "<tool_call>lookup<arg_key>q</arg_key><arg_value>\"x\"</arg_value></tool_call>",
			},
			"finish_reason": "stop",
		}],
	});
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(&upstream_body))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
proxy_settings:
  parsers:
    enabled: true
    response: [parse_tags]
"#,
		upstream.uri()
	))
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	let body: Value = response.json().await.unwrap();
	let choice = &body["choices"][0];
	assert_eq!(choice["finish_reason"], "tool_calls");
	let call = &choice["message"]["tool_calls"][0];
	assert_eq!(call["function"]["name"], "lookup");
	assert_eq!(call["function"]["arguments"], "{\"q\":\"x\"}");
	assert_eq!(choice["message"]["content"], Value::Null);
}

#[tokio::test]
async fn parameter_override_forces_configured_value() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
    parameters:
      tool_choice:
        default: none
        allow_override: false
"#,
		upstream.uri()
	))
	.await;

	let mut body = chat_body("alpha", false);
	body["tool_choice"] = json!("auto");
	reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&body)
		.send()
		.await
		.unwrap();

	let requests = upstream.received_requests().await.unwrap();
	assert_eq!(requests.len(), 1);
	let outbound: Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(outbound["tool_choice"], "none");
}

#[tokio::test]
async fn retryable_status_falls_back_to_next_backend() {
	let alpha = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "overloaded"})))
		.mount(&alpha)
		.await;
	let beta = MockServer::start().await;
	let beta_body = json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": "from beta"}}]});
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(&beta_body))
		.mount(&beta)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
  - model_name: beta
    model_params:
      api_base: {}/v1
router_settings:
  num_retries: 2
  fallbacks:
    - alpha: [beta]
"#,
		alpha.uri(),
		beta.uri()
	))
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body, beta_body);
	// The primary used its whole retry budget before the fallback fired.
	assert_eq!(alpha.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn exhausted_chain_returns_last_upstream_response() {
	let upstream = MockServer::start().await;
	let error_body = json!({"error": {"message": "rate limited", "type": "rate_limit"}});
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(429).set_body_json(&error_body))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
"#,
		upstream.uri()
	))
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	// The upstream's own body comes back, not a synthesised error.
	assert_eq!(response.status(), 429);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body, error_body);
}

#[tokio::test]
async fn unknown_model_maps_to_openai_error() {
	let proxy = spawn_proxy(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: http://127.0.0.1:9/v1
"#,
	)
	.await;

	let response = reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("ghost", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body["error"]["code"], "model_not_found");
	assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn invalid_json_and_missing_fields_rejected() {
	let proxy = spawn_proxy(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: http://127.0.0.1:9/v1
"#,
	)
	.await;
	let client = reqwest::Client::new();

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.header("content-type", "application/json")
		.body("{not json")
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body["error"]["code"], "invalid_json");

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body["error"]["code"], "missing_parameter");

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&json!({"model": "alpha"}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn models_endpoint_lists_backends() {
	let proxy = spawn_proxy(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: http://127.0.0.1:9/v1
  - model_name: beta
    model_params:
      api_base: http://127.0.0.1:9/v1
"#,
	)
	.await;

	let body: Value = reqwest::Client::new()
		.get(format!("{proxy}/v1/models"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(body["object"], "list");
	let ids: Vec<&str> = body["data"]
		.as_array()
		.unwrap()
		.iter()
		.map(|m| m["id"].as_str().unwrap())
		.collect();
	assert_eq!(ids, vec!["alpha", "beta"]);
	assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn app_key_auth_and_model_access() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {base}/v1
  - model_name: restricted
    model_params:
      api_base: {base}/v1
    access_control:
      allowed_keys: [other]
app_keys:
  enabled: true
  header_name: x-api-key
  keys:
    - key_id: k1
      secret: sk-test
"#,
		base = upstream.uri()
	))
	.await;
	let client = reqwest::Client::new();

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 401);

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.header("x-api-key", "sk-test")
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.header("x-api-key", "sk-test")
		.json(&chat_body("restricted", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn model_rewrite_and_credentials_reach_upstream() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
      api_key: sk-upstream
      model: openai/alpha-8b
"#,
		upstream.uri()
	))
	.await;

	reqwest::Client::new()
		.post(format!("{proxy}/v1/chat/completions"))
		.header("authorization", "Bearer client-key")
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();

	let requests = upstream.received_requests().await.unwrap();
	let request = &requests[0];
	let outbound: Value = serde_json::from_slice(&request.body).unwrap();
	assert_eq!(outbound["model"], "alpha-8b");
	assert_eq!(
		request.headers.get("authorization").unwrap().to_str().unwrap(),
		"Bearer sk-upstream"
	);
}

#[tokio::test]
async fn admin_register_and_unregister() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: http://127.0.0.1:9/v1
"#,
	)
	.await;
	let client = reqwest::Client::new();

	let response = client
		.post(format!("{proxy}/admin/models"))
		.json(&json!({
			"model_name": "dynamic",
			"model_params": {"api_base": format!("{}/v1", upstream.uri())},
		}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body["replaced"], false);

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("dynamic", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);

	let response = client
		.delete(format!("{proxy}/admin/models/dynamic"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);

	let response = client
		.delete(format!("{proxy}/admin/models/dynamic"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn queue_timeout_returns_429() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({"choices": []}))
				.set_delay(std::time::Duration::from_secs(2)),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: alpha
    model_params:
      api_base: {}/v1
app_keys:
  enabled: true
  allow_unauthenticated: true
  keys: []
  unauthenticated:
    concurrency_limit: 1
    queue_timeout: 0.2
"#,
		upstream.uri()
	))
	.await;
	let client = reqwest::Client::new();

	// Fill the single unauthenticated slot with a slow request.
	let proxy_clone = proxy.clone();
	let holder = tokio::spawn(async move {
		reqwest::Client::new()
			.post(format!("{proxy_clone}/v1/chat/completions"))
			.json(&chat_body("alpha", false))
			.send()
			.await
	});
	tokio::time::sleep(std::time::Duration::from_millis(200)).await;

	let response = client
		.post(format!("{proxy}/v1/chat/completions"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 429);

	let held = holder.await.unwrap().unwrap();
	assert_eq!(held.status(), 200);
}

#[tokio::test]
async fn messages_endpoint_requires_anthropic_backend() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"type": "message"})))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy(&format!(
		r#"
model_list:
  - model_name: claude
    model_params:
      api_base: {base}/v1
      api_key: sk-anthropic
      api_type: anthropic
  - model_name: alpha
    model_params:
      api_base: {base}/v1
"#,
		base = upstream.uri()
	))
	.await;
	let client = reqwest::Client::new();

	let response = client
		.post(format!("{proxy}/v1/messages"))
		.json(&chat_body("claude", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);

	let requests = upstream.received_requests().await.unwrap();
	assert_eq!(
		requests[0].headers.get("x-api-key").unwrap().to_str().unwrap(),
		"sk-anthropic"
	);
	assert!(requests[0].headers.get("anthropic-version").is_some());

	// Translation to OpenAI backends is out of scope; reject clearly.
	let response = client
		.post(format!("{proxy}/v1/messages"))
		.json(&chat_body("alpha", false))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
	let body: Value = response.json().await.unwrap();
	assert_eq!(body["type"], "error");
}
