//! End-to-end tests for the HTTP surface.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use async_trait::async_trait;
use axum::{
	Router,
	body::{Body, to_bytes},
	http::{HeaderMap, Request, StatusCode, header},
};
use serde_json::{Value, json};
use token_broker::{
	BrokerConfig, Error, InstallationTokenFetcher, ManualClock, Result, StaticDeviceVerifier,
	UpstreamToken,
	config::{DeviceAuthConfig, Environment},
	server::{self, AppState},
};
use tower::ServiceExt;

const SECRET: &str = "integration-secret-with-plenty-of-bytes";

struct DownFetcher;
#[async_trait]
impl InstallationTokenFetcher for DownFetcher {
	async fn fetch(&self) -> Result<UpstreamToken> {
		Err(Error::UpstreamUnavailable("connection reset by peer".into()))
	}
}

const UPSTREAM_URL: &str = "https://api.github.com/app/installations/7890/access_tokens";
const UPSTREAM_BODY: &str = r#"{"message":"A JSON web token could not be decoded"}"#;

struct RejectingFetcher;
#[async_trait]
impl InstallationTokenFetcher for RejectingFetcher {
	async fn fetch(&self) -> Result<UpstreamToken> {
		Err(Error::HttpStatus {
			status: StatusCode::UNAUTHORIZED,
			url: UPSTREAM_URL.parse().expect("static url"),
			body: Some(UPSTREAM_BODY.into()),
		})
	}
}

struct Harness {
	app: Router,
	clock: Arc<ManualClock>,
}
impl Harness {
	fn new(configure: impl FnOnce(&mut BrokerConfig)) -> Self {
		Self::with_fetcher(configure, None)
	}

	fn with_fetcher(
		configure: impl FnOnce(&mut BrokerConfig),
		fetcher: Option<Arc<dyn InstallationTokenFetcher>>,
	) -> Self {
		let _ = tracing_subscriber::fmt::try_init();
		let mut config = BrokerConfig::new(SECRET);

		configure(&mut config);

		let clock = ManualClock::at_unix(1_700_000_000);
		let verifier = Arc::new(StaticDeviceVerifier::new(&config.device_auth));
		let state = AppState::with_parts(&config, clock.clone(), fetcher, verifier);

		Self { app: server::router(state), clock }
	}

	async fn send(
		&self,
		method: &str,
		uri: &str,
		headers: &[(&str, &str)],
		body: Option<Value>,
	) -> (StatusCode, HeaderMap, Value) {
		let mut builder = Request::builder().method(method).uri(uri);

		for (name, value) in headers {
			builder = builder.header(*name, *value);
		}

		let request = match body {
			Some(body) => builder
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
			None => builder.body(Body::empty()).unwrap(),
		};
		let response = self.app.clone().oneshot(request).await.unwrap();
		let status = response.status();
		let headers = response.headers().clone();
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };

		(status, headers, json)
	}
}

const DEVICE: (&str, &str) = ("x-device-serial", "device-42");

#[tokio::test]
async fn issued_credential_validates_until_it_expires() {
	let harness = Harness::new(|_| {});
	let (status, _, issued) = harness
		.send(
			"POST",
			"/api/v1/tokens",
			&[DEVICE],
			Some(json!({ "subject": "device-42", "scopes": ["registry:pull"], "ttl_seconds": 900 })),
		)
		.await;

	assert_eq!(status, StatusCode::CREATED);
	assert_eq!(issued["token_type"], "Bearer");
	assert_eq!(issued["scopes"], json!(["registry:pull"]));

	let token = issued["token"].as_str().unwrap();
	let (status, _, validation) =
		harness.send("POST", "/api/v1/tokens/validate", &[], Some(json!({ "token": token }))).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(validation["valid"], true);
	assert_eq!(validation["claims"]["sub"], "device-42");
	assert_eq!(validation["claims"]["exp"].as_i64().unwrap() - validation["claims"]["iat"].as_i64().unwrap(), 900);

	harness.clock.advance(Duration::from_secs(900));

	let (status, _, validation) =
		harness.send("POST", "/api/v1/tokens/validate", &[], Some(json!({ "token": token }))).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(validation["valid"], false);
	assert_eq!(validation["reason"], "expired_credential");
}

#[tokio::test]
async fn refresh_credentials_renew_access() {
	let harness = Harness::new(|_| {});
	let (_, _, issued) = harness.send("POST", "/api/v1/tokens", &[DEVICE], Some(json!({}))).await;
	let refresh_token = issued["refresh_token"].as_str().unwrap();
	let access_token = issued["token"].as_str().unwrap();

	harness.clock.advance(Duration::from_secs(60));

	let (status, _, renewed) = harness
		.send("POST", "/api/v1/tokens/refresh", &[], Some(json!({ "token": refresh_token })))
		.await;

	assert_eq!(status, StatusCode::OK);
	assert_ne!(renewed["token"], issued["token"]);

	let (status, _, rejected) = harness
		.send("POST", "/api/v1/tokens/refresh", &[], Some(json!({ "token": access_token })))
		.await;

	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(rejected["error"]["code"], "not_refreshable");
}

#[tokio::test]
async fn bearer_routes_require_access_credentials() {
	let harness = Harness::new(|_| {});
	let (_, _, issued) =
		harness.send("POST", "/api/v1/tokens", &[DEVICE], Some(json!({ "scopes": ["api:read"] }))).await;
	let access = format!("Bearer {}", issued["token"].as_str().unwrap());
	let refresh = format!("Bearer {}", issued["refresh_token"].as_str().unwrap());
	let (status, _, info) =
		harness.send("GET", "/api/v1/tokens/info", &[("authorization", &access)], None).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(info["claims"]["sub"], "device-42");
	assert_eq!(info["expires_in_seconds"], 900);

	let (status, _, body) =
		harness.send("GET", "/api/v1/tokens/info", &[("authorization", &refresh)], None).await;

	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"]["code"], "wrong_credential_kind");

	let (status, _, body) = harness.send("GET", "/api/v1/tokens/info", &[], None).await;

	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"]["code"], "no_credential");
	assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn revoked_credentials_stop_validating() {
	let harness = Harness::new(|_| {});
	let (_, _, issued) = harness.send("POST", "/api/v1/tokens", &[DEVICE], Some(json!({}))).await;
	let token = issued["token"].as_str().unwrap();
	let bearer = format!("Bearer {token}");
	let (status, _, revoked) = harness
		.send(
			"POST",
			"/api/v1/tokens/revoke",
			&[("authorization", &bearer)],
			Some(json!({ "token": token })),
		)
		.await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(revoked["revoked"], true);

	let (_, _, validation) =
		harness.send("POST", "/api/v1/tokens/validate", &[], Some(json!({ "token": token }))).await;

	assert_eq!(validation["reason"], "revoked_credential");
}

#[tokio::test]
async fn device_authentication_guards_issuance() {
	let harness = Harness::new(|config| {
		config.device_auth = DeviceAuthConfig { enabled: true, allowed_serials: vec!["device-42".into()] };
	});
	let (status, _, body) = harness.send("POST", "/api/v1/tokens", &[], Some(json!({}))).await;

	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"]["code"], "no_credential");

	let (status, _, body) = harness
		.send("POST", "/api/v1/tokens", &[("x-device-serial", "device-99")], Some(json!({})))
		.await;

	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"]["code"], "device_rejected");
}

#[tokio::test]
async fn bad_requests_are_reported_as_invalid_input() {
	let harness = Harness::new(|_| {});
	let (status, _, body) = harness
		.send("POST", "/api/v1/tokens", &[DEVICE], Some(json!({ "ttl_seconds": 7 * 24 * 60 * 60 })))
		.await;

	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["error"]["code"], "invalid_input");

	let (status, _, body) =
		harness.send("POST", "/api/v1/tokens/validate", &[], Some(json!({ "tok": "x" }))).await;

	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["error"]["type"], "invalid_request_error");

	let (status, _, body) = harness.send("GET", "/api/v1/nowhere", &[], None).await;

	assert_eq!(status, StatusCode::NOT_FOUND);
	assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn issuance_is_rate_limited_per_client() {
	let harness = Harness::new(|config| config.rate_limit.limit = 2);
	let from = |ip: &'static str| [DEVICE, ("x-forwarded-for", ip)];

	for _ in 0..2 {
		let (status, _, _) =
			harness.send("POST", "/api/v1/tokens", &from("203.0.113.7"), Some(json!({}))).await;

		assert_eq!(status, StatusCode::CREATED);
	}

	let (status, headers, body) =
		harness.send("POST", "/api/v1/tokens", &from("203.0.113.7"), Some(json!({}))).await;

	assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(body["error"]["code"], "rate_limit_exceeded");
	assert!(headers[header::RETRY_AFTER].to_str().unwrap().parse::<u64>().unwrap() >= 1);

	let (status, _, _) =
		harness.send("POST", "/api/v1/tokens", &from("198.51.100.1"), Some(json!({}))).await;

	assert_eq!(status, StatusCode::CREATED);

	// Validation is not rate limited.
	let (status, _, _) = harness
		.send("POST", "/api/v1/tokens/validate", &from("203.0.113.7"), Some(json!({ "token": "x" })))
		.await;

	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn registry_errors_distinguish_disabled_from_unavailable() {
	let disabled = Harness::new(|_| {});
	let (status, _, body) = disabled.send("GET", "/api/v1/github/registry-token", &[DEVICE], None).await;

	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(body["error"]["code"], "upstream_not_configured");

	let failing = Harness::with_fetcher(|_| {}, Some(Arc::new(DownFetcher)));
	let (status, _, body) = failing.send("GET", "/api/v1/github/registry-token", &[DEVICE], None).await;

	assert_eq!(status, StatusCode::BAD_GATEWAY);
	assert_eq!(body["error"]["code"], "upstream_unavailable");

	let (status, _, status_body) = disabled.send("GET", "/api/v1/github/status", &[], None).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(status_body["github_app_configured"], false);
	assert_eq!(status_body["healthy"], false);
}

#[tokio::test]
async fn health_endpoints_answer() {
	let harness = Harness::new(|_| {});
	let (status, _, body) = harness.send("GET", "/health", &[], None).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["status"], "healthy");
	assert_eq!(body["service"], "token-broker");

	let (status, _, body) = harness.send("GET", "/ready", &[], None).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn upstream_failure_detail_stays_out_of_production_responses() {
	let production = Harness::with_fetcher(
		|config| config.environment = Environment::Production,
		Some(Arc::new(RejectingFetcher)),
	);
	let (status, _, body) =
		production.send("GET", "/api/v1/github/registry-token", &[DEVICE], None).await;
	let rendered = body.to_string();

	assert_eq!(status, StatusCode::BAD_GATEWAY);
	assert_eq!(body["error"]["code"], "upstream_unavailable");
	assert_eq!(body["error"]["message"], "upstream token unavailable");
	assert!(!rendered.contains("installations/7890"));
	assert!(!rendered.contains("could not be decoded"));

	let (_, _, status_body) = production.send("GET", "/api/v1/github/status", &[], None).await;
	let rendered = status_body.to_string();

	assert_eq!(status_body["healthy"], false);
	assert!(!rendered.contains("installations/7890"));
	assert!(!rendered.contains("could not be decoded"));

	let development = Harness::with_fetcher(|_| {}, Some(Arc::new(RejectingFetcher)));
	let (status, _, body) =
		development.send("GET", "/api/v1/github/registry-token", &[DEVICE], None).await;

	assert_eq!(status, StatusCode::BAD_GATEWAY);
	assert_eq!(body["error"]["code"], "upstream_unavailable");
	assert!(body["error"]["message"].as_str().unwrap().contains("could not be decoded"));
}
