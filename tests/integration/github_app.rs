//! Integration tests for the GitHub App fetcher behind the upstream cache.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use axum::{
	body::{Body, to_bytes},
	http::{Request, StatusCode},
};
use token_broker::{
	BrokerConfig, Error, GitHubAppFetcher, InstallationTokenFetcher, ManualClock, Result,
	StaticDeviceVerifier, UpstreamTokenCache,
	config::{GitHubAppConfig, UpstreamConfig},
	server::{self, AppState},
};
use tower::ServiceExt;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, header_exists, method, path},
};

const PRIVATE_KEY: &str = include_str!("../fixtures/github-app-key.pem");
const TOKEN_PATH: &str = "/app/installations/7890/access_tokens";

fn app_config(server: &MockServer) -> GitHubAppConfig {
	GitHubAppConfig {
		app_id: "123456".into(),
		installation_id: "7890".into(),
		private_key_path: "/unused".into(),
		api_base: Url::parse(&server.uri()).expect("mock server uri"),
	}
}

fn fetcher(server: &MockServer, clock: Arc<ManualClock>) -> GitHubAppFetcher {
	GitHubAppFetcher::from_pem(&app_config(server), PRIVATE_KEY.as_bytes(), clock)
		.expect("fetcher")
		.with_require_https(false)
}

#[tokio::test]
async fn concurrent_requests_trigger_one_installation_token_exchange() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.and(header("accept", "application/vnd.github+json"))
		.and(header_exists("authorization"))
		.respond_with(
			ResponseTemplate::new(201)
				.set_body_json(serde_json::json!({
					"token": "ghs_from_mock",
					"expires_at": "2023-11-14T23:13:20Z",
				}))
				.set_delay(Duration::from_millis(100)),
		)
		.expect(1)
		.mount(&server)
		.await;

	let clock = ManualClock::at_unix(1_700_000_000);
	let cache = UpstreamTokenCache::new(
		Arc::new(fetcher(&server, clock.clone())),
		clock.clone(),
		UpstreamConfig::default(),
	);
	let tasks: Vec<_> = (0..8)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.get(Duration::from_secs(5)).await })
		})
		.collect();

	for task in tasks {
		let token = task.await.expect("task")?;

		assert_eq!(token.value, "ghs_from_mock");
		assert_eq!(token.expires_at.timestamp(), 1_700_003_600);
	}

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn non_success_statuses_surface_as_http_errors() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(
			ResponseTemplate::new(401).set_body_string(r#"{"message":"Bad credentials"}"#),
		)
		.mount(&server)
		.await;

	let fetcher = fetcher(&server, ManualClock::at_unix(1_700_000_000));

	match fetcher.fetch().await {
		Err(Error::HttpStatus { status, body, .. }) => {
			assert_eq!(status, StatusCode::UNAUTHORIZED);
			assert!(body.unwrap_or_default().contains("Bad credentials"));
		},
		other => panic!("expected an HTTP status error, got {other:?}"),
	}
}

#[tokio::test]
async fn error_bodies_are_truncated() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(256 * 1024)))
		.mount(&server)
		.await;

	let fetcher = fetcher(&server, ManualClock::at_unix(1_700_000_000));

	match fetcher.fetch().await {
		Err(Error::HttpStatus { status, body, .. }) => {
			let body = body.unwrap_or_default();

			assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
			assert!(!body.is_empty());
			assert!(body.len() <= 4 * 1024);
		},
		other => panic!("expected an HTTP status error, got {other:?}"),
	}
}

#[tokio::test]
async fn oversized_success_bodies_are_refused() {
	let server = MockServer::start().await;
	let padding = "x".repeat(2 * 1024 * 1024);

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(
			ResponseTemplate::new(201)
				.set_body_json(serde_json::json!({ "token": "ghs_big", "padding": padding })),
		)
		.mount(&server)
		.await;

	let fetcher = fetcher(&server, ManualClock::at_unix(1_700_000_000));

	match fetcher.fetch().await {
		Err(Error::UpstreamUnavailable(reason)) => assert!(reason.contains("byte guard")),
		other => panic!("expected the size guard to trip, got {other:?}"),
	}
}

#[tokio::test]
async fn missing_expiry_is_left_to_the_cache_default() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "ghs_plain" })),
		)
		.mount(&server)
		.await;

	let token = fetcher(&server, ManualClock::at_unix(1_700_000_000)).fetch().await?;

	assert_eq!(token.value, "ghs_plain");
	assert_eq!(token.expires_at, None);

	Ok(())
}

#[tokio::test]
async fn registry_route_returns_the_cached_installation_token() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
			"token": "ghs_for_devices",
			"expires_at": "2023-11-14T23:13:20Z",
		})))
		.expect(2)
		.mount(&server)
		.await;

	let clock = ManualClock::at_unix(1_700_000_000);
	let mut config = BrokerConfig::new("integration-secret-with-plenty-of-bytes");

	config.github = Some(app_config(&server));

	let fetcher: Arc<dyn InstallationTokenFetcher> = Arc::new(fetcher(&server, clock.clone()));
	let state = AppState::with_parts(
		&config,
		clock,
		Some(fetcher),
		Arc::new(StaticDeviceVerifier::allow_all()),
	);
	let app = server::router(state);
	let call = |method: &str, uri: &str| {
		Request::builder()
			.method(method)
			.uri(uri)
			.header("x-device-serial", "device-42")
			.body(Body::empty())
			.unwrap()
	};

	for _ in 0..3 {
		let response =
			app.clone().oneshot(call("GET", "/api/v1/github/registry-token")).await.unwrap();

		assert_eq!(response.status(), StatusCode::OK);

		let body: serde_json::Value =
			serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
				.unwrap();

		assert_eq!(body["token"], "ghs_for_devices");
		assert_eq!(body["registry"], "ghcr.io");
		assert_eq!(body["username"], "ared-group");
	}

	let response =
		app.clone().oneshot(call("POST", "/api/v1/github/token/refresh")).await.unwrap();

	assert_eq!(response.status(), StatusCode::OK);

	let response = app.oneshot(call("GET", "/api/v1/github/registry-credentials")).await.unwrap();
	let body: serde_json::Value =
		serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();

	assert!(body["login_command"].as_str().unwrap().contains("ghcr.io -u ared-group"));

	server.verify().await;
}
