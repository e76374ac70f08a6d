//! HTTP surface: router, shared state, rate limiting, and process wiring.

pub mod handlers;
pub mod response;

// std
use std::net::SocketAddr;
// crates.io
use axum::{
	Router,
	extract::{ConnectInfo, MatchedPath, Request, State},
	http::{HeaderMap, HeaderName, Method, header},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::{get, post},
};
use tokio::{net::TcpListener, time};
use tower_http::{
	cors::{Any, CorsLayer},
	trace::TraceLayer,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
// self
use crate::{
	_prelude::*,
	auth::{AuthGate, DEVICE_SERIAL_HEADER, DeviceVerifier, StaticDeviceVerifier},
	clock::{self, Clock},
	config::{BrokerConfig, Environment},
	credential::{CredentialSigner, RevocationList},
	issuance::IssuanceService,
	limiter::SlidingWindowLimiter,
	metrics,
	server::response::ApiError,
	upstream::{GitHubAppFetcher, InstallationTokenFetcher, UpstreamTokenCache},
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// State shared by every handler.
#[derive(Clone, Debug)]
pub struct AppState {
	/// Application service.
	pub issuance: IssuanceService,
	/// Identity extraction.
	pub auth: AuthGate,
	/// Admission control for issuance and registry routes.
	pub limiter: Arc<SlidingWindowLimiter>,
	/// Admissions per client per window.
	pub rate_limit: u32,
	/// Deployment environment.
	pub environment: Environment,
	/// Wall-clock source.
	pub clock: Arc<dyn Clock>,
	revocations: Arc<RevocationList>,
}
impl AppState {
	/// Wire every component from configuration using the real GitHub App fetcher.
	pub fn from_config(config: &BrokerConfig) -> Result<Self> {
		let clock = clock::system();
		let fetcher = match &config.github {
			Some(github) => {
				let fetcher: Arc<dyn InstallationTokenFetcher> =
					Arc::new(GitHubAppFetcher::new(github, clock.clone())?);

				Some(fetcher)
			},
			None => {
				tracing::warn!("GitHub App integration disabled; registry endpoints will answer 503");

				None
			},
		};
		let verifier = Arc::new(StaticDeviceVerifier::new(&config.device_auth));

		Ok(Self::with_parts(config, clock, fetcher, verifier))
	}

	/// Wire every component around explicit collaborators.
	pub fn with_parts(
		config: &BrokerConfig,
		clock: Arc<dyn Clock>,
		fetcher: Option<Arc<dyn InstallationTokenFetcher>>,
		verifier: Arc<dyn DeviceVerifier>,
	) -> Self {
		let revocations = RevocationList::new();
		let signer = CredentialSigner::new(&config.signing, clock.clone(), revocations.clone());
		let upstream = fetcher.map(|fetcher| {
			UpstreamTokenCache::new(fetcher, clock.clone(), config.upstream.clone())
		});

		Self {
			issuance: IssuanceService::new(config, signer.clone(), upstream),
			auth: AuthGate::new(signer, verifier),
			limiter: SlidingWindowLimiter::from_config(&config.rate_limit),
			rate_limit: config.rate_limit.limit,
			environment: config.environment,
			clock,
			revocations,
		}
	}
}

/// Build the application router.
///
/// Credential and registry routes live under `/api/v1`; health and metrics stay at the root.
pub fn router(state: AppState) -> Router {
	let limited = Router::new()
		.route("/tokens", post(handlers::issue))
		.route("/tokens/refresh", post(handlers::refresh))
		.route("/github/registry-token", get(handlers::registry_token))
		.route("/github/registry-credentials", get(handlers::registry_credentials))
		.route("/github/token/refresh", post(handlers::refresh_registry_token))
		.route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));
	let open = Router::new()
		.route("/tokens/validate", post(handlers::validate))
		.route("/tokens/revoke", post(handlers::revoke))
		.route("/tokens/info", get(handlers::info))
		.route("/github/status", get(handlers::github_status));
	let router = Router::new()
		.route("/health", get(handlers::health))
		.route("/ready", get(handlers::ready))
		.nest("/api/v1", limited.merge(open));
	#[cfg(feature = "prometheus")]
	let router = router.route("/metrics", get(handlers::metrics));
	let router = router.fallback(handlers::fallback);
	let router = if state.environment.is_development() {
		router.layer(middleware::from_fn(response::expose_internal_detail))
	} else {
		router
	};

	router.layer(cors()).layer(TraceLayer::new_for_http()).with_state(state)
}

/// Install the global `tracing` subscriber (`RUST_LOG`, default `info`).
pub fn init_tracing() {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new("token_broker=info,tower_http=info"));
	let _ = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).try_init();
}

/// Bind, serve until Ctrl-C or SIGTERM, then drain.
pub async fn serve(config: BrokerConfig) -> Result<()> {
	let state = AppState::from_config(&config)?;
	let _sweeper = state.limiter.spawn_sweeper(config.rate_limit.cleanup_interval);
	let purger = tokio::spawn(purge_revocations(state.clone(), config.rate_limit.cleanup_interval));
	let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
	let listener = TcpListener::bind(addr).await?;

	tracing::info!(%addr, environment = ?config.environment, "token broker listening");

	let served = axum::serve(
		listener,
		router(state).into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(shutdown_signal())
	.await;

	purger.abort();
	served?;

	tracing::info!("token broker stopped");

	Ok(())
}

/// Client key used for rate limiting: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
	let header = |name: &str| {
		headers
			.get(name)
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.split(',').next())
			.map(str::trim)
			.filter(|value| !value.is_empty())
			.map(str::to_owned)
	};

	header(X_FORWARDED_FOR)
		.or_else(|| header(X_REAL_IP))
		.or_else(|| peer.map(|peer| peer.ip().to_string()))
		.unwrap_or_else(|| UNKNOWN_CLIENT.to_owned())
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
	let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
	let key = client_key(request.headers(), peer);

	if state.limiter.allow(&key, state.rate_limit).await {
		return next.run(request).await;
	}

	let route = request
		.extensions()
		.get::<MatchedPath>()
		.map(|path| path.as_str().to_owned())
		.unwrap_or_else(|| request.uri().path().to_owned());
	let retry_after = state.limiter.retry_after(&key).await;

	metrics::record_rate_limited(&route);

	tracing::warn!(client = %key, route = %route, "rate limit exceeded");

	ApiError(Error::RateLimited { key, retry_after }).into_response()
}

async fn purge_revocations(state: AppState, every: Duration) {
	let mut ticker = time::interval(every);

	loop {
		ticker.tick().await;

		let removed = state.revocations.purge(state.clock.now()).await;

		if removed > 0 {
			tracing::debug!(removed, "purged expired revocations");
		}
	}
}

fn cors() -> CorsLayer {
	CorsLayer::new()
		.allow_origin(Any)
		.allow_methods([Method::GET, Method::POST, Method::OPTIONS])
		.allow_headers([
			header::AUTHORIZATION,
			header::CONTENT_TYPE,
			HeaderName::from_static(DEVICE_SERIAL_HEADER),
		])
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			tracing::error!(error = %err, "failed to listen for Ctrl-C");
		}
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(err) => {
				tracing::error!(error = %err, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			},
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}

	tracing::info!("shutdown signal received");
}
