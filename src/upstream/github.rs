//! GitHub App installation-token fetcher.

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	path::Path,
};
// crates.io
use async_trait::async_trait;
use http::{
	StatusCode,
	header::{ACCEPT, AUTHORIZATION},
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, Response, redirect::Policy};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::GitHubAppConfig,
	security,
	upstream::{InstallationTokenFetcher, UpstreamToken},
};

const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;
const APP_JWT_BACKDATE_SECS: i64 = 60;
const APP_JWT_LIFETIME_SECS: i64 = 9 * 60;

#[derive(Serialize)]
struct AppClaims<'a> {
	iat: i64,
	exp: i64,
	iss: &'a str,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
	token: String,
	#[serde(default)]
	expires_at: Option<String>,
}

/// Exchanges a GitHub App identity for installation access tokens.
#[derive(Clone)]
pub struct GitHubAppFetcher {
	app_id: String,
	installation_id: String,
	key: EncodingKey,
	endpoint: Url,
	client: Client,
	clock: Arc<dyn Clock>,
	require_https: bool,
}
impl GitHubAppFetcher {
	/// Build a fetcher, reading the private key from `config.private_key_path`.
	pub fn new(config: &GitHubAppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
		let pem = read_private_key(&config.private_key_path)?;

		Self::from_pem(config, &pem, clock)
	}

	/// Build a fetcher from an in-memory PEM-encoded RSA key.
	pub fn from_pem(config: &GitHubAppConfig, pem: &[u8], clock: Arc<dyn Clock>) -> Result<Self> {
		config.validate()?;

		let key = EncodingKey::from_rsa_pem(pem).map_err(|err| Error::Validation {
			field: "github.private_key_path",
			reason: format!("Not a PEM-encoded RSA private key: {err}."),
		})?;
		let client = Client::builder()
			.redirect(Policy::limited(3))
			.user_agent(format!("token-broker/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self {
			app_id: config.app_id.clone(),
			installation_id: config.installation_id.clone(),
			key,
			endpoint: access_tokens_url(&config.api_base, &config.installation_id)?,
			client,
			clock,
			require_https: true,
		})
	}

	/// Override the HTTP client.
	pub fn with_client(mut self, client: Client) -> Self {
		self.client = client;

		self
	}

	/// Allow plain HTTP endpoints (local mocks only).
	pub fn with_require_https(mut self, require_https: bool) -> Self {
		self.require_https = require_https;

		self
	}

	/// Installation access-token endpoint.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	/// Sign the short-lived RS256 app assertion.
	pub fn app_jwt(&self) -> Result<String> {
		let now = self.clock.now();
		let claims = AppClaims {
			iat: (now - TimeDelta::seconds(APP_JWT_BACKDATE_SECS)).timestamp(),
			exp: (now + TimeDelta::seconds(APP_JWT_LIFETIME_SECS)).timestamp(),
			iss: &self.app_id,
		};

		jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
			.map_err(|err| Error::Signing(err.to_string()))
	}
}
#[async_trait]
impl InstallationTokenFetcher for GitHubAppFetcher {
	#[tracing::instrument(skip(self), fields(installation = %self.installation_id))]
	async fn fetch(&self) -> Result<UpstreamToken> {
		if self.require_https {
			security::enforce_https(&self.endpoint)?;
		}

		let assertion = self.app_jwt()?;
		let start = Instant::now();
		let mut response = self
			.client
			.post(self.endpoint.clone())
			.header(ACCEPT, ACCEPT_GITHUB_JSON)
			.header(AUTHORIZATION, format!("Bearer {assertion}"))
			.header("X-GitHub-Api-Version", "2022-11-28")
			.send()
			.await?;
		let status = response.status();

		if status != StatusCode::OK && status != StatusCode::CREATED {
			let body = read_capped(&mut response, MAX_ERROR_BODY_BYTES)
				.await
				.ok()
				.map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned());

			return Err(Error::HttpStatus { status, url: self.endpoint.clone(), body });
		}
		if response.content_length().is_some_and(|len| len > MAX_RESPONSE_BYTES as u64) {
			return Err(oversized());
		}

		let (bytes, truncated) = read_capped(&mut response, MAX_RESPONSE_BYTES).await?;

		if truncated {
			return Err(oversized());
		}

		let payload: AccessTokenResponse = serde_json::from_slice(&bytes).map_err(|err| {
			Error::UpstreamUnavailable(format!("unreadable access token response: {err}"))
		})?;

		if payload.token.trim().is_empty() {
			return Err(Error::UpstreamUnavailable("access token response carried no token".into()));
		}

		let expires_at = payload.expires_at.as_deref().and_then(|raw| {
			match DateTime::parse_from_rfc3339(raw) {
				Ok(parsed) => Some(parsed.with_timezone(&Utc)),
				Err(err) => {
					tracing::warn!(raw, error = %err, "ignoring unparseable expires_at");

					None
				},
			}
		});

		tracing::debug!(
			status = %status,
			elapsed = ?start.elapsed(),
			token = %security::fingerprint(&payload.token),
			expires_at = ?expires_at,
			"installation token fetch complete"
		);

		Ok(UpstreamToken { value: payload.token, expires_at })
	}
}
impl Debug for GitHubAppFetcher {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("GitHubAppFetcher")
			.field("app_id", &self.app_id)
			.field("installation_id", &self.installation_id)
			.field("endpoint", &self.endpoint.as_str())
			.field("require_https", &self.require_https)
			.finish_non_exhaustive()
	}
}

fn read_private_key(path: &Path) -> Result<Vec<u8>> {
	std::fs::read(path).map_err(|err| Error::Validation {
		field: "github.private_key_path",
		reason: format!("Cannot read {}: {err}.", path.display()),
	})
}

fn access_tokens_url(api_base: &Url, installation_id: &str) -> Result<Url> {
	let mut url = api_base.clone();

	url.path_segments_mut()
		.map_err(|_| Error::Validation {
			field: "github.api_base",
			reason: format!("{api_base} cannot be used as a base URL."),
		})?
		.pop_if_empty()
		.extend(["app", "installations", installation_id, "access_tokens"]);

	Ok(url)
}

/// Read at most `limit` bytes; the flag reports whether the body went past it.
async fn read_capped(response: &mut Response, limit: usize) -> Result<(Vec<u8>, bool)> {
	let mut buf = Vec::new();

	while let Some(chunk) = response.chunk().await? {
		buf.extend_from_slice(&chunk);

		if buf.len() > limit {
			buf.truncate(limit);

			return Ok((buf, true));
		}
	}

	Ok((buf, false))
}

fn oversized() -> Error {
	Error::UpstreamUnavailable(format!(
		"access token response exceeds the {MAX_RESPONSE_BYTES} byte guard"
	))
}
