//! Broker configuration and validation.
//!
//! A [`BrokerConfig`] is read once at start-up and handed to each component's constructor; nothing
//! in the crate reads the environment after that.

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	path::PathBuf,
};
// crates.io
use url::Url;
// self
use crate::_prelude::*;

/// Placeholder secret accepted only outside production.
pub const PLACEHOLDER_SECRET: &str = "your-secret-key-change-in-production";
/// Minimum accepted signing secret length in bytes.
pub const MIN_SECRET_BYTES: usize = 32;
/// Default access credential lifetime.
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
/// Default refresh credential lifetime.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default upper bound for client-requested lifetimes.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default issuer claim.
pub const DEFAULT_ISSUER: &str = "token-broker";
/// Default admissions per key per window.
pub const DEFAULT_RATE_LIMIT: u32 = 100;
/// Default sliding window length.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
/// Default idle-key sweep cadence.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default lead time before upstream expiry that forces a refetch.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);
/// Default upstream token lifetime when the upstream omits one.
pub const DEFAULT_UPSTREAM_TTL: Duration = Duration::from_secs(50 * 60);
/// Default bound on a single upstream fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on how long a request waits for the upstream token.
pub const DEFAULT_CALLER_TIMEOUT: Duration = Duration::from_secs(15);
/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default GitHub App private key location.
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "/etc/secrets/github-app-private-key.pem";
/// Default GitHub REST API base.
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

/// Deployment environment; controls how much error detail reaches clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
	/// Local development; internal error text is returned to clients.
	#[default]
	Development,
	/// Staging or any other non-production deployment.
	Staging,
	/// Production; internal error text is never returned.
	Production,
}
impl Environment {
	fn parse(raw: &str) -> Self {
		match raw.trim().to_ascii_lowercase().as_str() {
			"production" | "prod" => Self::Production,
			"development" | "dev" => Self::Development,
			_ => Self::Staging,
		}
	}

	/// Whether internal error text may be exposed.
	pub fn is_development(self) -> bool {
		self == Self::Development
	}
}

/// Credential signing configuration.
#[derive(Clone)]
pub struct SigningConfig {
	/// Shared HMAC secret.
	pub secret: String,
	/// Issuer claim stamped on and required of every credential.
	pub issuer: String,
	/// Lifetime of access credentials when the client does not ask for one.
	pub access_ttl: Duration,
	/// Lifetime of refresh credentials.
	pub refresh_ttl: Duration,
	/// Upper bound for client-requested lifetimes.
	pub max_ttl: Duration,
}
impl SigningConfig {
	/// Signing configuration with default lifetimes.
	pub fn new(secret: impl Into<String>) -> Self {
		Self {
			secret: secret.into(),
			issuer: DEFAULT_ISSUER.into(),
			access_ttl: DEFAULT_ACCESS_TTL,
			refresh_ttl: DEFAULT_REFRESH_TTL,
			max_ttl: DEFAULT_MAX_TTL,
		}
	}
}
impl Debug for SigningConfig {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("SigningConfig")
			.field("secret", &"<redacted>")
			.field("issuer", &self.issuer)
			.field("access_ttl", &self.access_ttl)
			.field("refresh_ttl", &self.refresh_ttl)
			.field("max_ttl", &self.max_ttl)
			.finish()
	}
}

/// Sliding-window admission settings.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
	/// Admissions allowed per key inside one window.
	pub limit: u32,
	/// Trailing window length.
	pub window: Duration,
	/// Cadence of the idle-key sweep.
	pub cleanup_interval: Duration,
}
impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			limit: DEFAULT_RATE_LIMIT,
			window: DEFAULT_RATE_WINDOW,
			cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
		}
	}
}

/// Upstream installation-token cache settings.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
	/// Lead time before expiry that forces a refetch.
	pub safety_margin: Duration,
	/// Lifetime assumed when the upstream omits an expiry.
	pub default_ttl: Duration,
	/// Bound on a single upstream fetch.
	pub fetch_timeout: Duration,
	/// Bound on how long one request waits for the token.
	pub caller_timeout: Duration,
}
impl Default for UpstreamConfig {
	fn default() -> Self {
		Self {
			safety_margin: DEFAULT_SAFETY_MARGIN,
			default_ttl: DEFAULT_UPSTREAM_TTL,
			fetch_timeout: DEFAULT_FETCH_TIMEOUT,
			caller_timeout: DEFAULT_CALLER_TIMEOUT,
		}
	}
}

/// GitHub App identity used to mint installation tokens.
#[derive(Clone, Debug)]
pub struct GitHubAppConfig {
	/// Numeric GitHub App identifier.
	pub app_id: String,
	/// Installation whose token is cached.
	pub installation_id: String,
	/// PEM-encoded RSA private key of the app.
	pub private_key_path: PathBuf,
	/// REST API base URL.
	pub api_base: Url,
}
impl GitHubAppConfig {
	/// Validate identifiers and the API base.
	pub fn validate(&self) -> Result<()> {
		if self.app_id.trim().is_empty() {
			return Err(Error::Validation {
				field: "github.app_id",
				reason: "GITHUB_APP_ID is required.".into(),
			});
		}
		if self.installation_id.trim().is_empty() {
			return Err(Error::Validation {
				field: "github.installation_id",
				reason: "GITHUB_INSTALLATION_ID is required.".into(),
			});
		}
		if self.api_base.host_str().is_none() {
			return Err(Error::Validation {
				field: "github.api_base",
				reason: "Must include a host component.".into(),
			});
		}

		Ok(())
	}
}

/// Registry metadata returned alongside the upstream token.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
	/// Registry host, e.g. `ghcr.io`.
	pub url: String,
	/// Login name paired with the token.
	pub username: String,
}
impl Default for RegistryConfig {
	fn default() -> Self {
		Self { url: "ghcr.io".into(), username: "ared-group".into() }
	}
}

/// Device serial verification settings.
#[derive(Clone, Debug)]
pub struct DeviceAuthConfig {
	/// When disabled every non-blank serial is accepted.
	pub enabled: bool,
	/// Accepted serials; empty accepts every non-blank serial.
	pub allowed_serials: Vec<String>,
}
impl Default for DeviceAuthConfig {
	fn default() -> Self {
		Self { enabled: true, allowed_serials: Vec::new() }
	}
}

/// Complete, immutable broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
	/// Deployment environment.
	pub environment: Environment,
	/// TCP port the HTTP surface binds to.
	pub port: u16,
	/// Credential signing settings.
	pub signing: SigningConfig,
	/// Admission control settings.
	pub rate_limit: RateLimitConfig,
	/// Upstream cache settings.
	pub upstream: UpstreamConfig,
	/// GitHub App identity; `None` disables the registry-token endpoints.
	pub github: Option<GitHubAppConfig>,
	/// Registry metadata.
	pub registry: RegistryConfig,
	/// Device verification settings.
	pub device_auth: DeviceAuthConfig,
}
impl BrokerConfig {
	/// Configuration with defaults around the given signing secret.
	pub fn new(secret: impl Into<String>) -> Self {
		Self {
			environment: Environment::Development,
			port: DEFAULT_PORT,
			signing: SigningConfig::new(secret),
			rate_limit: RateLimitConfig::default(),
			upstream: UpstreamConfig::default(),
			github: None,
			registry: RegistryConfig::default(),
			device_auth: DeviceAuthConfig::default(),
		}
	}

	/// Load from process environment variables.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Load from an arbitrary key lookup, falling back to defaults for unset keys.
	pub fn from_lookup<F>(lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
		let duration = |key: &'static str, fallback: Duration| -> Result<Duration> {
			get(key).map(|raw| parse_duration(key, &raw)).transpose().map(|d| d.unwrap_or(fallback))
		};
		let mut config =
			Self::new(get("JWT_SECRET").unwrap_or_else(|| PLACEHOLDER_SECRET.to_owned()));

		config.environment =
			get("ENVIRONMENT").map(|raw| Environment::parse(&raw)).unwrap_or_default();

		if let Some(port) = get("PORT") {
			config.port = port.trim().parse().map_err(|_| Error::Validation {
				field: "PORT",
				reason: format!("'{port}' is not a valid port."),
			})?;
		}
		if let Some(issuer) = get("JWT_ISSUER") {
			config.signing.issuer = issuer;
		}

		config.signing.access_ttl = duration("TOKEN_EXPIRATION", DEFAULT_ACCESS_TTL)?;
		config.signing.refresh_ttl = duration("REFRESH_TOKEN_EXPIRATION", DEFAULT_REFRESH_TTL)?;
		config.signing.max_ttl = duration("TOKEN_MAX_EXPIRATION", DEFAULT_MAX_TTL)?;

		if let Some(limit) = get("RATE_LIMIT_PER_MINUTE") {
			config.rate_limit.limit = limit.trim().parse().map_err(|_| Error::Validation {
				field: "RATE_LIMIT_PER_MINUTE",
				reason: format!("'{limit}' is not a non-negative integer."),
			})?;
		}

		config.rate_limit.window = duration("RATE_LIMIT_WINDOW", DEFAULT_RATE_WINDOW)?;
		config.rate_limit.cleanup_interval =
			duration("RATE_LIMIT_CLEANUP_INTERVAL", DEFAULT_CLEANUP_INTERVAL)?;
		config.upstream.safety_margin = duration("GITHUB_TOKEN_SAFETY_MARGIN", DEFAULT_SAFETY_MARGIN)?;
		config.upstream.default_ttl = duration("GITHUB_TOKEN_CACHE_TTL", DEFAULT_UPSTREAM_TTL)?;
		config.upstream.fetch_timeout = duration("GITHUB_FETCH_TIMEOUT", DEFAULT_FETCH_TIMEOUT)?;
		config.upstream.caller_timeout = duration("GITHUB_CALLER_TIMEOUT", DEFAULT_CALLER_TIMEOUT)?;

		if let (Some(app_id), Some(installation_id)) =
			(get("GITHUB_APP_ID"), get("GITHUB_INSTALLATION_ID"))
		{
			let api_base = match get("GITHUB_API_URL") {
				Some(raw) => Url::parse(raw.trim())?,
				None => Url::parse(DEFAULT_GITHUB_API)?,
			};

			config.github = Some(GitHubAppConfig {
				app_id,
				installation_id,
				private_key_path: get("GITHUB_PRIVATE_KEY_PATH")
					.map(PathBuf::from)
					.unwrap_or_else(default_private_key_path),
				api_base,
			});
		}
		if let Some(url) = get("REGISTRY_URL") {
			config.registry.url = url;
		}
		if let Some(username) = get("REGISTRY_USERNAME") {
			config.registry.username = username;
		}
		if let Some(enabled) = get("DEVICE_AUTH_ENABLED") {
			config.device_auth.enabled = parse_bool("DEVICE_AUTH_ENABLED", &enabled)?;
		}
		if let Some(serials) = get("DEVICE_ALLOWED_SERIALS") {
			config.device_auth.allowed_serials = serials
				.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(String::from)
				.collect();
		}

		config.validate()?;

		Ok(config)
	}

	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		let secret = &self.signing.secret;

		if secret.len() < MIN_SECRET_BYTES {
			return Err(Error::Validation {
				field: "signing.secret",
				reason: format!("Must be at least {MIN_SECRET_BYTES} bytes."),
			});
		}
		if self.environment == Environment::Production && secret == PLACEHOLDER_SECRET {
			return Err(Error::Validation {
				field: "signing.secret",
				reason: "JWT_SECRET is still the insecure placeholder.".into(),
			});
		}
		if self.signing.issuer.trim().is_empty() {
			return Err(Error::Validation {
				field: "signing.issuer",
				reason: "Must not be empty.".into(),
			});
		}

		for (field, ttl) in [
			("signing.access_ttl", self.signing.access_ttl),
			("signing.refresh_ttl", self.signing.refresh_ttl),
			("signing.max_ttl", self.signing.max_ttl),
		] {
			if ttl < Duration::from_secs(1) {
				return Err(Error::Validation { field, reason: "Must be at least 1 second.".into() });
			}
		}

		if self.signing.access_ttl > self.signing.max_ttl {
			return Err(Error::Validation {
				field: "signing.access_ttl",
				reason: "Must be less than or equal to max_ttl.".into(),
			});
		}
		if self.rate_limit.limit == 0 {
			return Err(Error::Validation {
				field: "rate_limit.limit",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.rate_limit.window.is_zero() || self.rate_limit.cleanup_interval.is_zero() {
			return Err(Error::Validation {
				field: "rate_limit.window",
				reason: "Window and cleanup interval must be greater than zero.".into(),
			});
		}
		if self.upstream.default_ttl <= self.upstream.safety_margin {
			return Err(Error::Validation {
				field: "upstream.default_ttl",
				reason: "Must be greater than safety_margin.".into(),
			});
		}
		if self.upstream.fetch_timeout.is_zero() || self.upstream.caller_timeout.is_zero() {
			return Err(Error::Validation {
				field: "upstream.fetch_timeout",
				reason: "Fetch and caller timeouts must be greater than zero.".into(),
			});
		}
		if let Some(github) = &self.github {
			github.validate()?;
		}

		Ok(())
	}
}

/// Parse a duration such as `90`, `90s`, `15m`, `1h30m`, `500ms`, or `7d`.
///
/// A bare integer counts seconds. Otherwise the value is a sequence of integer and unit pairs
/// using `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`, or `d`.
pub fn parse_duration(field: &'static str, raw: &str) -> Result<Duration> {
	let raw = raw.trim();
	let invalid = || Error::Validation {
		field,
		reason: format!("'{raw}' is not a duration such as 90s, 15m, or 1h30m."),
	};
	let overflow = || Error::Validation { field, reason: format!("'{raw}' overflows.") };

	if raw.is_empty() {
		return Err(invalid());
	}
	if raw.bytes().all(|b| b.is_ascii_digit()) {
		return raw.parse().map(Duration::from_secs).map_err(|_| overflow());
	}

	let mut rest = raw;
	let mut total_nanos = 0_u128;

	while !rest.is_empty() {
		let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());

		if digits == 0 {
			return Err(invalid());
		}

		let value: u128 = rest[..digits].parse().map_err(|_| overflow())?;

		rest = &rest[digits..];

		let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
		let nanos_per_unit: u128 = match &rest[..unit_len] {
			"ns" => 1,
			"us" | "µs" => 1_000,
			"ms" => 1_000_000,
			"s" => 1_000_000_000,
			"m" => 60 * 1_000_000_000,
			"h" => 60 * 60 * 1_000_000_000,
			"d" => 24 * 60 * 60 * 1_000_000_000,
			_ => return Err(invalid()),
		};

		rest = &rest[unit_len..];
		total_nanos = value
			.checked_mul(nanos_per_unit)
			.and_then(|nanos| total_nanos.checked_add(nanos))
			.ok_or_else(overflow)?;
	}

	let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| overflow())?;

	// The remainder is below one second.
	Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

fn parse_bool(field: &'static str, raw: &str) -> Result<bool> {
	match raw.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(Error::Validation { field, reason: format!("'{raw}' is not a boolean.") }),
	}
}

fn default_private_key_path() -> PathBuf {
	PathBuf::from(DEFAULT_PRIVATE_KEY_PATH)
}

#[cfg(test)]
mod tests {
	// std
	use std::collections::HashMap;
	// self
	use super::*;

	fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> =
			pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

		move |key| map.get(key).cloned()
	}

	#[test]
	fn parses_duration_suffixes() {
		assert_eq!(parse_duration("t", "90").unwrap(), Duration::from_secs(90));
		assert_eq!(parse_duration("t", "15m").unwrap(), Duration::from_secs(900));
		assert_eq!(parse_duration("t", " 24h ").unwrap(), Duration::from_secs(86_400));
		assert_eq!(parse_duration("t", "7d").unwrap(), Duration::from_secs(604_800));
		assert!(parse_duration("t", "soon").is_err());
	}

	#[test]
	fn parses_compound_and_sub_second_durations() {
		assert_eq!(parse_duration("t", "1h30m").unwrap(), Duration::from_secs(5_400));
		assert_eq!(parse_duration("t", "500ms").unwrap(), Duration::from_millis(500));
		assert_eq!(parse_duration("t", "1m30s250ms").unwrap(), Duration::from_millis(90_250));
		assert_eq!(parse_duration("t", "750us").unwrap(), Duration::from_micros(750));
		assert_eq!(parse_duration("t", "2µs").unwrap(), Duration::from_micros(2));

		for bad in ["", "1h30", "m5", "1.5h", "10 m", "-5s", "5y"] {
			assert!(parse_duration("t", bad).is_err(), "{bad} should be rejected");
		}
	}

	#[test]
	fn environment_defaults_match_the_documented_values() {
		let config = BrokerConfig::from_lookup(lookup(&[])).expect("defaults are valid");

		assert_eq!(config.signing.secret, PLACEHOLDER_SECRET);
		assert_eq!(config.signing.access_ttl, DEFAULT_ACCESS_TTL);
		assert_eq!(config.rate_limit.limit, DEFAULT_RATE_LIMIT);
		assert_eq!(config.upstream.default_ttl, Duration::from_secs(50 * 60));
		assert_eq!(config.registry.url, "ghcr.io");
		assert!(config.github.is_none());
	}

	#[test]
	fn github_section_requires_both_identifiers() {
		let partial = BrokerConfig::from_lookup(lookup(&[("GITHUB_APP_ID", "123")])).unwrap();

		assert!(partial.github.is_none());

		let full = BrokerConfig::from_lookup(lookup(&[
			("GITHUB_APP_ID", "123"),
			("GITHUB_INSTALLATION_ID", "456"),
			("TOKEN_EXPIRATION", "5m"),
			("RATE_LIMIT_PER_MINUTE", "10"),
		]))
		.unwrap();
		let github = full.github.expect("github configured");

		assert_eq!(github.installation_id, "456");
		assert_eq!(github.private_key_path, PathBuf::from(DEFAULT_PRIVATE_KEY_PATH));
		assert_eq!(full.signing.access_ttl, Duration::from_secs(300));
		assert_eq!(full.rate_limit.limit, 10);
	}

	#[test]
	fn production_refuses_placeholder_secret() {
		let err = BrokerConfig::from_lookup(lookup(&[("ENVIRONMENT", "production")])).unwrap_err();

		assert!(matches!(err, Error::Validation { field: "signing.secret", .. }));
	}

	#[test]
	fn short_secrets_and_bad_durations_are_rejected() {
		assert!(BrokerConfig::from_lookup(lookup(&[("JWT_SECRET", "short")])).is_err());
		assert!(BrokerConfig::from_lookup(lookup(&[("TOKEN_EXPIRATION", "later")])).is_err());
	}

	#[test]
	fn debug_output_redacts_the_secret() {
		let config = BrokerConfig::new("x".repeat(40));
		let rendered = format!("{config:?}");

		assert!(rendered.contains("<redacted>"));
		assert!(!rendered.contains(&"x".repeat(40)));
	}
}
