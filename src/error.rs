//! Crate-wide error types and `Result` alias.

// crates.io
use http::StatusCode;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the token broker.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Jsonwebtoken(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Credential is malformed: {0}")]
	Malformed(String),
	#[error("Credential signature or algorithm is invalid.")]
	BadSignature,
	#[error("Credential expired at {expired_at}.")]
	Expired { expired_at: chrono::DateTime<chrono::Utc> },
	#[error("Credential has been revoked.")]
	Revoked,
	#[error("Credential is not a refresh credential.")]
	NotRefreshable,
	#[error("Credential kind '{found}' is not accepted here; expected '{expected}'.")]
	WrongKind { expected: &'static str, found: &'static str },
	#[error("No credential was presented.")]
	NoCredential,
	#[error("Authorization header does not use the Bearer scheme.")]
	BadScheme,
	#[error("Device '{serial}' was rejected.")]
	DeviceRejected { serial: String },

	#[error("Rate limit exceeded for '{key}'; retry in {}s.", .retry_after.as_secs())]
	RateLimited { key: String, retry_after: std::time::Duration },

	#[error("Upstream integration is not configured: {0}")]
	NotConfigured(String),
	#[error("Upstream token unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: StatusCode, url: url::Url, body: Option<String> },

	#[error("Signing failed: {0}")]
	Signing(String),
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Invalid input for {field}: {reason}")]
	InvalidInput { field: &'static str, reason: String },
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Classify the error into the coarse taxonomy used by the HTTP layer.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::InvalidInput { .. } | Self::Serde(_) => ErrorKind::InvalidInput,
			Self::Malformed(_)
			| Self::BadSignature
			| Self::Expired { .. }
			| Self::Revoked
			| Self::NotRefreshable
			| Self::WrongKind { .. }
			| Self::NoCredential
			| Self::BadScheme
			| Self::DeviceRejected { .. } => ErrorKind::Unauthenticated,
			Self::RateLimited { .. } => ErrorKind::RateLimited,
			Self::NotConfigured(_) => ErrorKind::NotConfigured,
			Self::UpstreamUnavailable(_) | Self::HttpStatus { .. } | Self::Reqwest(_) =>
				ErrorKind::UpstreamUnavailable,
			Self::Io(_)
			| Self::Jsonwebtoken(_)
			| Self::Url(_)
			| Self::Signing(_)
			| Self::Metrics(_)
			| Self::Validation { .. } => ErrorKind::Internal,
		}
	}

	/// Stable machine-readable code reported to clients.
	pub fn code(&self) -> &'static str {
		match self {
			Self::Malformed(_) => "malformed_credential",
			Self::BadSignature => "bad_signature",
			Self::Expired { .. } => "expired_credential",
			Self::Revoked => "revoked_credential",
			Self::NotRefreshable => "not_refreshable",
			Self::WrongKind { .. } => "wrong_credential_kind",
			Self::NoCredential => "no_credential",
			Self::BadScheme => "bad_scheme",
			Self::DeviceRejected { .. } => "device_rejected",
			Self::RateLimited { .. } => "rate_limit_exceeded",
			Self::NotConfigured(_) => "upstream_not_configured",
			Self::UpstreamUnavailable(_) | Self::HttpStatus { .. } | Self::Reqwest(_) =>
				"upstream_unavailable",
			Self::InvalidInput { .. } | Self::Serde(_) => "invalid_input",
			_ => "internal_error",
		}
	}

	/// Whether the caller may retry the same request later.
	pub fn is_retryable(&self) -> bool {
		matches!(self.kind(), ErrorKind::RateLimited | ErrorKind::UpstreamUnavailable)
	}
}
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}

/// Coarse error taxonomy shared by every component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Request body or parameters are unusable.
	InvalidInput,
	/// Missing, malformed, expired, or rejected credential.
	Unauthenticated,
	/// Caller exceeded its admission budget.
	RateLimited,
	/// Upstream integration is disabled.
	NotConfigured,
	/// Upstream fetch failed and nothing usable is cached.
	UpstreamUnavailable,
	/// Signing, serialization, or other server-side failure.
	Internal,
}
impl ErrorKind {
	/// HTTP status associated with the kind.
	pub fn status(self) -> StatusCode {
		match self {
			Self::InvalidInput => StatusCode::BAD_REQUEST,
			Self::Unauthenticated => StatusCode::UNAUTHORIZED,
			Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			Self::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
			Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
			Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Error family label used in response bodies and metrics.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::InvalidInput => "invalid_request_error",
			Self::Unauthenticated => "authentication_error",
			Self::RateLimited => "rate_limit_error",
			Self::NotConfigured => "configuration_error",
			Self::UpstreamUnavailable => "upstream_error",
			Self::Internal => "internal_error",
		}
	}
}
