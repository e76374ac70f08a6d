//! Error to HTTP response mapping.

// crates.io
use axum::{
	Json,
	extract::Request,
	http::{HeaderValue, StatusCode, header::RETRY_AFTER},
	middleware::Next,
	response::{IntoResponse, Response},
};
use serde_json::json;
// self
use crate::{Error, ErrorKind};

const INTERNAL_MESSAGE: &str = "internal server error";
const UPSTREAM_MESSAGE: &str = "upstream token unavailable";
const NOT_CONFIGURED_MESSAGE: &str = "upstream integration is not configured";

/// Handler error; renders as `{"error": {"message", "type", "code"}}`.
///
/// Internal and upstream failures answer with a fixed message; their real text is kept in an
/// [`InternalDetail`] extension.
#[derive(Debug)]
pub struct ApiError(pub Error);
impl From<Error> for ApiError {
	fn from(value: Error) -> Self {
		Self(value)
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let err = self.0;
		let kind = err.kind();
		let status = kind.status();
		let mut response = match fixed_message(kind) {
			Some(message) => {
				if kind == ErrorKind::Internal {
					tracing::error!(error = %err, "internal error");
				} else {
					tracing::warn!(error = %err, code = err.code(), "upstream error");
				}

				let mut response = error_body(status, kind.as_str(), err.code(), message);

				response.extensions_mut().insert(InternalDetail {
					kind: kind.as_str(),
					code: err.code(),
					detail: err.to_string(),
				});

				response
			},
			None => error_body(status, kind.as_str(), err.code(), &err.to_string()),
		};

		if let Error::RateLimited { retry_after, .. } = &err {
			let secs = retry_after.as_secs().max(1);

			response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
		}

		response
	}
}

/// Hidden text of a server-side error, surfaced only by [`expose_internal_detail`].
#[derive(Clone, Debug)]
pub(crate) struct InternalDetail {
	kind: &'static str,
	code: &'static str,
	detail: String,
}

/// Rewrite hidden error bodies with their real message (development only).
pub(crate) async fn expose_internal_detail(request: Request, next: Next) -> Response {
	let mut response = next.run(request).await;

	match response.extensions_mut().remove::<InternalDetail>() {
		Some(InternalDetail { kind, code, detail }) =>
			error_body(response.status(), kind, code, &detail),
		None => response,
	}
}

pub(crate) fn not_found() -> Response {
	error_body(StatusCode::NOT_FOUND, "invalid_request_error", "not_found", "route not found")
}

fn fixed_message(kind: ErrorKind) -> Option<&'static str> {
	match kind {
		ErrorKind::Internal => Some(INTERNAL_MESSAGE),
		ErrorKind::UpstreamUnavailable => Some(UPSTREAM_MESSAGE),
		ErrorKind::NotConfigured => Some(NOT_CONFIGURED_MESSAGE),
		_ => None,
	}
}

fn error_body(status: StatusCode, kind: &str, code: &str, message: &str) -> Response {
	let body = Json(json!({
		"error": {
			"message": message,
			"type": kind,
			"code": code,
		}
	}));

	(status, body).into_response()
}
