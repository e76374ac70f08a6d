//! Route handlers and their wire types.

// crates.io
use axum::{
	Json,
	extract::{State, rejection::JsonRejection},
	http::{HeaderMap, StatusCode},
	response::IntoResponse,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
// self
use crate::{
	_prelude::*,
	issuance::{CredentialInfo, CredentialValidation, RegistryCredential, UpstreamStatus},
	server::{AppState, response::ApiError},
};

type ApiResult<T> = std::result::Result<T, ApiError>;

const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Deserialize)]
pub(crate) struct IssueRequest {
	#[serde(default)]
	subject: Option<String>,
	#[serde(default)]
	scopes: Vec<String>,
	#[serde(default)]
	ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshRequest {
	#[serde(alias = "refresh_token")]
	token: String,
	#[serde(default)]
	ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenRequest {
	token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct IssueResponse {
	token: String,
	expires_at: DateTime<Utc>,
	token_type: &'static str,
	scopes: Vec<String>,
	refresh_token: String,
	refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenResponse {
	token: String,
	expires_at: DateTime<Utc>,
	token_type: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RevokeResponse {
	revoked: bool,
	jti: String,
}

#[derive(Serialize)]
pub(crate) struct RegistryLoginResponse {
	#[serde(flatten)]
	credential: RegistryCredential,
	login_command: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
	status: &'static str,
	timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	service: Option<&'static str>,
}

pub(crate) async fn issue(
	State(state): State<AppState>,
	headers: HeaderMap,
	payload: std::result::Result<Json<IssueRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
	let device = state.auth.authenticate_device(&headers).await?;
	let request = json_body(payload)?;
	let subject = request.subject.unwrap_or_else(|| device.serial.clone());
	let pair = state.issuance.issue_credential_pair(
		&subject,
		&request.scopes,
		request.ttl_seconds.map(Duration::from_secs),
	)?;

	tracing::info!(device = %device.serial, subject = %subject, "credential pair issued");

	let response = IssueResponse {
		token: pair.access.token,
		expires_at: pair.access.claims.exp,
		token_type: TOKEN_TYPE,
		scopes: pair.access.claims.scopes.into_iter().collect(),
		refresh_token: pair.refresh.token,
		refresh_expires_at: pair.refresh.claims.exp,
	};

	Ok((StatusCode::CREATED, Json(response)))
}

pub(crate) async fn refresh(
	State(state): State<AppState>,
	payload: std::result::Result<Json<RefreshRequest>, JsonRejection>,
) -> ApiResult<Json<TokenResponse>> {
	let request = json_body(payload)?;
	let issued = state
		.issuance
		.refresh_credential(&request.token, request.ttl_seconds.map(Duration::from_secs))
		.await?;

	Ok(Json(TokenResponse {
		token: issued.token,
		expires_at: issued.claims.exp,
		token_type: TOKEN_TYPE,
	}))
}

pub(crate) async fn validate(
	State(state): State<AppState>,
	payload: std::result::Result<Json<TokenRequest>, JsonRejection>,
) -> ApiResult<Json<CredentialValidation>> {
	let request = json_body(payload)?;

	Ok(Json(state.issuance.validate_credential(&request.token).await))
}

pub(crate) async fn revoke(
	State(state): State<AppState>,
	headers: HeaderMap,
	payload: std::result::Result<Json<TokenRequest>, JsonRejection>,
) -> ApiResult<Json<RevokeResponse>> {
	let caller = state.auth.authenticate_bearer(&headers).await?;
	let request = json_body(payload)?;
	let revoked = state.issuance.revoke_credential(&caller, &request.token).await?;

	Ok(Json(RevokeResponse { revoked: true, jti: revoked.jti }))
}

pub(crate) async fn info(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> ApiResult<Json<CredentialInfo>> {
	let claims = state.auth.authenticate_bearer(&headers).await?;

	Ok(Json(state.issuance.credential_info(claims)))
}

pub(crate) async fn registry_token(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> ApiResult<Json<RegistryCredential>> {
	let device = state.auth.authenticate_device(&headers).await?;

	Ok(Json(state.issuance.get_registry_credential(&device).await?))
}

pub(crate) async fn registry_credentials(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> ApiResult<Json<RegistryLoginResponse>> {
	let device = state.auth.authenticate_device(&headers).await?;
	let credential = state.issuance.get_registry_credential(&device).await?;
	let login_command = credential.login_command();

	Ok(Json(RegistryLoginResponse { credential, login_command }))
}

pub(crate) async fn refresh_registry_token(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> ApiResult<Json<RegistryCredential>> {
	let device = state.auth.authenticate_device(&headers).await?;

	Ok(Json(state.issuance.refresh_registry_credential(&device).await?))
}

pub(crate) async fn github_status(State(state): State<AppState>) -> Json<UpstreamStatus> {
	let status = state.issuance.upstream_status().await;

	if state.environment.is_development() {
		Json(status)
	} else {
		Json(status.without_error_detail())
	}
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
	Json(HealthResponse {
		status: "healthy",
		timestamp: state.clock.now(),
		service: Some(env!("CARGO_PKG_NAME")),
	})
}

pub(crate) async fn ready(State(state): State<AppState>) -> Json<HealthResponse> {
	Json(HealthResponse { status: "ready", timestamp: state.clock.now(), service: None })
}

#[cfg(feature = "prometheus")]
pub(crate) async fn metrics() -> impl IntoResponse {
	match crate::metrics::prometheus_handle() {
		Some(handle) => (StatusCode::OK, handle.render()),
		None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed".to_owned()),
	}
}

pub(crate) async fn fallback() -> impl IntoResponse {
	super::response::not_found()
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> ApiResult<T>
where
	T: DeserializeOwned,
{
	match payload {
		Ok(Json(body)) => Ok(body),
		Err(rejection) =>
			Err(Error::InvalidInput { field: "body", reason: rejection.body_text() }.into()),
	}
}
