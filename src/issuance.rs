//! Issuance orchestration over the credential signer and the upstream token cache.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use serde::Serialize;
// self
use crate::{
	_prelude::*,
	auth::DeviceIdentity,
	config::{BrokerConfig, GitHubAppConfig, RegistryConfig, SigningConfig},
	credential::{Claims, CredentialSigner, IssuedCredential, TokenKind},
	upstream::{UpstreamSnapshot, UpstreamTokenCache},
};

/// Access credential paired with the refresh credential that renews it.
#[derive(Clone, Debug)]
pub struct CredentialPair {
	/// Credential presented on API calls.
	pub access: IssuedCredential,
	/// Credential exchanged for new access credentials.
	pub refresh: IssuedCredential,
}

/// Outcome of a validation request; invalid credentials are a normal answer, not an error.
#[derive(Clone, Debug, Serialize)]
pub struct CredentialValidation {
	/// Whether the credential verified.
	pub valid: bool,
	/// Claims of a valid credential.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub claims: Option<Claims>,
	/// Stable failure code of an invalid credential.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<&'static str>,
}

/// Details about the caller's own credential.
#[derive(Clone, Debug, Serialize)]
pub struct CredentialInfo {
	/// Verified claims.
	pub claims: Claims,
	/// Whole seconds until expiry.
	pub expires_in_seconds: u64,
}

/// Upstream token packaged with the registry coordinates it unlocks.
#[derive(Clone, Serialize)]
pub struct RegistryCredential {
	/// Upstream installation token used as the registry password.
	pub token: String,
	/// Token expiry.
	pub expires_at: DateTime<Utc>,
	/// Registry host.
	pub registry: String,
	/// Registry login name.
	pub username: String,
}
impl RegistryCredential {
	/// Shell command that logs a device into the registry with this credential.
	pub fn login_command(&self) -> String {
		format!(
			"echo {} | balena login {} -u {} --password-stdin",
			self.token, self.registry, self.username
		)
	}
}
impl Debug for RegistryCredential {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("RegistryCredential")
			.field("token", &crate::security::fingerprint(&self.token))
			.field("expires_at", &self.expires_at)
			.field("registry", &self.registry)
			.field("username", &self.username)
			.finish()
	}
}

/// Monitoring view of the upstream integration.
#[derive(Clone, Debug, Serialize)]
pub struct UpstreamStatus {
	/// Whether the GitHub App integration is configured.
	pub github_app_configured: bool,
	/// Configured app identifier.
	pub github_app_id: Option<String>,
	/// Configured installation identifier.
	pub installation_id: Option<String>,
	/// Whether a private key location is configured.
	pub private_key_configured: bool,
	/// Registry host.
	pub registry_url: String,
	/// Registry login name.
	pub registry_username: String,
	/// Configured and currently holding or able to obtain a token.
	pub healthy: bool,
	/// Reason the integration is unhealthy.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Cache state, when configured.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache: Option<UpstreamSnapshot>,
}

impl UpstreamStatus {
	/// Replace upstream failure text with a generic reason, keeping only whether one occurred.
	pub fn without_error_detail(mut self) -> Self {
		const REDACTED: &str = "upstream token unavailable";

		if self.github_app_configured && self.error.is_some() {
			self.error = Some(REDACTED.into());
		}
		if let Some(cache) = &mut self.cache
			&& cache.last_error.is_some()
		{
			cache.last_error = Some(REDACTED.into());
		}

		self
	}
}

/// Application service behind the HTTP handlers.
#[derive(Clone)]
pub struct IssuanceService {
	signer: CredentialSigner,
	upstream: Option<UpstreamTokenCache>,
	signing: SigningConfig,
	registry: RegistryConfig,
	github: Option<GitHubAppConfig>,
}
impl IssuanceService {
	/// Wire the service. `upstream` is `None` when the GitHub App integration is disabled.
	pub fn new(
		config: &BrokerConfig,
		signer: CredentialSigner,
		upstream: Option<UpstreamTokenCache>,
	) -> Self {
		Self {
			signer,
			upstream,
			signing: config.signing.clone(),
			registry: config.registry.clone(),
			github: config.github.clone(),
		}
	}

	/// Underlying signer.
	pub fn signer(&self) -> &CredentialSigner {
		&self.signer
	}

	/// Mint an access credential.
	pub fn issue_access_credential(
		&self,
		subject: &str,
		scopes: &[String],
		ttl: Option<Duration>,
	) -> Result<IssuedCredential> {
		let ttl = self.resolve_ttl(ttl, self.signing.access_ttl)?;

		self.signer.issue(subject, scopes.iter().cloned(), TokenKind::Access, ttl)
	}

	/// Mint an access credential and its refresh credential.
	pub fn issue_credential_pair(
		&self,
		subject: &str,
		scopes: &[String],
		ttl: Option<Duration>,
	) -> Result<CredentialPair> {
		let access = self.issue_access_credential(subject, scopes, ttl)?;
		let refresh = self.signer.issue(
			subject,
			scopes.iter().cloned(),
			TokenKind::Refresh,
			self.signing.refresh_ttl,
		)?;

		Ok(CredentialPair { access, refresh })
	}

	/// Exchange a refresh credential for a new access credential.
	pub async fn refresh_credential(
		&self,
		refresh_token: &str,
		ttl: Option<Duration>,
	) -> Result<IssuedCredential> {
		let ttl = self.resolve_ttl(ttl, self.signing.access_ttl)?;

		self.signer.refresh(refresh_token, ttl).await
	}

	/// Check a credential of either kind.
	pub async fn validate_credential(&self, token: &str) -> CredentialValidation {
		match self.signer.verify(token).await {
			Ok(claims) => CredentialValidation { valid: true, claims: Some(claims), reason: None },
			Err(err) => CredentialValidation { valid: false, claims: None, reason: Some(err.code()) },
		}
	}

	/// Describe an already verified credential.
	pub fn credential_info(&self, claims: Claims) -> CredentialInfo {
		let expires_in_seconds = claims.remaining(self.signer.clock().now()).as_secs();

		CredentialInfo { claims, expires_in_seconds }
	}

	/// Revoke `token` on behalf of `caller`; only credentials of the same subject may be revoked.
	pub async fn revoke_credential(&self, caller: &Claims, token: &str) -> Result<Claims> {
		let target = self.signer.verify(token).await?;

		if target.sub != caller.sub {
			return Err(Error::InvalidInput {
				field: "token",
				reason: "Credential belongs to a different subject.".into(),
			});
		}

		self.signer.revoke(token).await
	}

	/// Cached upstream token for a device, fetched on miss or expiry.
	#[tracing::instrument(skip(self, device), fields(device = %device.serial))]
	pub async fn get_registry_credential(
		&self,
		device: &DeviceIdentity,
	) -> Result<RegistryCredential> {
		let upstream = self.upstream()?;
		let token = upstream.get(upstream.config().caller_timeout).await?;

		tracing::info!(expires_at = %token.expires_at, "registry credential handed out");

		Ok(RegistryCredential {
			token: token.value.clone(),
			expires_at: token.expires_at,
			registry: self.registry.url.clone(),
			username: self.registry.username.clone(),
		})
	}

	/// Discard the cached upstream token and fetch a new one.
	#[tracing::instrument(skip(self, device), fields(device = %device.serial))]
	pub async fn refresh_registry_credential(
		&self,
		device: &DeviceIdentity,
	) -> Result<RegistryCredential> {
		self.upstream()?.invalidate().await;

		self.get_registry_credential(device).await
	}

	/// Configuration and cache state of the upstream integration.
	pub async fn upstream_status(&self) -> UpstreamStatus {
		let cache = match &self.upstream {
			Some(upstream) => Some(upstream.snapshot().await),
			None => None,
		};
		let error = match &self.github {
			None => Some("GitHub App integration is not configured.".to_owned()),
			Some(github) => match github.validate() {
				Err(err) => Some(err.to_string()),
				// A failed refresh only matters once nothing usable is cached.
				Ok(()) => cache
					.as_ref()
					.filter(|snapshot| snapshot.expires_at.is_none())
					.and_then(|snapshot| snapshot.last_error.clone()),
			},
		};

		UpstreamStatus {
			github_app_configured: self.github.is_some(),
			github_app_id: self.github.as_ref().map(|github| github.app_id.clone()),
			installation_id: self.github.as_ref().map(|github| github.installation_id.clone()),
			private_key_configured: self
				.github
				.as_ref()
				.is_some_and(|github| !github.private_key_path.as_os_str().is_empty()),
			registry_url: self.registry.url.clone(),
			registry_username: self.registry.username.clone(),
			healthy: error.is_none() && cache.is_some(),
			error,
			cache,
		}
	}

	fn upstream(&self) -> Result<&UpstreamTokenCache> {
		self.upstream.as_ref().ok_or_else(|| {
			Error::NotConfigured("GITHUB_APP_ID and GITHUB_INSTALLATION_ID are required.".into())
		})
	}

	fn resolve_ttl(&self, requested: Option<Duration>, fallback: Duration) -> Result<Duration> {
		match requested {
			None => Ok(fallback),
			Some(ttl) if ttl > self.signing.max_ttl => Err(Error::InvalidInput {
				field: "ttl_seconds",
				reason: format!("Must not exceed {} seconds.", self.signing.max_ttl.as_secs()),
			}),
			Some(ttl) => Ok(ttl),
		}
	}
}
impl Debug for IssuanceService {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("IssuanceService")
			.field("signer", &self.signer)
			.field("upstream", &self.upstream)
			.field("registry", &self.registry)
			.finish_non_exhaustive()
	}
}
