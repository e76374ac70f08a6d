//! Request authentication: bearer credentials and device serials.

// crates.io
use async_trait::async_trait;
use http::{HeaderMap, header::AUTHORIZATION};
use serde::Serialize;
use subtle::ConstantTimeEq;
// self
use crate::{
	_prelude::*,
	config::DeviceAuthConfig,
	credential::{Claims, CredentialSigner},
};

/// Header carrying the device serial number.
pub const DEVICE_SERIAL_HEADER: &str = "x-device-serial";

/// Yes/no verdict on a device serial.
#[async_trait]
pub trait DeviceVerifier: Send + Sync {
	/// Whether `serial` belongs to a known device.
	async fn verify(&self, serial: &str) -> bool;
}

/// Verifier backed by the configured allowlist.
#[derive(Clone, Debug)]
pub struct StaticDeviceVerifier {
	enabled: bool,
	allowed: Vec<String>,
}
impl StaticDeviceVerifier {
	/// Build from configuration.
	pub fn new(config: &DeviceAuthConfig) -> Self {
		Self { enabled: config.enabled, allowed: config.allowed_serials.clone() }
	}

	/// Accept every non-blank serial.
	pub fn allow_all() -> Self {
		Self { enabled: false, allowed: Vec::new() }
	}
}
#[async_trait]
impl DeviceVerifier for StaticDeviceVerifier {
	async fn verify(&self, serial: &str) -> bool {
		let serial = serial.trim();

		if serial.is_empty() {
			return false;
		}
		if !self.enabled || self.allowed.is_empty() {
			return true;
		}

		self.allowed.iter().any(|allowed| allowed.as_bytes().ct_eq(serial.as_bytes()).into())
	}
}

/// Authenticated device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
	/// Device serial number.
	pub serial: String,
}

/// Extracts and verifies caller identity from request headers.
#[derive(Clone)]
pub struct AuthGate {
	signer: CredentialSigner,
	verifier: Arc<dyn DeviceVerifier>,
}
impl AuthGate {
	/// Build a gate over the given signer and device verifier.
	pub fn new(signer: CredentialSigner, verifier: Arc<dyn DeviceVerifier>) -> Self {
		Self { signer, verifier }
	}

	/// Require a valid access credential in `Authorization: Bearer <token>`.
	pub async fn authenticate_bearer(&self, headers: &HeaderMap) -> Result<Claims> {
		let value = headers.get(AUTHORIZATION).ok_or(Error::NoCredential)?;
		let value = value.to_str().map_err(|_| Error::BadScheme)?.trim();
		let (scheme, token) = value.split_once(char::is_whitespace).ok_or(Error::BadScheme)?;
		let token = token.trim();

		if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
			return Err(Error::BadScheme);
		}

		self.signer.verify_access(token).await
	}

	/// Require a known device serial in `X-Device-Serial`.
	pub async fn authenticate_device(&self, headers: &HeaderMap) -> Result<DeviceIdentity> {
		let serial = device_serial(headers).ok_or(Error::NoCredential)?;

		if !self.verifier.verify(&serial).await {
			tracing::info!(serial = %serial, "device rejected");

			return Err(Error::DeviceRejected { serial });
		}

		Ok(DeviceIdentity { serial })
	}

	/// Device identity when present and accepted; never fails.
	pub async fn optional_device(&self, headers: &HeaderMap) -> Option<DeviceIdentity> {
		self.authenticate_device(headers).await.ok()
	}
}
impl std::fmt::Debug for AuthGate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthGate").field("signer", &self.signer).finish_non_exhaustive()
	}
}

fn device_serial(headers: &HeaderMap) -> Option<String> {
	headers
		.get(DEVICE_SERIAL_HEADER)
		.and_then(|value| value.to_str().ok())
		.map(str::trim)
		.filter(|serial| !serial.is_empty())
		.map(str::to_owned)
}
