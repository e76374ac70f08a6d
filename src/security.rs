//! Security utilities covering credential fingerprints, identifier generation, and HTTPS
//! enforcement for upstream endpoints.
//!
//! # Threat Model
//! Bearer credentials and upstream installation tokens grant access on their own, so they never
//! reach logs verbatim. Logs carry a truncated SHA-256 fingerprint that is stable per credential
//! but useless for replay.

// crates.io
use base64::prelude::*;
use rand::RngCore;
use sha2::{Digest, Sha256};
use url::Url;
// self
use crate::_prelude::*;

const FINGERPRINT_BYTES: usize = 9;
const JTI_BYTES: usize = 16;

/// Short, log-safe fingerprint of a secret value.
pub fn fingerprint(secret: &str) -> String {
	let digest = Sha256::digest(secret.as_bytes());

	BASE64_URL_SAFE_NO_PAD.encode(&digest[..FINGERPRINT_BYTES])
}

/// Fresh random credential identifier (`jti`).
pub fn random_jti() -> String {
	let mut bytes = [0u8; JTI_BYTES];

	rand::rng().fill_bytes(&mut bytes);

	BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// Ensure the provided URL uses HTTPS.
pub fn enforce_https(url: &Url) -> Result<()> {
	if url.scheme() == "https" {
		Ok(())
	} else {
		Err(Error::Validation {
			field: "upstream.api_base",
			reason: format!("Upstream URL {url} must use HTTPS."),
		})
	}
}
