//! Claims carried inside every bearer credential.

// std
use std::collections::BTreeSet;
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Whether a credential grants access or may only be exchanged for a new access credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	/// Presented on API calls.
	Access,
	/// Exchanged for a fresh access credential.
	Refresh,
}
impl TokenKind {
	/// Wire and label representation.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Access => "access",
			Self::Refresh => "refresh",
		}
	}
}

/// Signed claim set.
///
/// Timestamps are carried as whole seconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
	/// Subject the credential was issued to.
	pub sub: String,
	/// Granted scopes or roles.
	#[serde(default)]
	pub scopes: BTreeSet<String>,
	/// Access or refresh.
	pub kind: TokenKind,
	/// Issue time.
	#[serde(with = "chrono::serde::ts_seconds")]
	pub iat: DateTime<Utc>,
	/// Expiry time; the credential is invalid from this instant on.
	#[serde(with = "chrono::serde::ts_seconds")]
	pub exp: DateTime<Utc>,
	/// Issuer.
	pub iss: String,
	/// Unique credential identifier, used for revocation.
	pub jti: String,
}
impl Claims {
	/// Whether the credential has expired at `now`.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.exp
	}

	/// Remaining lifetime at `now`, zero once expired.
	pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
		(self.exp - now).to_std().unwrap_or_default()
	}

	/// Whether the claim set grants `scope`.
	pub fn has_scope(&self, scope: &str) -> bool {
		self.scopes.contains(scope)
	}
}
