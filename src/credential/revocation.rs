//! In-memory denylist of revoked credential identifiers.
//!
//! Entries are kept only until the credential they name would have expired on its own; after
//! that the signature check already rejects it.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::RwLock;
// self
use crate::_prelude::*;

/// Revoked `jti` values mapped to the expiry of the credential they belong to.
#[derive(Debug, Default)]
pub struct RevocationList {
	entries: RwLock<HashMap<String, DateTime<Utc>>>,
}
impl RevocationList {
	/// Create an empty list.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Deny `jti` until `expires_at`. Revoking twice is a no-op.
	pub async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) {
		self.entries.write().await.insert(jti.to_owned(), expires_at);
	}

	/// Whether `jti` is currently denied.
	pub async fn is_revoked(&self, jti: &str, now: DateTime<Utc>) -> bool {
		self.entries.read().await.get(jti).is_some_and(|expires_at| now < *expires_at)
	}

	/// Drop entries whose credentials have expired, returning how many were removed.
	pub async fn purge(&self, now: DateTime<Utc>) -> usize {
		let mut entries = self.entries.write().await;
		let before = entries.len();

		entries.retain(|_, expires_at| now < *expires_at);

		before - entries.len()
	}

	/// Number of tracked identifiers.
	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	/// Whether nothing is tracked.
	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}
}
