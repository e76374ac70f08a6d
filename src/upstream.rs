//! Upstream installation-token retrieval and caching.

pub mod cache;
pub mod github;
pub mod state;

pub use cache::{UpstreamSnapshot, UpstreamTokenCache};
pub use github::GitHubAppFetcher;
pub use state::{CacheState, CachedUpstreamToken};

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use async_trait::async_trait;
// self
use crate::_prelude::*;

/// Token returned by an upstream before it is cached.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamToken {
	/// Opaque token string.
	pub value: String,
	/// Expiry reported by the upstream, if any.
	pub expires_at: Option<DateTime<Utc>>,
}
impl Debug for UpstreamToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("UpstreamToken")
			.field("value", &crate::security::fingerprint(&self.value))
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Source of installation tokens.
///
/// Implementations perform one attempt per call; the cache never retries on their behalf.
#[async_trait]
pub trait InstallationTokenFetcher: Send + Sync {
	/// Fetch a fresh token.
	async fn fetch(&self) -> Result<UpstreamToken>;
}
