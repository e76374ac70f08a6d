//! Short-lived bearer credential broker for devices and CI agents, with a single-flight upstream
//! installation-token cache and sliding-window rate limiting.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod clock;
pub mod config;
pub mod credential;
pub mod issuance;
pub mod limiter;
pub mod metrics;
pub mod security;
pub mod server;
pub mod upstream;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	auth::{AuthGate, DeviceIdentity, DeviceVerifier, StaticDeviceVerifier},
	clock::{Clock, ManualClock, SystemClock},
	config::BrokerConfig,
	credential::{Claims, CredentialSigner, IssuedCredential, RevocationList, TokenKind},
	error::{Error, ErrorKind, Result},
	issuance::IssuanceService,
	limiter::SlidingWindowLimiter,
	upstream::{
		CachedUpstreamToken, GitHubAppFetcher, InstallationTokenFetcher, UpstreamToken,
		UpstreamTokenCache,
	},
};
