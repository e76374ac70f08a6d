//! Upstream cache state machine.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use serde::Serialize;
use tokio::sync::watch;
// self
use crate::{_prelude::*, security};

pub(crate) const ABORTED_FLIGHT: &str = "upstream fetch aborted";

pub(crate) type FlightOutcome = std::result::Result<Arc<CachedUpstreamToken>, String>;
pub(crate) type FlightSender = watch::Sender<Option<FlightOutcome>>;
pub(crate) type FlightReceiver = watch::Receiver<Option<FlightOutcome>>;

/// Immutable token published by the cache.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedUpstreamToken {
	/// Opaque token string.
	pub value: String,
	/// Instant after which the token must not be served.
	pub expires_at: DateTime<Utc>,
	/// When the token was received.
	pub fetched_at: DateTime<Utc>,
}
impl CachedUpstreamToken {
	/// Whether the token may be served without refetching.
	pub fn is_fresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
		match TimeDelta::from_std(safety_margin) {
			Ok(margin) => now < self.expires_at - margin,
			Err(_) => false,
		}
	}

	/// Whether the token is still valid upstream, even if inside the safety margin.
	pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
		now < self.expires_at
	}
}
impl Debug for CachedUpstreamToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("CachedUpstreamToken")
			.field("value", &security::fingerprint(&self.value))
			.field("expires_at", &self.expires_at)
			.field("fetched_at", &self.fetched_at)
			.finish()
	}
}

/// Cache lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
	/// No token and no fetch in progress.
	Empty,
	/// First fetch is underway.
	Loading,
	/// A token is cached.
	Ready,
	/// A token is cached while a replacement is being fetched.
	Refreshing,
}

/// What a caller should do after consulting the entry under the lock.
pub(crate) enum Flight {
	/// Another caller already started a fetch.
	Join(FlightReceiver),
	/// The caller must run the fetch and publish through `sender`.
	Lead { generation: u64, sender: FlightSender, receiver: FlightReceiver },
}

#[derive(Debug, Default)]
pub(crate) struct CacheEntry {
	current: Option<Arc<CachedUpstreamToken>>,
	flight: Option<FlightReceiver>,
	generation: u64,
	last_error: Option<String>,
}
impl CacheEntry {
	pub(crate) fn state(&self) -> CacheState {
		match (&self.current, self.live_flight()) {
			(None, None) => CacheState::Empty,
			(None, Some(_)) => CacheState::Loading,
			(Some(_), None) => CacheState::Ready,
			(Some(_), Some(_)) => CacheState::Refreshing,
		}
	}

	pub(crate) fn current(&self) -> Option<&Arc<CachedUpstreamToken>> {
		self.current.as_ref()
	}

	pub(crate) fn last_error(&self) -> Option<&str> {
		self.last_error.as_deref()
	}

	/// Join the in-flight fetch or register a new one.
	///
	/// A flight whose task ended without publishing is abandoned and replaced.
	pub(crate) fn join_or_begin(&mut self) -> Flight {
		if let Some(receiver) = self.live_flight() {
			return Flight::Join(receiver.clone());
		}
		if self.flight.take().is_some() {
			self.last_error = Some(ABORTED_FLIGHT.into());
		}

		let (sender, receiver) = watch::channel(None);

		self.flight = Some(receiver.clone());

		Flight::Lead { generation: self.generation, sender, receiver }
	}

	/// Record the outcome of the fetch started at `generation`.
	///
	/// Returns `false` when the entry was invalidated in the meantime; the outcome is then left
	/// uninstalled.
	pub(crate) fn complete(&mut self, generation: u64, outcome: &FlightOutcome) -> bool {
		if generation != self.generation {
			return false;
		}

		self.flight = None;

		match outcome {
			Ok(token) => {
				self.current = Some(token.clone());
				self.last_error = None;
			},
			Err(reason) => self.last_error = Some(reason.clone()),
		}

		true
	}

	fn live_flight(&self) -> Option<&FlightReceiver> {
		// A closed channel means the sender was dropped before an outcome was sent.
		self.flight.as_ref().filter(|receiver| receiver.has_changed().is_ok())
	}

	/// Drop the cached token and detach any in-flight fetch.
	pub(crate) fn invalidate(&mut self) {
		self.current = None;
		self.flight = None;
		self.generation = self.generation.wrapping_add(1);
	}
}
