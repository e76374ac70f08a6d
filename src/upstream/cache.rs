//! Single-flight cache for the upstream installation token.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use serde::Serialize;
use tokio::{sync::Mutex, time};
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::UpstreamConfig,
	metrics::{CacheMetrics, CacheMetricsSnapshot},
	upstream::{
		InstallationTokenFetcher,
		state::{
			ABORTED_FLIGHT, CacheEntry, CacheState, CachedUpstreamToken, Flight, FlightOutcome,
			FlightReceiver, FlightSender,
		},
	},
};

/// Caches one upstream token and coalesces concurrent refetches into a single fetch.
///
/// The entry lock is held only while inspecting or updating state, never across the fetch.
/// Each fetch runs in its own task bounded by `fetch_timeout` and publishes its outcome through
/// a watch channel, so a caller giving up early does not cancel it for the others.
#[derive(Clone)]
pub struct UpstreamTokenCache {
	fetcher: Arc<dyn InstallationTokenFetcher>,
	clock: Arc<dyn Clock>,
	config: UpstreamConfig,
	entry: Arc<Mutex<CacheEntry>>,
	metrics: Arc<CacheMetrics>,
}
impl UpstreamTokenCache {
	/// Build a cache around `fetcher`.
	pub fn new(
		fetcher: Arc<dyn InstallationTokenFetcher>,
		clock: Arc<dyn Clock>,
		config: UpstreamConfig,
	) -> Self {
		Self {
			fetcher,
			clock,
			config,
			entry: Arc::new(Mutex::new(CacheEntry::default())),
			metrics: CacheMetrics::new(),
		}
	}

	/// Cache settings.
	pub fn config(&self) -> &UpstreamConfig {
		&self.config
	}

	/// Access the cache metrics accumulator.
	pub fn metrics(&self) -> Arc<CacheMetrics> {
		self.metrics.clone()
	}

	/// Return a fresh token, fetching at most once across all concurrent callers.
	///
	/// If `timeout` elapses first, a token that has not yet expired is served even when it sits
	/// inside the safety margin; otherwise the call fails with [`Error::UpstreamUnavailable`].
	#[tracing::instrument(skip(self))]
	pub async fn get(&self, timeout: Duration) -> Result<Arc<CachedUpstreamToken>> {
		let (mut receiver, fallback) = {
			let mut entry = self.entry.lock().await;
			let now = self.clock.now();

			if let Some(current) = entry.current()
				&& current.is_fresh(now, self.config.safety_margin)
			{
				self.metrics.record_hit(false);

				return Ok(current.clone());
			}

			let fallback = entry.current().cloned();
			let receiver = match entry.join_or_begin() {
				Flight::Join(receiver) => {
					tracing::debug!("joining in-flight upstream fetch");

					receiver
				},
				Flight::Lead { generation, sender, receiver } => {
					tracing::debug!(generation, "starting upstream fetch");

					self.spawn_flight(generation, sender);

					receiver
				},
			};

			(receiver, fallback)
		};
		let reason = match time::timeout(timeout, wait_for_outcome(&mut receiver)).await {
			Ok(Ok(token)) => {
				self.metrics.record_miss();

				return Ok(token);
			},
			Ok(Err(reason)) => reason,
			Err(_) => format!("no upstream token within {timeout:?}"),
		};

		match fallback {
			Some(token) if token.is_usable(self.clock.now()) => {
				tracing::warn!(
					reason = %reason,
					expires_at = %token.expires_at,
					"upstream refresh failed, serving cached token"
				);

				self.metrics.record_hit(true);

				Ok(token)
			},
			_ => {
				self.metrics.record_miss();

				Err(Error::UpstreamUnavailable(reason))
			},
		}
	}

	/// Drop the cached token; the next [`get`](Self::get) always refetches.
	///
	/// A fetch already in flight still answers its current waiters but is not installed.
	#[tracing::instrument(skip(self))]
	pub async fn invalidate(&self) {
		self.entry.lock().await.invalidate();

		tracing::info!("upstream token invalidated");
	}

	/// Capture the current state for status reporting.
	pub async fn snapshot(&self) -> UpstreamSnapshot {
		let entry = self.entry.lock().await;
		let current = entry.current();

		UpstreamSnapshot {
			state: entry.state(),
			expires_at: current.map(|token| token.expires_at),
			fetched_at: current.map(|token| token.fetched_at),
			last_error: entry.last_error().map(str::to_owned),
			metrics: self.metrics.snapshot(),
			captured_at: self.clock.now(),
		}
	}

	fn spawn_flight(&self, generation: u64, sender: FlightSender) {
		let cache = self.clone();

		tokio::spawn(async move {
			let outcome = cache.fetch_once().await;
			let installed = cache.entry.lock().await.complete(generation, &outcome);

			if !installed {
				tracing::debug!(generation, "discarding result of invalidated upstream fetch");
			}

			// Nobody left waiting is fine.
			let _ = sender.send(Some(outcome));
		});
	}

	async fn fetch_once(&self) -> FlightOutcome {
		let started = Instant::now();
		let fetched = time::timeout(self.config.fetch_timeout, self.fetcher.fetch()).await;
		let elapsed = started.elapsed();
		let outcome = match fetched {
			Ok(Ok(token)) => {
				let fetched_at = self.clock.now();
				let expires_at = match token.expires_at {
					Some(expires_at) => expires_at,
					None => TimeDelta::from_std(self.config.default_ttl)
						.ok()
						.and_then(|ttl| fetched_at.checked_add_signed(ttl))
						.unwrap_or(DateTime::<Utc>::MAX_UTC),
				};

				if expires_at <= fetched_at {
					Err(format!("upstream returned a token that expired at {expires_at}"))
				} else {
					Ok(Arc::new(CachedUpstreamToken { value: token.value, expires_at, fetched_at }))
				}
			},
			Ok(Err(err)) => Err(err.to_string()),
			Err(_) => Err(format!("upstream fetch exceeded {:?}", self.config.fetch_timeout)),
		};

		match &outcome {
			Ok(token) => {
				self.metrics.record_fetch_success(elapsed);

				tracing::info!(expires_at = %token.expires_at, elapsed = ?elapsed, "upstream token fetched");
			},
			Err(reason) => {
				self.metrics.record_fetch_error(elapsed);

				tracing::warn!(reason = %reason, elapsed = ?elapsed, "upstream token fetch failed");
			},
		}

		outcome
	}
}
impl Debug for UpstreamTokenCache {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("UpstreamTokenCache")
			.field("config", &self.config)
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}

/// Point-in-time view of the cache for monitoring.
#[derive(Clone, Debug, Serialize)]
pub struct UpstreamSnapshot {
	/// Lifecycle state.
	pub state: CacheState,
	/// Expiry of the cached token, if any.
	pub expires_at: Option<DateTime<Utc>>,
	/// When the cached token was fetched, if any.
	pub fetched_at: Option<DateTime<Utc>>,
	/// Reason of the most recent failed fetch since the last success.
	pub last_error: Option<String>,
	/// Lookup and fetch counters.
	pub metrics: CacheMetricsSnapshot,
	/// Wall-clock capture time.
	pub captured_at: DateTime<Utc>,
}

async fn wait_for_outcome(receiver: &mut FlightReceiver) -> FlightOutcome {
	match receiver.wait_for(Option::is_some).await {
		Ok(outcome) => outcome.clone().unwrap_or_else(|| Err("upstream fetch vanished".into())),
		Err(_) => Err(ABORTED_FLIGHT.into()),
	}
}
