//! Metrics helpers and per-cache telemetry bookkeeping.

// std
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
// crates.io
use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::{_prelude::*, credential::TokenKind};

type LabelSet = SmallVec<[Label; 2]>;

const METRIC_ISSUED_TOTAL: &str = "token_broker_credentials_issued_total";
const METRIC_VERIFY_FAILURES: &str = "token_broker_verify_failures_total";
const METRIC_RATE_LIMITED: &str = "token_broker_rate_limited_total";
const METRIC_UPSTREAM_REQUESTS: &str = "token_broker_upstream_requests_total";
const METRIC_UPSTREAM_FETCH_TOTAL: &str = "token_broker_upstream_fetch_total";
const METRIC_UPSTREAM_FETCH_DURATION: &str = "token_broker_upstream_fetch_duration_seconds";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe accumulator for a single upstream token cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	total_requests: AtomicU64,
	cache_hits: AtomicU64,
	stale_serves: AtomicU64,
	fetch_successes: AtomicU64,
	fetch_errors: AtomicU64,
	last_fetch_micros: AtomicU64,
}
impl CacheMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a hit outcome.
	pub fn record_hit(&self, stale: bool) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.cache_hits.fetch_add(1, Ordering::Relaxed);
		if stale {
			self.stale_serves.fetch_add(1, Ordering::Relaxed);
		}

		record_upstream_request(if stale { "stale" } else { "hit" });
	}

	/// Record a miss outcome.
	pub fn record_miss(&self) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);

		record_upstream_request("miss");
	}

	/// Record a successful fetch and its latency.
	pub fn record_fetch_success(&self, duration: Duration) {
		self.fetch_successes.fetch_add(1, Ordering::Relaxed);
		self.last_fetch_micros.store(duration.as_micros() as u64, Ordering::Relaxed);

		record_upstream_fetch("success", duration);
	}

	/// Record a fetch failure.
	pub fn record_fetch_error(&self, duration: Duration) {
		self.fetch_errors.fetch_add(1, Ordering::Relaxed);

		record_upstream_fetch("error", duration);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> CacheMetricsSnapshot {
		CacheMetricsSnapshot {
			total_requests: self.total_requests.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			stale_serves: self.stale_serves.load(Ordering::Relaxed),
			fetch_successes: self.fetch_successes.load(Ordering::Relaxed),
			fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
			last_fetch_micros: match self.last_fetch_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of upstream cache counters.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CacheMetricsSnapshot {
	/// Total number of cache lookups observed.
	pub total_requests: u64,
	/// Count of lookups served from the cache.
	pub cache_hits: u64,
	/// Count of lookups served from a token inside its safety margin.
	pub stale_serves: u64,
	/// Count of successful upstream fetches.
	pub fetch_successes: u64,
	/// Count of failed upstream fetches.
	pub fetch_errors: u64,
	/// Microsecond latency of the most recent successful fetch.
	pub last_fetch_micros: Option<u64>,
}
impl CacheMetricsSnapshot {
	/// Ratio of hits to lookups.
	pub fn hit_rate(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.cache_hits as f64 / self.total_requests as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a minted credential.
pub fn record_issued(kind: TokenKind) {
	metrics::counter!(METRIC_ISSUED_TOTAL, labels("kind", kind.as_str()).iter()).increment(1);
}

/// Record a failed verification, tagged with its stable error code.
pub fn record_verify_failure(reason: &'static str) {
	metrics::counter!(METRIC_VERIFY_FAILURES, labels("reason", reason).iter()).increment(1);
}

/// Record a request rejected by the sliding-window limiter.
pub fn record_rate_limited(route: &str) {
	let mut labels = LabelSet::new();

	labels.push(Label::new("route", route.to_owned()));

	metrics::counter!(METRIC_RATE_LIMITED, labels.iter()).increment(1);
}

fn record_upstream_request(outcome: &'static str) {
	metrics::counter!(METRIC_UPSTREAM_REQUESTS, labels("outcome", outcome).iter()).increment(1);
}

fn record_upstream_fetch(status: &'static str, duration: Duration) {
	metrics::counter!(METRIC_UPSTREAM_FETCH_TOTAL, labels("status", status).iter()).increment(1);
	metrics::histogram!(METRIC_UPSTREAM_FETCH_DURATION, labels("status", status).iter())
		.record(duration.as_secs_f64());
}

fn labels(key: &'static str, value: &'static str) -> LabelSet {
	let mut labels = LabelSet::new();

	labels.push(Label::new(key, value));

	labels
}
