//! Per-key sliding-window admission control.

// std
use std::{
	collections::{HashMap, VecDeque},
	sync::Weak,
};
// crates.io
use tokio::{sync::Mutex, task::JoinHandle, time};
// self
use crate::{_prelude::*, config::RateLimitConfig};

/// Exact sliding-window limiter keyed by an arbitrary string (typically the client address).
///
/// Each key keeps the arrival instants of its admitted requests in order. An instant `t` is live
/// while `now - t < window`; a request is admitted when fewer than `limit` live instants remain.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
	window: Duration,
	keys: Mutex<HashMap<String, VecDeque<Instant>>>,
}
impl SlidingWindowLimiter {
	/// Create a limiter with the given window.
	pub fn new(window: Duration) -> Arc<Self> {
		Arc::new(Self { window, keys: Mutex::new(HashMap::new()) })
	}

	/// Create a limiter from configuration.
	pub fn from_config(config: &RateLimitConfig) -> Arc<Self> {
		Self::new(config.window)
	}

	/// Trailing window length.
	pub fn window(&self) -> Duration {
		self.window
	}

	/// Admit or reject one request for `key`, recording it on admission.
	pub async fn allow(&self, key: &str, limit: u32) -> bool {
		if limit == 0 {
			return false;
		}

		let now = Instant::now();
		let mut keys = self.keys.lock().await;
		let arrivals = keys.entry(key.to_owned()).or_default();

		prune(arrivals, now, self.window);

		if arrivals.len() >= limit as usize {
			return false;
		}

		arrivals.push_back(now);

		true
	}

	/// Time until the oldest live arrival for `key` leaves the window.
	pub async fn retry_after(&self, key: &str) -> Duration {
		let now = Instant::now();
		let keys = self.keys.lock().await;

		keys.get(key)
			.and_then(|arrivals| {
				arrivals.iter().find(|arrival| now.duration_since(**arrival) < self.window)
			})
			.map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
			.unwrap_or_default()
	}

	/// Drop keys with no live arrivals, returning how many were removed.
	pub async fn sweep(&self) -> usize {
		let now = Instant::now();
		let mut keys = self.keys.lock().await;
		let before = keys.len();

		keys.retain(|_, arrivals| {
			prune(arrivals, now, self.window);

			!arrivals.is_empty()
		});

		before - keys.len()
	}

	/// Number of keys currently tracked.
	pub async fn tracked_keys(&self) -> usize {
		self.keys.lock().await.len()
	}

	/// Run [`sweep`](Self::sweep) every `interval` until the returned handle is dropped.
	pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
		let limiter = Arc::downgrade(self);
		let task = tokio::spawn(run_sweeper(limiter, interval));

		SweeperHandle { task }
	}
}

/// Owns the background sweep task; dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
	task: JoinHandle<()>,
}
impl Drop for SweeperHandle {
	fn drop(&mut self) {
		self.task.abort();
	}
}

async fn run_sweeper(limiter: Weak<SlidingWindowLimiter>, interval: Duration) {
	let mut ticker = time::interval_at(Instant::now() + interval, interval);

	ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;

		let Some(limiter) = limiter.upgrade() else {
			break;
		};
		let removed = limiter.sweep().await;

		if removed > 0 {
			tracing::debug!(removed, "swept idle rate-limit keys");
		}
	}
}

fn prune(arrivals: &mut VecDeque<Instant>, now: Instant, window: Duration) {
	while arrivals.front().is_some_and(|arrival| now.duration_since(*arrival) >= window) {
		arrivals.pop_front();
	}
}
