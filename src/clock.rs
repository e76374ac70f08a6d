//! Wall-clock sources used for credential and upstream-token expiry arithmetic.

// std
use std::sync::Mutex;
// self
use crate::_prelude::*;

/// Source of the current UTC time.
pub trait Clock: Send + Sync + std::fmt::Debug {
	/// Current wall-clock time.
	fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Manually driven clock for deterministic expiry tests.
#[derive(Debug)]
pub struct ManualClock {
	now: Mutex<DateTime<Utc>>,
}
impl ManualClock {
	/// Start the clock at the given instant.
	pub fn new(start: DateTime<Utc>) -> Arc<Self> {
		Arc::new(Self { now: Mutex::new(start) })
	}

	/// Start the clock at a whole-second Unix timestamp.
	pub fn at_unix(secs: i64) -> Arc<Self> {
		Self::new(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
	}

	/// Move the clock forward.
	pub fn advance(&self, by: Duration) {
		let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
		let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

		*now = now.checked_add_signed(delta).unwrap_or(*now);
	}

	/// Jump to an absolute instant.
	pub fn set(&self, to: DateTime<Utc>) {
		*self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
	}
}
impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

/// Shared default clock.
pub fn system() -> Arc<dyn Clock> {
	Arc::new(SystemClock)
}
