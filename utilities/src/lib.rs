pub mod logging;
pub mod redact_endpoint_secret;

use core::time::Duration;

pub use redact_endpoint_secret::SecretUrl;

/// Makes a tick that outputs every `interval` but only if there's currently no tick pending.
/// The first tick can optionally complete immediately.
pub fn make_periodic_tick(interval: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() +
			if yield_immediately { Duration::ZERO } else { interval },
		interval,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

/// Returns a duration with uniform random jitter of up to `jitter_fraction` of `base` added,
/// used to avoid thundering-herd retries against rate-limited venues.
pub fn with_jitter(base: Duration, jitter_fraction: f64) -> Duration {
	use std::time::{SystemTime, UNIX_EPOCH};

	// A cheap source of randomness is enough for retry jitter.
	let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().subsec_nanos();
	let unit = f64::from(nanos) / f64::from(u32::MAX);
	base + base.mul_f64(jitter_fraction * unit)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_make_periodic_tick() {
		// Tick instantly, then on every interval
		let mut tick = make_periodic_tick(Duration::from_secs(100), true);
		tokio::time::timeout(Duration::from_millis(10), tick.tick()).await.unwrap();
		assert!(tokio::time::timeout(Duration::from_millis(10), tick.tick()).await.is_err());

		// First tick is delayed by the whole period
		let mut tick = make_periodic_tick(Duration::from_secs(100), false);
		assert!(tokio::time::timeout(Duration::from_millis(10), tick.tick()).await.is_err());
	}

	#[test]
	fn jitter_is_bounded() {
		let base = Duration::from_secs(10);
		for _ in 0..100 {
			let jittered = with_jitter(base, 0.5);
			assert!(jittered >= base);
			assert!(jittered <= base + base.mul_f64(0.5));
		}
	}
}
