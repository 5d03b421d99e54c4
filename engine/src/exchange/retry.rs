//! Bounded retry with exponential backoff and jitter for retryable venue
//! errors. Auth and business errors surface immediately.

use std::future::Future;
use tracing::warn;

use crate::{
	constants::{VENUE_MAX_RETRIES, VENUE_RETRY_BASE_DELAY},
	errors::VenueError,
};
use nofx_utilities::with_jitter;

pub async fn with_retry<T, F, Fut>(request_name: &str, mut request: F) -> Result<T, VenueError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, VenueError>>,
{
	let mut attempt = 0u32;
	loop {
		match request().await {
			Ok(value) => return Ok(value),
			Err(error) if error.is_retryable() && attempt < VENUE_MAX_RETRIES => {
				let delay =
					with_jitter(VENUE_RETRY_BASE_DELAY * 2u32.saturating_pow(attempt), 0.5);
				warn!(
					request = request_name,
					attempt = attempt + 1,
					delay_ms = delay.as_millis() as u64,
					%error,
					"Retrying venue request"
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			},
			Err(error) => return Err(error),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test(start_paused = true)]
	async fn retries_transient_errors() {
		let calls = AtomicU32::new(0);
		let result = with_retry("test", || {
			let n = calls.fetch_add(1, Ordering::SeqCst);
			async move {
				if n < 2 {
					Err(VenueError::Retryable("flaky".to_string()))
				} else {
					Ok(42)
				}
			}
		})
		.await;
		assert_eq!(result.unwrap(), 42);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn auth_errors_surface_immediately() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = with_retry("test", || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(VenueError::Auth("bad key".to_string())) }
		})
		.await;
		assert!(matches!(result, Err(VenueError::Auth(_))));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn gives_up_after_bounded_attempts() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = with_retry("test", || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(VenueError::Retryable("down".to_string())) }
		})
		.await;
		assert!(matches!(result, Err(VenueError::Retryable(_))));
		assert_eq!(calls.load(Ordering::SeqCst), VENUE_MAX_RETRIES + 1);
	}
}
