use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. The filter defaults to `info`
/// and can be overridden with `RUST_LOG`.
pub fn init_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_target(true)
		.init();
}

/// Subscriber for unit tests: respects `RUST_LOG`, never panics if a
/// subscriber is already installed.
pub fn init_test_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
		)
		.with_test_writer()
		.try_init();
}
