use thiserror::Error;

/// Errors surfaced by venue adapters, categorised by how the agent loop must
/// react to them.
#[derive(Debug, Error)]
pub enum VenueError {
	/// Transient network / rate-limit / 5xx failures. Retried with backoff.
	#[error("venue request failed: {0}")]
	Retryable(String),

	/// Bad or expired credentials. The agent cycle aborts and records the reason.
	#[error("venue authentication failed: {0}")]
	Auth(String),

	/// The venue understood the request and refused it (insufficient margin,
	/// symbol rules, size below minimum). Fed into the next cycle's prompt.
	#[error("venue rejected order: {0}")]
	Business(String),
}

impl VenueError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, VenueError::Retryable(_))
	}

	/// Classify an HTTP response from a venue by status code and body.
	pub fn classify(status: reqwest::StatusCode, body: &str) -> Self {
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
		{
			VenueError::Auth(format!("{status}: {body}"))
		} else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
			VenueError::Retryable(format!("{status}: {body}"))
		} else {
			VenueError::Business(format!("{status}: {body}"))
		}
	}
}

impl From<reqwest::Error> for VenueError {
	fn from(e: reqwest::Error) -> Self {
		if e.is_timeout() || e.is_connect() {
			VenueError::Retryable(e.to_string())
		} else if let Some(status) = e.status() {
			VenueError::classify(status, &e.to_string())
		} else {
			VenueError::Retryable(e.to_string())
		}
	}
}

/// Errors from the AI decision subsystem. A failed cycle records the error and
/// issues no trades.
#[derive(Debug, Error)]
pub enum AiError {
	#[error("AI provider request failed: {0}")]
	Provider(String),

	#[error("AI provider timed out after {0} seconds")]
	Timeout(u64),

	#[error("AI response is not a valid decision list: {0}")]
	Malformed(String),
}

/// Errors from the secret vault. Everything except an AAD mismatch is reported
/// to callers as a generic decryption failure.
#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("payload is bound to a different caller")]
	AadMismatch,

	#[error("payload timestamp outside the accepted window")]
	StaleTimestamp,

	#[error("decryption failed")]
	DecryptionFailed,
}

/// Configuration / request-shape errors surfaced to HTTP callers as 4xx.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("{0}")]
	Invalid(String),

	#[error("{0} not found")]
	NotFound(String),
}
