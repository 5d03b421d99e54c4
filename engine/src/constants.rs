use std::time::Duration;

// ======= Agent loop =======

/// Default scan interval for an agent whose configured interval is missing or invalid.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configured scan intervals below this are clamped up to it.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Fraction of the wallet balance an agent may commit as margin. The remainder
/// is a reserve for fees, slippage and the venue's liquidation buffer.
pub const AVAILABLE_MARGIN_FRACTION: f64 = 0.88;

/// Timeout applied to one AI provider call within a cycle.
pub const AI_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ======= Venue clients =======

/// Timeout applied to a single venue HTTP request.
pub const VENUE_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum retry attempts for retryable venue errors within one dispatch.
pub const VENUE_MAX_RETRIES: u32 = 3;

/// Base delay for venue retry backoff. Doubled per attempt, with jitter.
pub const VENUE_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

// ======= Market data hub =======

/// Interval between health polls of each registered kline source.
pub const SOURCE_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout for one kline fetch from a source.
pub const KLINE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a websocket-cached candle series is considered warm.
pub const CANDLE_CACHE_STALENESS: Duration = Duration::from_secs(120);

// ======= Secret vault =======

/// Accepted clock skew on encrypted wire payload timestamps, either direction.
pub const TS_SKEW: Duration = Duration::from_secs(300);

/// Prefix marking an encrypted storage envelope. Anything else is legacy plaintext.
pub const STORAGE_ENVELOPE_PREFIX: &str = "enc:v1:";

// ======= Auth =======

/// Access token lifetime.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Refresh token lifetime.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// JWT issuer claim.
pub const JWT_ISSUER: &str = "nofxAI";

// ======= Fleet views =======

/// How long competition / top-trader aggregations are served from cache.
pub const COMPETITION_CACHE_TTL: Duration = Duration::from_secs(10);

// ======= Settings environment variables =======

pub const ENV_DATA_ENCRYPTION_KEY: &str = "DATA_ENCRYPTION_KEY";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
pub const ENV_ENVIRONMENT: &str = "ENVIRONMENT";
pub const ENV_FRONTEND_URL: &str = "FRONTEND_URL";
pub const ENV_CORS_ALLOWED_ORIGINS: &str = "CORS_ALLOWED_ORIGINS";
pub const ENV_DISABLE_CORS: &str = "DISABLE_CORS";
pub const ENV_TRUST_PROXY: &str = "TRUST_PROXY";
pub const ENV_ENABLE_CSRF: &str = "ENABLE_CSRF";
pub const ENV_ENABLE_CLIENT_DECRYPT_API: &str = "ENABLE_CLIENT_DECRYPT_API";
pub const ENV_BACKEND_PORT: &str = "NOFX_BACKEND_PORT";
