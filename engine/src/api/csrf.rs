//! Double-submit-cookie CSRF protection. The server hands out a random token
//! which the client stores as a cookie and echoes in a header on every
//! mutating request, except for the explicitly exempt routes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

pub const CSRF_HEADER: &str = "X-CSRF-Token";
pub const CSRF_COOKIE: &str = "csrf_token";

/// Mutating routes that skip the CSRF check. The auth flow runs before any
/// cookie exists, and the model/exchange routes carry RSA-wrapped payloads
/// that are bound to the caller already.
const EXEMPT_PATHS: &[&str] = &[
	"/api/health",
	"/api/supported-models",
	"/api/supported-exchanges",
	"/api/csrf-token",
	"/api/crypto/public-key",
	"/api/login",
	"/api/register",
	"/api/verify-otp",
	"/api/complete-registration",
	"/api/models",
	"/api/exchanges",
];

pub fn generate_token() -> String {
	let mut bytes = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut bytes);
	URL_SAFE_NO_PAD.encode(bytes)
}

pub fn is_exempt(path: &str) -> bool {
	EXEMPT_PATHS.contains(&path)
}

/// Cookie-vs-header check for one request. `None` when the request passes.
pub fn check(
	method: &axum::http::Method,
	path: &str,
	header_token: Option<&str>,
	cookie_token: Option<&str>,
) -> Option<&'static str> {
	use axum::http::Method;
	if !matches!(*method, Method::POST | Method::PUT | Method::DELETE) {
		return None;
	}
	if is_exempt(path) {
		return None;
	}
	match (header_token, cookie_token) {
		(Some(header), Some(cookie)) if !header.is_empty() && header == cookie => None,
		_ => Some("CSRF token missing or mismatched"),
	}
}

/// Extract one cookie value from a Cookie header.
pub fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
	cookie_header.split(';').find_map(|pair| {
		let (key, value) = pair.trim().split_once('=')?;
		(key == name).then_some(value)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::Method;

	#[test]
	fn reads_are_never_checked() {
		assert!(check(&Method::GET, "/api/traders", None, None).is_none());
	}

	#[test]
	fn mutations_require_matching_tokens() {
		let token = generate_token();
		assert!(check(&Method::POST, "/api/traders", Some(&token), Some(&token)).is_none());
		assert!(check(&Method::POST, "/api/traders", Some(&token), Some("other")).is_some());
		assert!(check(&Method::POST, "/api/traders", None, Some(&token)).is_some());
		assert!(check(&Method::DELETE, "/api/traders/x", None, None).is_some());
		assert!(check(&Method::POST, "/api/traders", Some(""), Some("")).is_some());
	}

	#[test]
	fn exemptions() {
		assert!(check(&Method::POST, "/api/login", None, None).is_none());
		assert!(check(&Method::POST, "/api/register", None, None).is_none());
		assert!(check(&Method::POST, "/api/models", None, None).is_none());
		assert!(check(&Method::POST, "/api/exchanges", None, None).is_none());
		// Template reads are free (GET), writes are not exempt
		assert!(check(&Method::GET, "/api/prompt-templates/default", None, None).is_none());
		assert!(check(&Method::PUT, "/api/prompt-templates/default", None, None).is_some());
	}

	#[test]
	fn cookie_parsing() {
		let header = "a=1; csrf_token=abc123; b=2";
		assert_eq!(cookie_value(header, "csrf_token"), Some("abc123"));
		assert_eq!(cookie_value(header, "missing"), None);
	}

	#[test]
	fn tokens_are_random() {
		assert_ne!(generate_token(), generate_token());
	}
}
