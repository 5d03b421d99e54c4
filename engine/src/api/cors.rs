//! CORS policy. Development allows loopback, `.local` and RFC-1918 origins so
//! the frontend can run anywhere on the LAN; production only admits the
//! configured whitelist.

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::settings::Settings;

/// True for origins acceptable in development: loopback, mDNS `.local`, and
/// private (RFC 1918) ranges, any port, http or https.
pub fn is_development_origin(origin: &str) -> bool {
	let Ok(url) = url::Url::parse(origin) else {
		return false;
	};
	if !matches!(url.scheme(), "http" | "https") {
		return false;
	}
	let Some(host) = url.host_str() else {
		return false;
	};
	if host == "localhost" || host.ends_with(".local") {
		return true;
	}
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		return match ip {
			std::net::IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
			std::net::IpAddr::V6(v6) => v6.is_loopback(),
		};
	}
	false
}

pub fn cors_layer(settings: &Settings) -> CorsLayer {
	let allow_origin = if settings.node.disable_cors {
		AllowOrigin::mirror_request()
	} else if settings.node.is_production() {
		let origins: Vec<HeaderValue> = settings
			.production_origins()
			.iter()
			.filter_map(|origin| origin.parse().ok())
			.collect();
		AllowOrigin::list(origins)
	} else {
		AllowOrigin::predicate(|origin: &HeaderValue, _| {
			origin.to_str().map(is_development_origin).unwrap_or(false)
		})
	};

	CorsLayer::new()
		.allow_origin(allow_origin)
		.allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
		.allow_headers([
			axum::http::header::CONTENT_TYPE,
			axum::http::header::AUTHORIZATION,
			super::csrf::CSRF_HEADER.parse().expect("static header name"),
		])
		.allow_credentials(true)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn development_origins() {
		assert!(is_development_origin("http://localhost:3000"));
		assert!(is_development_origin("http://127.0.0.1:5173"));
		assert!(is_development_origin("http://192.168.1.20:3000"));
		assert!(is_development_origin("http://10.0.0.5"));
		assert!(is_development_origin("https://devbox.local"));

		assert!(!is_development_origin("https://evil.example.com"));
		assert!(!is_development_origin("http://8.8.8.8"));
		assert!(!is_development_origin("ftp://localhost"));
		assert!(!is_development_origin("not-a-url"));
	}
}
