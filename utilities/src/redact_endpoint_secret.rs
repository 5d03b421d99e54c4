use regex::Regex;
use serde::Deserialize;
use std::fmt::{self, Debug, Display};

const MAX_SECRET_CHARACTERS_REVEALED: usize = 3;
const SCHEMA_PADDING_LEN: usize = 3;

/// A wrapper around `String` that redacts a secret in the url when displayed or logged.
#[derive(Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(transparent)]
pub struct SecretUrl(String);

impl SecretUrl {
	pub fn as_ref(&self) -> &str {
		&self.0
	}

	pub fn into_inner(self) -> String {
		self.0
	}
}

impl Display for SecretUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", redact_secret_endpoint(&self.0))
	}
}

impl Debug for SecretUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", redact_secret_endpoint(&self.0))
	}
}

impl From<String> for SecretUrl {
	fn from(s: String) -> Self {
		SecretUrl(s)
	}
}

impl From<&str> for SecretUrl {
	fn from(s: &str) -> Self {
		SecretUrl(s.to_string())
	}
}

/// Partially redacts the secret in the url of the node endpoint.
///  eg: `wss://cdcd639308194d3f977a1a5a7ff0d545.rpc.thirdweb.com/` ->
/// `wss://cdc****.rpc.thirdweb.com/`
pub fn redact_secret_endpoint(endpoint: &str) -> String {
	const REGEX_SECRET: &str = "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}|[0-9a-zA-Z]{32,}";
	let re = Regex::new(REGEX_SECRET).expect("secret regex is valid");
	if re.is_match(endpoint) {
		// A 32 character hex string is a secret, redact it
		let mut endpoint_redacted = endpoint.to_string();
		// Just redact the first match so we do not get confused by multiple matches
		if let Some(capture) = re.find(endpoint) {
			endpoint_redacted = endpoint_redacted.replace(
				capture.as_str(),
				&format!(
					"{}****",
					&capture
						.as_str()
						.chars()
						.take(MAX_SECRET_CHARACTERS_REVEALED)
						.collect::<String>()
				),
			);
		}
		endpoint_redacted
	} else {
		// If the secret is not a hex string, redact almost everything
		let reveal_to = usize::min(
			MAX_SECRET_CHARACTERS_REVEALED +
				endpoint.find("://").map(|p| p + SCHEMA_PADDING_LEN).unwrap_or(0),
			endpoint.len(),
		);
		format!("{}****", &endpoint[..reveal_to])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_secret_web_addresses() {
		assert_eq!(
			format!(
				"{}",
				SecretUrl::from("wss://mainnet.infura.io/ws/v3/d52c362116b640b98a166d08d3170a42")
			),
			"wss://mainnet.infura.io/ws/v3/d52****"
		);
		assert_eq!(
			format!(
				"{}",
				SecretUrl::from(
					"wss://cdcd639308194d3f977a1a5a7ff0d545.rpc.thirdweb.com/"
				)
			),
			"wss://cdc****.rpc.thirdweb.com/"
		);
	}

	#[test]
	fn test_short_addresses() {
		assert_eq!(format!("{}", SecretUrl::from("wss://a")), "wss://a****");
		assert_eq!(format!("{}", SecretUrl::from("http://localhost:8080")), "http://loc****");
	}

	#[test]
	fn test_debug_is_redacted() {
		assert_eq!(
			format!(
				"{:?}",
				SecretUrl::from("wss://mainnet.infura.io/ws/v3/d52c362116b640b98a166d08d3170a42")
			),
			"\"wss://mainnet.infura.io/ws/v3/d52****\""
		);
	}
}
