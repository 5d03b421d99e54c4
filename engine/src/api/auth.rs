//! JWT session management: short-lived access tokens, rotating refresh
//! tokens, and an in-memory blacklist of revoked token ids.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::{ACCESS_TOKEN_TTL, JWT_ISSUER, REFRESH_TOKEN_TTL};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
	pub sub: String,
	pub iss: String,
	pub jti: String,
	pub exp: i64,
	pub iat: i64,
	/// "access" or "refresh"
	pub typ: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
	pub access_token: String,
	pub refresh_token: String,
	pub expires_in: u64,
}

/// Signing keys plus the revocation list. Shared read-mostly.
pub struct AuthKeys {
	encoding: EncodingKey,
	decoding: DecodingKey,
	/// jti -> expiry. Entries are pruned opportunistically.
	blacklist: RwLock<HashMap<String, i64>>,
}

impl AuthKeys {
	pub fn new(secret: &str) -> Self {
		Self {
			encoding: EncodingKey::from_secret(secret.as_bytes()),
			decoding: DecodingKey::from_secret(secret.as_bytes()),
			blacklist: RwLock::new(HashMap::new()),
		}
	}

	fn issue(&self, user_id: &str, typ: &str, ttl_seconds: i64) -> anyhow::Result<String> {
		let now = Utc::now().timestamp();
		let claims = Claims {
			sub: user_id.to_string(),
			iss: JWT_ISSUER.to_string(),
			jti: uuid::Uuid::new_v4().to_string(),
			exp: now + ttl_seconds,
			iat: now,
			typ: typ.to_string(),
		};
		Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
	}

	pub fn issue_pair(&self, user_id: &str) -> anyhow::Result<TokenPair> {
		Ok(TokenPair {
			access_token: self.issue(user_id, "access", ACCESS_TOKEN_TTL.as_secs() as i64)?,
			refresh_token: self.issue(user_id, "refresh", REFRESH_TOKEN_TTL.as_secs() as i64)?,
			expires_in: ACCESS_TOKEN_TTL.as_secs(),
		})
	}

	/// Validate signature, issuer, expiry, expected type, and revocation.
	pub fn verify(&self, token: &str, expected_typ: &str) -> Option<Claims> {
		let mut validation = Validation::new(Algorithm::HS256);
		validation.set_issuer(&[JWT_ISSUER]);
		let claims = decode::<Claims>(token, &self.decoding, &validation).ok()?.claims;
		if claims.typ != expected_typ {
			return None;
		}
		if self.blacklist.read().contains_key(&claims.jti) {
			return None;
		}
		Some(claims)
	}

	/// Revoke a token id until its natural expiry.
	pub fn blacklist(&self, jti: &str, exp: i64) {
		let now = Utc::now().timestamp();
		let mut blacklist = self.blacklist.write();
		blacklist.retain(|_, expiry| *expiry > now);
		blacklist.insert(jti.to_string(), exp);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pair_round_trip() {
		let keys = AuthKeys::new("unit-test-secret");
		let pair = keys.issue_pair("user-1").unwrap();

		let access = keys.verify(&pair.access_token, "access").unwrap();
		assert_eq!(access.sub, "user-1");
		assert_eq!(access.iss, JWT_ISSUER);

		// Type confusion is rejected both ways
		assert!(keys.verify(&pair.access_token, "refresh").is_none());
		assert!(keys.verify(&pair.refresh_token, "access").is_none());
		assert!(keys.verify(&pair.refresh_token, "refresh").is_some());
	}

	#[test]
	fn wrong_secret_rejected() {
		let keys = AuthKeys::new("secret-a");
		let other = AuthKeys::new("secret-b");
		let pair = keys.issue_pair("user-1").unwrap();
		assert!(other.verify(&pair.access_token, "access").is_none());
	}

	#[test]
	fn blacklisted_jti_is_dead() {
		let keys = AuthKeys::new("unit-test-secret");
		let pair = keys.issue_pair("user-1").unwrap();
		let claims = keys.verify(&pair.refresh_token, "refresh").unwrap();

		keys.blacklist(&claims.jti, claims.exp);
		assert!(keys.verify(&pair.refresh_token, "refresh").is_none());
		// The access token has its own jti and stays valid
		assert!(keys.verify(&pair.access_token, "access").is_some());
	}

	#[test]
	fn tokens_have_unique_jtis() {
		let keys = AuthKeys::new("unit-test-secret");
		let a = keys.issue_pair("u").unwrap();
		let b = keys.issue_pair("u").unwrap();
		let jti_a = keys.verify(&a.access_token, "access").unwrap().jti;
		let jti_b = keys.verify(&b.access_token, "access").unwrap().jti;
		assert_ne!(jti_a, jti_b);
	}
}
