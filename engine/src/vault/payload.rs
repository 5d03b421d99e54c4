//! Wire payloads: an AES-256 key wrapped with RSA-OAEP-SHA-256 plus an
//! AES-GCM ciphertext whose associated data binds the payload to the caller.

use aes_gcm::{
	aead::{Aead, Payload},
	Aes256Gcm, KeyInit, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::{Oaep, RsaPrivateKey};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{constants::TS_SKEW, errors::CryptoError};

pub const SENSITIVE_DATA_PURPOSE: &str = "sensitive_data_encryption";

/// Inbound encrypted payload as posted by the browser. All fields required;
/// a missing field fails deserialization before this module is reached.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivePayload {
	/// RSA-OAEP-wrapped AES-256 key, base64.
	pub wrapped_key: String,
	/// AES-GCM nonce, base64.
	pub iv: String,
	/// AES-GCM ciphertext, base64.
	pub ciphertext: String,
	/// The exact JSON string the client used as associated data.
	pub aad: String,
	/// Client clock at encryption time, unix seconds.
	pub ts: i64,
}

#[derive(Debug, Deserialize)]
struct AadClaims {
	#[serde(rename = "user-id")]
	user_id: String,
	#[serde(rename = "session-id")]
	_session_id: String,
	ts: i64,
	purpose: String,
}

pub(super) fn open(
	rsa_private: &RsaPrivateKey,
	payload: &SensitivePayload,
	authenticated_user_id: &str,
) -> Result<String, CryptoError> {
	let now = chrono::Utc::now().timestamp();
	if (now - payload.ts).unsigned_abs() > TS_SKEW.as_secs() {
		return Err(CryptoError::StaleTimestamp);
	}

	let claims: AadClaims =
		serde_json::from_str(&payload.aad).map_err(|_| CryptoError::DecryptionFailed)?;
	if claims.ts != payload.ts || claims.purpose != SENSITIVE_DATA_PURPOSE {
		return Err(CryptoError::DecryptionFailed);
	}
	// The user binding is the security boundary; compare without early exit.
	if !bool::from(claims.user_id.as_bytes().ct_eq(authenticated_user_id.as_bytes())) {
		return Err(CryptoError::AadMismatch);
	}

	let wrapped_key = BASE64.decode(&payload.wrapped_key).map_err(|_| CryptoError::DecryptionFailed)?;
	let iv = BASE64.decode(&payload.iv).map_err(|_| CryptoError::DecryptionFailed)?;
	let ciphertext = BASE64.decode(&payload.ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
	if iv.len() != 12 {
		return Err(CryptoError::DecryptionFailed);
	}

	let session_key = rsa_private
		.decrypt(Oaep::new::<Sha256>(), &wrapped_key)
		.map_err(|_| CryptoError::DecryptionFailed)?;
	let cipher =
		Aes256Gcm::new_from_slice(&session_key).map_err(|_| CryptoError::DecryptionFailed)?;

	let plaintext = cipher
		.decrypt(
			Nonce::from_slice(&iv),
			Payload { msg: &ciphertext, aad: payload.aad.as_bytes() },
		)
		.map_err(|_| CryptoError::DecryptionFailed)?;

	String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::vault::Vault;
	use aes_gcm::aead::Aead;
	use rand::RngCore;
	use rsa::{pkcs8::DecodePublicKey, RsaPublicKey};

	/// Client-side construction of a payload, as the browser does it.
	fn seal_payload(vault: &Vault, plaintext: &str, user_id: &str, ts: i64) -> SensitivePayload {
		let public = RsaPublicKey::from_public_key_pem(vault.public_key_pem()).unwrap();

		let mut session_key = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut session_key);
		let mut iv = [0u8; 12];
		rand::thread_rng().fill_bytes(&mut iv);

		let aad = format!(
			r#"{{"user-id":"{user_id}","session-id":"sess-1","ts":{ts},"purpose":"{SENSITIVE_DATA_PURPOSE}"}}"#
		);

		let cipher = Aes256Gcm::new_from_slice(&session_key).unwrap();
		let ciphertext = cipher
			.encrypt(
				Nonce::from_slice(&iv),
				Payload { msg: plaintext.as_bytes(), aad: aad.as_bytes() },
			)
			.unwrap();

		let wrapped_key = public
			.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &session_key)
			.unwrap();

		SensitivePayload {
			wrapped_key: BASE64.encode(wrapped_key),
			iv: BASE64.encode(iv),
			ciphertext: BASE64.encode(ciphertext),
			aad,
			ts,
		}
	}

	#[test]
	fn wire_round_trip() {
		let vault = crate::vault::tests::test_vault();
		let now = chrono::Utc::now().timestamp();
		let payload = seal_payload(&vault, "exchange-api-secret", "user-1", now);
		assert_eq!(
			vault.decrypt_sensitive_data(&payload, "user-1").unwrap(),
			"exchange-api-secret"
		);
	}

	#[test]
	fn rejects_foreign_user_binding() {
		// Even a well-formed ciphertext under the right public key is refused
		// when the AAD names a different user.
		let vault = crate::vault::tests::test_vault();
		let now = chrono::Utc::now().timestamp();
		let payload = seal_payload(&vault, "secret", "user-v", now);
		assert!(matches!(
			vault.decrypt_sensitive_data(&payload, "user-u"),
			Err(CryptoError::AadMismatch)
		));
	}

	#[test]
	fn rejects_stale_timestamp() {
		let vault = crate::vault::tests::test_vault();
		let stale = chrono::Utc::now().timestamp() - TS_SKEW.as_secs() as i64 - 60;
		let payload = seal_payload(&vault, "secret", "user-1", stale);
		assert!(matches!(
			vault.decrypt_sensitive_data(&payload, "user-1"),
			Err(CryptoError::StaleTimestamp)
		));
	}

	#[test]
	fn rejects_wrong_purpose() {
		let vault = crate::vault::tests::test_vault();
		let now = chrono::Utc::now().timestamp();
		let mut payload = seal_payload(&vault, "secret", "user-1", now);
		payload.aad = payload.aad.replace(SENSITIVE_DATA_PURPOSE, "password_reset");
		assert!(vault.decrypt_sensitive_data(&payload, "user-1").is_err());
	}

	#[test]
	fn rejects_tampered_aad() {
		// Changing the AAD after encryption breaks the GCM tag even when the
		// claims inside it still match.
		let vault = crate::vault::tests::test_vault();
		let now = chrono::Utc::now().timestamp();
		let mut payload = seal_payload(&vault, "secret", "user-1", now);
		payload.aad = payload.aad.replace("sess-1", "sess-2");
		assert!(matches!(
			vault.decrypt_sensitive_data(&payload, "user-1"),
			Err(CryptoError::DecryptionFailed)
		));
	}
}
