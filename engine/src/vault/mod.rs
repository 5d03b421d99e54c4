//! Secret vault: envelope encryption of credentials at rest and decryption of
//! client-side-encrypted wire payloads bound to the caller.

mod envelope;
mod payload;

pub use envelope::is_encrypted_storage_value;
pub use payload::SensitivePayload;

use aes_gcm::{Aes256Gcm, KeyInit};
use anyhow::Context;
use rsa::{
	pkcs8::{EncodePublicKey, LineEnding},
	RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::CryptoError;

const RSA_KEY_BITS: usize = 2048;

/// Process-wide vault. Constructed once at startup, shared read-only.
pub struct Vault {
	storage_cipher: Aes256Gcm,
	rsa_private: RsaPrivateKey,
	rsa_public_pem: String,
}

impl Vault {
	/// Derives the storage key from the configured master secret and generates
	/// the wire RSA keypair. A missing or invalid master key is fatal upstream.
	pub fn new(master_key: &str) -> anyhow::Result<Self> {
		let mut key_bytes: [u8; 32] = Sha256::digest(master_key.as_bytes()).into();
		let storage_cipher = Aes256Gcm::new_from_slice(&key_bytes)
			.expect("SHA-256 output is a valid AES-256 key length");
		key_bytes.zeroize();

		let mut rng = rand::thread_rng();
		let rsa_private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
			.context("Failed to generate wire RSA keypair")?;
		let rsa_public_pem = RsaPublicKey::from(&rsa_private)
			.to_public_key_pem(LineEnding::LF)
			.context("Failed to encode RSA public key as PEM")?;

		Ok(Self { storage_cipher, rsa_private, rsa_public_pem })
	}

	/// PEM of the public half of the wire keypair, served to clients.
	pub fn public_key_pem(&self) -> &str {
		&self.rsa_public_pem
	}

	/// Encrypt a credential for persistence. Empty input stays empty so blank
	/// form fields never turn into envelopes.
	pub fn encrypt_for_storage(&self, plaintext: &str) -> anyhow::Result<String> {
		if plaintext.is_empty() {
			return Ok(String::new());
		}
		envelope::seal(&self.storage_cipher, plaintext)
	}

	/// Decrypt a persisted credential. Values without the envelope prefix are
	/// legacy plaintext from pre-encryption installs and pass through unchanged.
	pub fn decrypt_from_storage(&self, stored: &str) -> anyhow::Result<String> {
		if !is_encrypted_storage_value(stored) {
			return Ok(stored.to_string());
		}
		envelope::open(&self.storage_cipher, stored)
	}

	/// Decrypt an inbound wire payload, verifying its AAD binds it to the
	/// authenticated caller.
	pub fn decrypt_sensitive_data(
		&self,
		payload: &SensitivePayload,
		authenticated_user_id: &str,
	) -> Result<String, CryptoError> {
		payload::open(&self.rsa_private, payload, authenticated_user_id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	pub fn test_vault() -> Vault {
		Vault::new("an-entirely-adequate-unit-test-master-key").unwrap()
	}

	#[test]
	fn storage_round_trip() {
		let vault = test_vault();
		let sealed = vault.encrypt_for_storage("super-secret-api-key").unwrap();
		assert!(is_encrypted_storage_value(&sealed));
		assert_eq!(vault.decrypt_from_storage(&sealed).unwrap(), "super-secret-api-key");
	}

	#[test]
	fn empty_credential_stays_empty() {
		let vault = test_vault();
		assert_eq!(vault.encrypt_for_storage("").unwrap(), "");
	}

	#[test]
	fn legacy_plaintext_passes_through() {
		let vault = test_vault();
		for legacy in ["plain-api-key", "aGVsbG8gd29ybGQ=", "0x6fe2d3", ""] {
			assert_eq!(vault.decrypt_from_storage(legacy).unwrap(), legacy);
		}
	}

	#[test]
	fn envelopes_differ_per_encryption() {
		// Fresh nonce every call
		let vault = test_vault();
		let a = vault.encrypt_for_storage("same").unwrap();
		let b = vault.encrypt_for_storage("same").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn public_key_is_pem() {
		let vault = test_vault();
		assert!(vault.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
	}
}
