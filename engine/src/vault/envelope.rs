//! Storage envelopes: `enc:v1:` + base64(nonce || ciphertext).

use aes_gcm::{aead::Aead, Aes256Gcm, Nonce};
use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::constants::STORAGE_ENVELOPE_PREFIX;

const NONCE_LEN: usize = 12;

/// True iff `value` is a storage envelope produced by [`seal`]. The prefix is
/// not valid base64 and no known credential format begins with it, so legacy
/// plaintext never false-positives.
pub fn is_encrypted_storage_value(value: &str) -> bool {
	value.starts_with(STORAGE_ENVELOPE_PREFIX)
}

pub(super) fn seal(cipher: &Aes256Gcm, plaintext: &str) -> anyhow::Result<String> {
	let mut nonce = [0u8; NONCE_LEN];
	rand::thread_rng().fill_bytes(&mut nonce);
	let ciphertext = cipher
		.encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
		.map_err(|_| anyhow::anyhow!("AES-GCM encryption failed"))?;

	let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
	blob.extend_from_slice(&nonce);
	blob.extend_from_slice(&ciphertext);

	Ok(format!("{STORAGE_ENVELOPE_PREFIX}{}", BASE64.encode(blob)))
}

pub(super) fn open(cipher: &Aes256Gcm, envelope: &str) -> anyhow::Result<String> {
	let encoded = envelope
		.strip_prefix(STORAGE_ENVELOPE_PREFIX)
		.context("Not a storage envelope")?;
	let blob = BASE64.decode(encoded).context("Envelope is not valid base64")?;
	if blob.len() <= NONCE_LEN {
		bail!("Envelope too short");
	}

	let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
	let plaintext = cipher
		.decrypt(Nonce::from_slice(nonce), ciphertext)
		.map_err(|_| anyhow::anyhow!("AES-GCM decryption failed"))?;

	String::from_utf8(plaintext).context("Decrypted credential is not UTF-8")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_envelopes_only() {
		assert!(is_encrypted_storage_value("enc:v1:AAAA"));
		assert!(!is_encrypted_storage_value("enc:v2:AAAA"));
		assert!(!is_encrypted_storage_value("ENC:V1:AAAA"));
		assert!(!is_encrypted_storage_value(""));
		assert!(!is_encrypted_storage_value("sk-live-abcdef"));
		// Base64 that happens to decode fine is still not an envelope
		assert!(!is_encrypted_storage_value("ZW5jOnYxOg=="));
	}

	#[test]
	fn tampered_envelope_fails() {
		let vault = crate::vault::tests::test_vault();
		let sealed = vault.encrypt_for_storage("credential").unwrap();
		let mut tampered = sealed.clone();
		tampered.pop();
		tampered.push(if sealed.ends_with('A') { 'B' } else { 'A' });
		assert!(vault.decrypt_from_storage(&tampered).is_err());
	}
}
